//! Per-destination playback queue
//!
//! [`PlaybackQueue`] is the state machine. [`spawn_playback`] runs one inside
//! an actor task that owns it, drives the audio sink and deletes artifacts.
//! The actor reacts to exactly two kinds of input: commands from
//! [`PlaybackHandle`] and the single "playback finished" event sent by the
//! task driving the sink.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::artifact::remove_artifact;
use super::sink::AudioSink;
use crate::pipeline::{Destination, PlaybackItem, TaskId};
use crate::{Error, Result};

/// Bound on queued commands per destination
const COMMAND_BUFFER: usize = 64;

/// Observable state of a destination's playback queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    /// Nothing playing, nothing queued
    Idle,
    /// Exactly one item active
    Playing,
    /// Being cleared; no new playback starts
    Draining,
}

/// What the queue decided to do with an enqueued item
#[derive(Debug, PartialEq, Eq)]
pub enum Enqueued {
    /// Queue was idle; the caller must start playing this item
    Start(PlaybackItem),
    /// Item waits behind the one in flight
    Queued {
        /// 1-based position among waiting items
        position: usize,
    },
    /// Queue is draining; the caller owns the item and must discard it
    Rejected(PlaybackItem),
}

/// Result of completing the in-flight item
#[derive(Debug, PartialEq, Eq)]
pub struct Advance {
    /// Item that finished; its artifact can now be deleted
    pub finished: PlaybackItem,
    /// New head to start, if any
    pub next: Option<PlaybackItem>,
}

/// Ordered playback queue for one destination
///
/// Each item is owned by exactly one of: the pending list, the in-flight
/// slot, or a value returned to the caller. That is what lets the caller
/// delete each artifact exactly once.
#[derive(Debug)]
pub struct PlaybackQueue {
    destination: Destination,
    in_flight: Option<PlaybackItem>,
    pending: VecDeque<PlaybackItem>,
    draining: bool,
}

impl PlaybackQueue {
    #[must_use]
    pub const fn new(destination: Destination) -> Self {
        Self {
            destination,
            in_flight: None,
            pending: VecDeque::new(),
            draining: false,
        }
    }

    #[must_use]
    pub const fn destination(&self) -> Destination {
        self.destination
    }

    #[must_use]
    pub const fn state(&self) -> PlaybackState {
        if self.draining {
            PlaybackState::Draining
        } else if self.in_flight.is_some() {
            PlaybackState::Playing
        } else {
            PlaybackState::Idle
        }
    }

    /// Item currently playing
    #[must_use]
    pub const fn now_playing(&self) -> Option<&PlaybackItem> {
        self.in_flight.as_ref()
    }

    /// Number of items waiting behind the one in flight
    #[must_use]
    pub fn queued(&self) -> usize {
        self.pending.len()
    }

    /// Append an item; start it immediately if the queue was idle
    pub fn enqueue(&mut self, item: PlaybackItem) -> Enqueued {
        if self.draining {
            return Enqueued::Rejected(item);
        }
        if self.in_flight.is_none() {
            self.in_flight = Some(item.clone());
            return Enqueued::Start(item);
        }
        self.pending.push_back(item);
        Enqueued::Queued {
            position: self.pending.len(),
        }
    }

    /// Record that the in-flight item finished (successfully or not)
    ///
    /// Returns `None` when `id` is not the item in flight, so a late or
    /// duplicate completion never advances the queue twice.
    pub fn complete(&mut self, id: &TaskId) -> Option<Advance> {
        if self.in_flight.as_ref().is_none_or(|item| &item.id != id) {
            return None;
        }
        let finished = self.in_flight.take()?;
        let next = if self.draining {
            None
        } else {
            self.pending.pop_front()
        };
        self.in_flight.clone_from(&next);
        Some(Advance { finished, next })
    }

    /// Stop accepting items and hand back everything queued or in flight
    pub fn drain(&mut self) -> Vec<PlaybackItem> {
        self.draining = true;
        self.in_flight
            .take()
            .into_iter()
            .chain(self.pending.drain(..))
            .collect()
    }
}

/// Snapshot of a destination's playback queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackStatus {
    pub state: PlaybackState,
    pub now_playing: Option<TaskId>,
    pub queued: usize,
    /// Items that finished playing (including ones the sink failed on)
    pub played: u64,
}

impl PlaybackStatus {
    const fn idle() -> Self {
        Self {
            state: PlaybackState::Idle,
            now_playing: None,
            queued: 0,
            played: 0,
        }
    }
}

#[derive(Debug)]
enum Command {
    Enqueue(PlaybackItem),
    Drain(oneshot::Sender<usize>),
}

/// The single "playback finished" event
#[derive(Debug)]
struct Finished {
    item_id: TaskId,
    outcome: Result<()>,
}

/// Handle to a destination's playback actor
#[derive(Debug, Clone)]
pub struct PlaybackHandle {
    destination: Destination,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<PlaybackStatus>,
}

impl PlaybackHandle {
    #[must_use]
    pub const fn destination(&self) -> Destination {
        self.destination
    }

    /// Hand an item to the queue
    ///
    /// # Errors
    ///
    /// Returns `Playback` if the queue has shut down; the artifact is
    /// deleted in that case
    pub async fn enqueue(&self, item: PlaybackItem) -> Result<()> {
        if let Err(mpsc::error::SendError(command)) =
            self.commands.send(Command::Enqueue(item)).await
        {
            if let Command::Enqueue(item) = command {
                remove_artifact(&item.artifact_path);
            }
            return Err(Error::Playback(format!(
                "playback queue for {} is closed",
                self.destination
            )));
        }
        Ok(())
    }

    /// Stop playback, discard everything queued and shut the actor down
    ///
    /// Returns the number of discarded items (in flight included).
    ///
    /// # Errors
    ///
    /// Returns `Playback` if the actor stopped before replying
    pub async fn drain(&self) -> Result<usize> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.commands.send(Command::Drain(reply_tx)).await.is_err() {
            return Ok(0);
        }
        reply_rx
            .await
            .map_err(|_| Error::Playback("playback queue stopped while draining".to_string()))
    }

    /// Current status snapshot
    #[must_use]
    pub fn status(&self) -> PlaybackStatus {
        self.status.borrow().clone()
    }

    /// Receiver notified on every status change
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<PlaybackStatus> {
        self.status.clone()
    }

    /// Whether the actor has stopped
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// Start the playback actor for a destination
pub fn spawn_playback(
    destination: Destination,
    sink: Arc<dyn AudioSink>,
) -> (PlaybackHandle, JoinHandle<()>) {
    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
    let (finished_tx, finished_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(PlaybackStatus::idle());

    let manager = PlaybackManager {
        queue: PlaybackQueue::new(destination),
        sink,
        finished_tx,
        current: None,
        status: status_tx,
        played: 0,
    };
    let task = tokio::spawn(manager.run(commands_rx, finished_rx));

    let handle = PlaybackHandle {
        destination,
        commands: commands_tx,
        status: status_rx,
    };
    (handle, task)
}

struct PlaybackManager {
    queue: PlaybackQueue,
    sink: Arc<dyn AudioSink>,
    finished_tx: mpsc::UnboundedSender<Finished>,
    current: Option<JoinHandle<()>>,
    status: watch::Sender<PlaybackStatus>,
    played: u64,
}

impl PlaybackManager {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut finished: mpsc::UnboundedReceiver<Finished>,
    ) {
        let destination = self.queue.destination();
        tracing::debug!(%destination, "playback queue started");

        loop {
            tokio::select! {
                Some(done) = finished.recv() => self.on_finished(done),
                command = commands.recv() => match command {
                    Some(Command::Enqueue(item)) => self.on_enqueue(item),
                    Some(Command::Drain(reply)) => {
                        let discarded = self.drain();
                        self.publish_status();
                        let _ = reply.send(discarded);
                        break;
                    }
                    None => {
                        self.drain();
                        self.publish_status();
                        break;
                    }
                },
            }
            self.publish_status();
        }

        tracing::debug!(%destination, played = self.played, "playback queue stopped");
    }

    fn on_enqueue(&mut self, item: PlaybackItem) {
        match self.queue.enqueue(item) {
            Enqueued::Start(item) => self.start(item),
            Enqueued::Queued { position } => {
                tracing::debug!(
                    destination = %self.queue.destination(),
                    position,
                    "clip queued"
                );
            }
            Enqueued::Rejected(item) => {
                tracing::debug!(task_id = %item.id, "queue draining, clip discarded");
                remove_artifact(&item.artifact_path);
            }
        }
    }

    fn on_finished(&mut self, done: Finished) {
        if let Err(e) = &done.outcome {
            tracing::warn!(
                destination = %self.queue.destination(),
                task_id = %done.item_id,
                error = %e,
                "playback failed, skipping clip"
            );
        }

        let Some(advance) = self.queue.complete(&done.item_id) else {
            tracing::debug!(task_id = %done.item_id, "ignoring stale playback completion");
            return;
        };

        self.current = None;
        self.played += 1;
        remove_artifact(&advance.finished.artifact_path);
        tracing::debug!(
            destination = %self.queue.destination(),
            task_id = %advance.finished.id,
            "playback finished"
        );

        if let Some(next) = advance.next {
            self.start(next);
        }
    }

    fn start(&mut self, item: PlaybackItem) {
        tracing::debug!(
            destination = %item.destination,
            task_id = %item.id,
            "playback started"
        );

        let sink = Arc::clone(&self.sink);
        let finished = self.finished_tx.clone();
        self.current = Some(tokio::spawn(async move {
            let outcome = AssertUnwindSafe(sink.play(&item))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(Error::Playback("audio sink panicked".to_string())));
            let _ = finished.send(Finished {
                item_id: item.id,
                outcome,
            });
        }));
    }

    fn drain(&mut self) -> usize {
        if let Some(current) = self.current.take() {
            current.abort();
        }
        let discarded = self.queue.drain();
        for item in &discarded {
            remove_artifact(&item.artifact_path);
        }
        if !discarded.is_empty() {
            tracing::info!(
                destination = %self.queue.destination(),
                discarded = discarded.len(),
                "playback queue drained"
            );
        }
        discarded.len()
    }

    fn publish_status(&self) {
        self.status.send_replace(PlaybackStatus {
            state: self.queue.state(),
            now_playing: self.queue.now_playing().map(|item| item.id.clone()),
            queued: self.queue.queued(),
            played: self.played,
        });
    }
}
