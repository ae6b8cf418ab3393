//! Destination lifecycle
//!
//! Activating a destination starts its playback queue and result poller;
//! deactivating it stops the poller, clears its ready-list and drains the
//! queue. Synthesis tasks already submitted for the destination are left
//! alone; their results are never played, even if the destination comes
//! back, and expire unconsumed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

use crate::Result;
use crate::broker::ResultStore;
use crate::pipeline::{Destination, FailureNotice, PollerSettings, ResultPoller};
use crate::voice::{AudioSink, PlaybackHandle, spawn_playback};

/// How long a poller gets to notice shutdown before it is aborted
const POLLER_STOP_GRACE: Duration = Duration::from_secs(2);

struct ActiveDestination {
    playback: PlaybackHandle,
    playback_task: JoinHandle<()>,
    poller_task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

/// Owns the poller and playback queue of every active destination
pub struct DestinationManager {
    store: Arc<dyn ResultStore>,
    sink: Arc<dyn AudioSink>,
    settings: PollerSettings,
    notices: Option<mpsc::UnboundedSender<FailureNotice>>,
    active: Mutex<HashMap<Destination, ActiveDestination>>,
}

impl DestinationManager {
    #[must_use]
    pub fn new(
        store: Arc<dyn ResultStore>,
        sink: Arc<dyn AudioSink>,
        settings: PollerSettings,
    ) -> Self {
        Self {
            store,
            sink,
            settings,
            notices: None,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Forward failure notices from every poller to `notices`
    #[must_use]
    pub fn with_notices(mut self, notices: mpsc::UnboundedSender<FailureNotice>) -> Self {
        self.notices = Some(notices);
        self
    }

    /// Start playback for a destination; no-op if it is already active
    pub async fn activate(&self, destination: Destination) -> PlaybackHandle {
        let mut active = self.active.lock().await;
        if let Some(existing) = active.get(&destination) {
            return existing.playback.clone();
        }

        let (playback, playback_task) = spawn_playback(destination, Arc::clone(&self.sink));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let mut poller = ResultPoller::new(
            Arc::clone(&self.store),
            playback.clone(),
            self.settings.clone(),
        );
        if let Some(notices) = &self.notices {
            poller = poller.with_notices(notices.clone());
        }
        let poller_task = tokio::spawn(poller.run(shutdown_rx));

        active.insert(
            destination,
            ActiveDestination {
                playback: playback.clone(),
                playback_task,
                poller_task,
                shutdown,
            },
        );

        tracing::info!(%destination, "destination activated");
        playback
    }

    /// Tear a destination down
    ///
    /// Returns `false` if it was not active.
    ///
    /// # Errors
    ///
    /// Returns error if the result store or the playback queue fails
    pub async fn deactivate(&self, destination: Destination) -> Result<bool> {
        let Some(entry) = self.active.lock().await.remove(&destination) else {
            return Ok(false);
        };

        let _ = entry.shutdown.send(true);
        let mut poller_task = entry.poller_task;
        if tokio::time::timeout(POLLER_STOP_GRACE, &mut poller_task)
            .await
            .is_err()
        {
            poller_task.abort();
            tracing::warn!(%destination, "poller did not stop in time, aborted");
        }

        let discarded = entry.playback.drain().await?;
        let _ = entry.playback_task.await;
        let cleared = self.store.close_destination(destination).await?;

        tracing::info!(%destination, discarded, cleared, "destination deactivated");
        Ok(true)
    }

    /// Playback handle of an active destination
    pub async fn playback(&self, destination: Destination) -> Option<PlaybackHandle> {
        self.active
            .lock()
            .await
            .get(&destination)
            .map(|entry| entry.playback.clone())
    }

    /// Currently active destinations, sorted
    pub async fn active(&self) -> Vec<Destination> {
        let mut destinations: Vec<_> = self.active.lock().await.keys().copied().collect();
        destinations.sort_unstable();
        destinations
    }

    /// Deactivate every destination
    pub async fn shutdown(&self) {
        for destination in self.active().await {
            if let Err(e) = self.deactivate(destination).await {
                tracing::warn!(%destination, error = %e, "failed to deactivate destination");
            }
        }
    }
}
