//! Per-destination result poller
//!
//! Every finished task passes through [`ResultPoller::handle`], the one
//! place that decides between playing a clip and dropping it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use super::types::{Destination, PlaybackItem, ResultStatus, SynthesisResult, TaskId};
use crate::broker::ResultStore;
use crate::config::Config;
use crate::voice::{PlaybackHandle, artifact_size, remove_artifact};
use crate::{Error, Result};

/// Poller behavior
#[derive(Debug, Clone)]
pub struct PollerSettings {
    /// Largest artifact that will be played
    pub max_artifact_bytes: u64,
    /// Ready-list wait before re-checking liveness
    pub wait_timeout: Duration,
}

impl From<&Config> for PollerSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_artifact_bytes: config.synthesis.max_artifact_bytes,
            wait_timeout: config.playback.ready_wait_timeout,
        }
    }
}

/// Tells the requester a text will not be played
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureNotice {
    pub request_id: TaskId,
    pub destination: Destination,
    /// `Failed` or `Expired`
    pub status: ResultStatus,
    pub reason: String,
}

/// What the poller did with one finished task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Handed to the playback queue
    Enqueued,
    /// Not played
    Dropped(FailureNotice),
    /// Result already consumed or purged
    Missing,
    /// Submitted before the destination was last torn down; left to expire
    Orphaned,
}

/// Moves finished results for one destination into its playback queue
pub struct ResultPoller {
    destination: Destination,
    store: Arc<dyn ResultStore>,
    playback: PlaybackHandle,
    settings: PollerSettings,
    notices: Option<mpsc::UnboundedSender<FailureNotice>>,
}

impl ResultPoller {
    #[must_use]
    pub fn new(
        store: Arc<dyn ResultStore>,
        playback: PlaybackHandle,
        settings: PollerSettings,
    ) -> Self {
        Self {
            destination: playback.destination(),
            store,
            playback,
            settings,
            notices: None,
        }
    }

    /// Send a [`FailureNotice`] for every dropped result
    #[must_use]
    pub fn with_notices(mut self, notices: mpsc::UnboundedSender<FailureNotice>) -> Self {
        self.notices = Some(notices);
        self
    }

    /// Wait for the next finished task and dispose of it
    ///
    /// Returns `None` if nothing finished within the wait timeout.
    ///
    /// # Errors
    ///
    /// Returns error if the result store fails or the playback queue is closed
    pub async fn poll_once(&self) -> Result<Option<Disposition>> {
        match self
            .store
            .wait_ready(self.destination, self.settings.wait_timeout)
            .await?
        {
            Some(id) => self.handle(&id).await.map(Some),
            None => Ok(None),
        }
    }

    /// Consume the result for `id` and decide its fate
    ///
    /// # Errors
    ///
    /// Returns error if the result store fails or the playback queue is closed
    pub async fn handle(&self, id: &TaskId) -> Result<Disposition> {
        let Some(peeked) = self.store.get(id).await? else {
            tracing::debug!(task_id = %id, "result already consumed or purged");
            return Ok(Disposition::Missing);
        };
        if self.is_orphan(&peeked).await? {
            tracing::debug!(
                destination = %self.destination,
                task_id = %id,
                "result predates this activation, leaving it to expire"
            );
            return Ok(Disposition::Orphaned);
        }

        let Some(result) = self.store.take(id).await? else {
            tracing::debug!(task_id = %id, "result already consumed or purged");
            return Ok(Disposition::Missing);
        };

        match result.status {
            ResultStatus::Ready => match self.verify(&result) {
                Ok(item) => {
                    self.playback.enqueue(item).await?;
                    Ok(Disposition::Enqueued)
                }
                Err(e) => {
                    if let Some(path) = &result.artifact_path {
                        remove_artifact(path);
                    }
                    Ok(self.drop_result(&result, ResultStatus::Failed, e.to_string()))
                }
            },
            ResultStatus::Failed => {
                let reason = result
                    .error
                    .clone()
                    .unwrap_or_else(|| "synthesis failed".to_string());
                Ok(self.drop_result(&result, ResultStatus::Failed, reason))
            }
            ResultStatus::Expired => {
                if let Some(path) = &result.artifact_path {
                    remove_artifact(path);
                }
                let reason = Error::ResultExpired(id.to_string()).to_string();
                Ok(self.drop_result(&result, ResultStatus::Expired, reason))
            }
        }
    }

    /// Whether the task was submitted before the destination was last closed
    async fn is_orphan(&self, result: &SynthesisResult) -> Result<bool> {
        Ok(self
            .store
            .closed_at(self.destination)
            .await?
            .is_some_and(|closed| result.submitted_at <= closed))
    }

    fn verify(&self, result: &SynthesisResult) -> Result<PlaybackItem> {
        let path = result
            .artifact_path
            .clone()
            .ok_or_else(|| Error::SynthesisFailure("ready result without artifact".to_string()))?;

        match artifact_size(&path) {
            None => Err(Error::SynthesisFailure(format!(
                "artifact {} is gone",
                path.display()
            ))),
            Some(size) if size > self.settings.max_artifact_bytes => Err(Error::OutputTooLarge {
                size,
                max: self.settings.max_artifact_bytes,
            }),
            Some(_) => Ok(PlaybackItem {
                id: result.request_id.clone(),
                artifact_path: path,
                destination: result.destination,
            }),
        }
    }

    fn drop_result(
        &self,
        result: &SynthesisResult,
        status: ResultStatus,
        reason: String,
    ) -> Disposition {
        tracing::info!(
            destination = %self.destination,
            task_id = %result.request_id,
            status = status.as_str(),
            reason = %reason,
            "dropping text from playback"
        );

        let notice = FailureNotice {
            request_id: result.request_id.clone(),
            destination: self.destination,
            status,
            reason,
        };
        if let Some(notices) = &self.notices {
            let _ = notices.send(notice.clone());
        }
        Disposition::Dropped(notice)
    }

    /// Poll until `shutdown` flips to `true` or the playback queue closes
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::debug!(destination = %self.destination, "poller started");

        while !*shutdown.borrow() && !self.playback.is_closed() {
            let next = tokio::select! {
                _ = shutdown.changed() => break,
                next = self.store.wait_ready(self.destination, self.settings.wait_timeout) => next,
            };

            match next {
                Ok(Some(id)) => {
                    if let Err(e) = self.handle(&id).await {
                        tracing::warn!(
                            destination = %self.destination,
                            task_id = %id,
                            error = %e,
                            "failed to hand result to playback"
                        );
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        destination = %self.destination,
                        error = %e,
                        "ready-list unavailable"
                    );
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        () = tokio::time::sleep(self.settings.wait_timeout) => {}
                    }
                }
            }
        }

        tracing::debug!(destination = %self.destination, "poller stopped");
    }
}
