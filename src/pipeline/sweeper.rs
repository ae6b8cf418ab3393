//! Periodic artifact cleanup
//!
//! Safety net for artifacts leaked by crashed workers or results nobody
//! consumed. The playback queue remains the primary cleanup path.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::watch;

use crate::Result;
use crate::broker::ResultStore;
use crate::voice::remove_artifact;

/// What one sweep removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Results purged from the store because their TTL elapsed
    pub expired_results: usize,
    /// Files deleted from the scratch directory
    pub artifacts_removed: usize,
    /// Ready-list entries whose result is gone or already consumed
    pub ready_entries_removed: usize,
}

/// Deletes expired results and stale scratch files
pub struct Sweeper {
    store: Arc<dyn ResultStore>,
    scratch_dir: PathBuf,
    retention: Duration,
    interval: Duration,
}

impl Sweeper {
    #[must_use]
    pub fn new(
        store: Arc<dyn ResultStore>,
        scratch_dir: PathBuf,
        retention: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            scratch_dir,
            retention,
            interval,
        }
    }

    /// Run one sweep
    ///
    /// # Errors
    ///
    /// Returns error if the result store fails
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for result in self.store.purge_expired().await? {
            report.expired_results += 1;
            if let Some(path) = &result.artifact_path
                && remove_artifact(path)
            {
                report.artifacts_removed += 1;
            }
        }

        report.ready_entries_removed = self.store.purge_dangling_ready().await?;

        let dir = self.scratch_dir.clone();
        let retention = self.retention;
        report.artifacts_removed += tokio::task::spawn_blocking(move || {
            remove_stale_files(&dir, retention, SystemTime::now())
        })
        .await
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "scratch scan panicked");
            0
        });

        if report != SweepReport::default() {
            tracing::info!(
                expired_results = report.expired_results,
                artifacts_removed = report.artifacts_removed,
                ready_entries_removed = report.ready_entries_removed,
                "sweep complete"
            );
        }
        Ok(report)
    }

    /// Sweep every interval until `shutdown` flips to `true`
    ///
    /// The first sweep runs immediately.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::debug!(
            interval_secs = self.interval.as_secs(),
            retention_secs = self.retention.as_secs(),
            "sweeper started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        tracing::warn!(error = %e, "sweep failed");
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }
        }

        tracing::debug!("sweeper stopped");
    }
}

/// Delete regular files in `dir` last modified more than `retention` before `now`
fn remove_stale_files(dir: &Path, retention: Duration, now: SystemTime) -> usize {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "cannot scan scratch directory");
            return 0;
        }
    };

    entries
        .filter_map(std::result::Result::ok)
        .filter(|entry| {
            entry.metadata().is_ok_and(|meta| {
                meta.is_file()
                    && meta
                        .modified()
                        .ok()
                        .and_then(|modified| now.duration_since(modified).ok())
                        .is_some_and(|age| age > retention)
            })
        })
        .filter(|entry| remove_artifact(&entry.path()))
        .count()
}
