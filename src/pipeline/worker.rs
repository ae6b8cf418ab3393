//! Synthesis worker pool

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::retry::{RetryPolicy, delay_for_attempt};
use super::types::SynthesisResult;
use crate::Result;
use crate::broker::{Broker, Delivery};
use crate::config::WorkerConfig;
use crate::voice::Synthesizer;

/// Per-worker behavior
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub retry: RetryPolicy,
    /// Lifetime of stored results
    pub result_ttl: Duration,
    /// How long one queue poll waits for a task
    pub poll_interval: Duration,
}

impl From<&WorkerConfig> for WorkerSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            retry: config.retry.clone(),
            result_ttl: config.result_ttl,
            poll_interval: config.poll_interval,
        }
    }
}

/// What a worker did with one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Artifact stored as a `Ready` result
    Ready,
    /// Attempt failed and the task was returned to the queue
    Retrying {
        /// Failed attempts so far
        failed_attempts: u32,
        /// Time before the task becomes visible again
        delay: Duration,
    },
    /// Attempts exhausted (or the failure was permanent); stored as `Failed`
    Failed,
    /// A result already existed from an earlier delivery; nothing synthesized
    AlreadyDone,
}

/// One synthesis worker
pub struct Worker {
    id: usize,
    broker: Broker,
    synthesizer: Arc<dyn Synthesizer>,
    settings: WorkerSettings,
}

impl Worker {
    #[must_use]
    pub fn new(
        id: usize,
        broker: Broker,
        synthesizer: Arc<dyn Synthesizer>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            id,
            broker,
            synthesizer,
            settings,
        }
    }

    /// Wait up to one poll interval for a task and process it
    ///
    /// Returns `None` if no task became visible.
    ///
    /// # Errors
    ///
    /// Returns error if the queue or result store fails
    pub async fn run_once(&self) -> Result<Option<JobOutcome>> {
        match self.broker.queue.consume(self.settings.poll_interval).await? {
            Some(delivery) => self.process(&delivery).await.map(Some),
            None => Ok(None),
        }
    }

    /// Process one leased delivery
    ///
    /// The result is written before the ready-list is notified, which is
    /// written before the task is acked. A crash anywhere in between leads
    /// to a redelivery that finishes the remaining steps.
    ///
    /// # Errors
    ///
    /// Returns error if the queue or result store fails; the lease then
    /// lapses and the task is redelivered
    pub async fn process(&self, delivery: &Delivery) -> Result<JobOutcome> {
        let request = &delivery.request;
        let store = &self.broker.store;
        let queue = &self.broker.queue;

        if store.get(&request.id).await?.is_some() {
            tracing::debug!(
                worker = self.id,
                task_id = %request.id,
                "result already stored, completing redelivered task"
            );
            store.notify_ready(request.destination, &request.id).await?;
            queue.ack(delivery).await?;
            return Ok(JobOutcome::AlreadyDone);
        }
        if store.is_consumed(&request.id).await? {
            tracing::debug!(
                worker = self.id,
                task_id = %request.id,
                "result already consumed, dropping redelivered task"
            );
            queue.ack(delivery).await?;
            return Ok(JobOutcome::AlreadyDone);
        }

        let error = match self.synthesizer.synthesize(&request.text).await {
            Ok(artifact_path) => {
                let result =
                    SynthesisResult::ready(request, artifact_path, self.settings.result_ttl);
                store.put(&result).await?;
                store.notify_ready(request.destination, &request.id).await?;
                queue.ack(delivery).await?;

                tracing::debug!(
                    worker = self.id,
                    task_id = %request.id,
                    destination = %request.destination,
                    attempt = delivery.attempt + 1,
                    "synthesis ready"
                );
                return Ok(JobOutcome::Ready);
            }
            Err(e) => e,
        };

        let failed_attempts = delivery.attempt.saturating_add(1);
        if error.is_transient() && self.settings.retry.allows_retry(failed_attempts) {
            let delay = delay_for_attempt(&self.settings.retry, delivery.attempt);
            queue.nack(delivery, delay).await?;

            tracing::debug!(
                worker = self.id,
                task_id = %request.id,
                failed_attempts,
                delay_ms = delay.as_millis(),
                error = %error,
                "synthesis failed, retrying"
            );
            return Ok(JobOutcome::Retrying {
                failed_attempts,
                delay,
            });
        }

        let result = SynthesisResult::failed(request, error.to_string(), self.settings.result_ttl);
        store.put(&result).await?;
        store.notify_ready(request.destination, &request.id).await?;
        queue.ack(delivery).await?;

        tracing::warn!(
            worker = self.id,
            task_id = %request.id,
            destination = %request.destination,
            failed_attempts,
            error = %error,
            "synthesis failed permanently"
        );
        Ok(JobOutcome::Failed)
    }

    /// Process tasks until `shutdown` flips to `true`
    ///
    /// Shutdown is observed between jobs; a job in progress runs to
    /// completion unless the task is aborted.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::debug!(worker = self.id, "worker started");

        while !*shutdown.borrow() {
            let next = tokio::select! {
                _ = shutdown.changed() => break,
                next = self.broker.queue.consume(self.settings.poll_interval) => next,
            };

            match next {
                Ok(Some(delivery)) => {
                    if let Err(e) = self.process(&delivery).await {
                        tracing::warn!(
                            worker = self.id,
                            task_id = %delivery.request.id,
                            error = %e,
                            "task left for redelivery"
                        );
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(worker = self.id, error = %e, "queue unavailable");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        () = tokio::time::sleep(self.settings.poll_interval) => {}
                    }
                }
            }
        }

        tracing::debug!(worker = self.id, "worker stopped");
    }
}

/// A set of workers sharing one queue
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` workers (at least one)
    #[must_use]
    pub fn spawn(
        count: usize,
        broker: &Broker,
        synthesizer: &Arc<dyn Synthesizer>,
        settings: &WorkerSettings,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handles = (0..count.max(1))
            .map(|id| {
                let worker = Worker::new(
                    id,
                    broker.clone(),
                    Arc::clone(synthesizer),
                    settings.clone(),
                );
                tokio::spawn(worker.run(shutdown_rx.clone()))
            })
            .collect::<Vec<_>>();

        tracing::info!(workers = handles.len(), "worker pool started");
        Self { shutdown, handles }
    }

    /// Number of workers in the pool
    #[must_use]
    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Stop all workers, aborting any still busy after `grace`
    ///
    /// Aborting a worker kills its synthesis process; the task's lease
    /// lapses and another worker picks it up later.
    pub async fn shutdown(self, grace: Duration) {
        let _ = self.shutdown.send(true);

        let deadline = tokio::time::Instant::now() + grace;
        for mut handle in self.handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                handle.abort();
                tracing::warn!("worker did not stop in time, aborted");
            }
        }

        tracing::info!("worker pool stopped");
    }
}
