//! In-process broker backend

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use super::{Delivery, ResultStore, TaskQueue};
use crate::Result;
use crate::pipeline::{Destination, ResultStatus, SynthesisRequest, SynthesisResult, TaskId};

/// Longest a waiter sleeps before re-checking for tasks whose delay elapsed
const RECHECK_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug)]
struct QueuedTask {
    request: SynthesisRequest,
    attempt: u32,
    visible_at: Instant,
    lease: Option<Lease>,
}

#[derive(Debug)]
struct Lease {
    receipt: String,
    expires_at: Instant,
}

impl QueuedTask {
    fn is_available(&self, now: Instant) -> bool {
        self.visible_at <= now && self.lease.as_ref().is_none_or(|l| l.expires_at <= now)
    }
}

#[derive(Debug)]
struct StoredResult {
    result: SynthesisResult,
    consumed: bool,
}

#[derive(Debug, Default)]
struct State {
    tasks: Vec<QueuedTask>,
    results: HashMap<TaskId, StoredResult>,
    ready: HashMap<Destination, VecDeque<TaskId>>,
    closed: HashMap<Destination, DateTime<Utc>>,
}

impl State {
    fn unconsumed(&self, id: &TaskId) -> Option<&SynthesisResult> {
        self.results
            .get(id)
            .filter(|stored| !stored.consumed)
            .map(|stored| &stored.result)
    }
}

/// Broker that keeps everything in process memory
///
/// Safe for concurrent producers and consumers within one process; nothing
/// survives a restart.
#[derive(Debug)]
pub struct MemoryBroker {
    state: Mutex<State>,
    visibility_timeout: Duration,
    task_signal: Notify,
    ready_signal: Notify,
}

impl MemoryBroker {
    /// Create an empty broker
    ///
    /// `visibility_timeout` is how long a consumed task stays leased before
    /// it is handed to another consumer.
    #[must_use]
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            visibility_timeout,
            task_signal: Notify::new(),
            ready_signal: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn try_lease(&self) -> Option<Delivery> {
        let now = Instant::now();
        let mut state = self.lock();
        let task = state.tasks.iter_mut().find(|t| t.is_available(now))?;

        let receipt = Uuid::new_v4().to_string();
        task.lease = Some(Lease {
            receipt: receipt.clone(),
            expires_at: now + self.visibility_timeout,
        });

        Some(Delivery {
            request: task.request.clone(),
            attempt: task.attempt,
            receipt,
        })
    }

    fn try_pop_ready(&self, destination: Destination) -> Option<TaskId> {
        self.lock()
            .ready
            .get_mut(&destination)
            .and_then(VecDeque::pop_front)
    }
}

fn holds_lease(task: &QueuedTask, delivery: &Delivery) -> bool {
    task.request.id == delivery.request.id
        && task
            .lease
            .as_ref()
            .is_some_and(|l| l.receipt == delivery.receipt)
}

#[async_trait]
impl TaskQueue for MemoryBroker {
    async fn publish(&self, request: &SynthesisRequest) -> Result<()> {
        self.lock().tasks.push(QueuedTask {
            request: request.clone(),
            attempt: 0,
            visible_at: Instant::now(),
            lease: None,
        });
        self.task_signal.notify_waiters();
        Ok(())
    }

    async fn consume(&self, wait: Duration) -> Result<Option<Delivery>> {
        let deadline = Instant::now() + wait;

        loop {
            let notified = self.task_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_lease() {
                return Ok(Some(delivery));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let nap = (deadline - now).min(RECHECK_INTERVAL);
            let _ = tokio::time::timeout(nap, notified).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut state = self.lock();
        let before = state.tasks.len();
        state.tasks.retain(|t| !holds_lease(t, delivery));

        if state.tasks.len() == before {
            tracing::debug!(task_id = %delivery.request.id, "ack for stale lease ignored");
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, delay: Duration) -> Result<()> {
        {
            let mut state = self.lock();
            let Some(task) = state.tasks.iter_mut().find(|t| holds_lease(t, delivery)) else {
                tracing::debug!(task_id = %delivery.request.id, "nack for stale lease ignored");
                return Ok(());
            };

            task.attempt = delivery.attempt + 1;
            task.visible_at = Instant::now() + delay;
            task.lease = None;
        }
        self.task_signal.notify_waiters();
        Ok(())
    }

    async fn pending(&self) -> Result<usize> {
        Ok(self.lock().tasks.len())
    }
}

#[async_trait]
impl ResultStore for MemoryBroker {
    async fn put(&self, result: &SynthesisResult) -> Result<()> {
        let mut state = self.lock();
        let consumed = state
            .results
            .get(&result.request_id)
            .is_some_and(|stored| stored.consumed);
        state.results.insert(
            result.request_id.clone(),
            StoredResult {
                result: result.clone(),
                consumed,
            },
        );
        Ok(())
    }

    async fn get(&self, id: &TaskId) -> Result<Option<SynthesisResult>> {
        Ok(self.lock().unconsumed(id).cloned())
    }

    async fn take(&self, id: &TaskId) -> Result<Option<SynthesisResult>> {
        let taken = {
            let mut state = self.lock();
            state
                .results
                .get_mut(id)
                .filter(|stored| !stored.consumed)
                .map(|stored| {
                    stored.consumed = true;
                    stored.result.clone()
                })
        };

        Ok(taken.map(|result| {
            if result.status != ResultStatus::Expired && result.is_expired_at(Utc::now()) {
                result.into_expired()
            } else {
                result
            }
        }))
    }

    async fn is_consumed(&self, id: &TaskId) -> Result<bool> {
        Ok(self.lock().results.get(id).is_some_and(|stored| stored.consumed))
    }

    async fn delete(&self, id: &TaskId) -> Result<bool> {
        Ok(self.lock().results.remove(id).is_some())
    }

    async fn notify_ready(&self, destination: Destination, id: &TaskId) -> Result<()> {
        self.lock()
            .ready
            .entry(destination)
            .or_default()
            .push_back(id.clone());
        self.ready_signal.notify_waiters();
        Ok(())
    }

    async fn wait_ready(
        &self,
        destination: Destination,
        timeout: Duration,
    ) -> Result<Option<TaskId>> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.ready_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(id) = self.try_pop_ready(destination) {
                return Ok(Some(id));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.try_pop_ready(destination));
            }
        }
    }

    async fn close_destination(&self, destination: Destination) -> Result<usize> {
        let mut state = self.lock();
        state.closed.insert(destination, Utc::now());
        Ok(state.ready.remove(&destination).map_or(0, |list| list.len()))
    }

    async fn closed_at(&self, destination: Destination) -> Result<Option<DateTime<Utc>>> {
        Ok(self.lock().closed.get(&destination).copied())
    }

    async fn purge_expired(&self) -> Result<Vec<SynthesisResult>> {
        let now = Utc::now();
        let mut state = self.lock();
        let expired: Vec<TaskId> = state
            .results
            .iter()
            .filter(|(_, stored)| stored.result.is_expired_at(now))
            .map(|(id, _)| id.clone())
            .collect();

        Ok(expired
            .iter()
            .filter_map(|id| state.results.remove(id))
            .filter(|stored| !stored.consumed)
            .map(|stored| stored.result.into_expired())
            .collect())
    }

    async fn purge_dangling_ready(&self) -> Result<usize> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let mut removed = 0;

        for list in state.ready.values_mut() {
            let before = list.len();
            list.retain(|id| {
                state
                    .results
                    .get(id)
                    .is_some_and(|stored| !stored.consumed)
            });
            removed += before - list.len();
        }
        state.ready.retain(|_, list| !list.is_empty());

        Ok(removed)
    }
}
