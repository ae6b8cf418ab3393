//! Shared task queue and result store
//!
//! These are the only pieces of mutable state shared between the submitter,
//! the worker pool and the per-destination pollers. Two backends exist:
//!
//! - [`MemoryBroker`]: in-process, for a single-binary deployment and tests
//! - [`SqliteBroker`]: durable, shareable between worker processes

mod memory;
mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use memory::MemoryBroker;
pub use sqlite::SqliteBroker;

use crate::Result;
use crate::pipeline::{Destination, SynthesisRequest, SynthesisResult, TaskId};

/// A task handed to one consumer until it is acked, nacked, or its lease lapses
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The task itself
    pub request: SynthesisRequest,
    /// Number of attempts that already failed for this task
    pub attempt: u32,
    /// Lease token; acks and nacks with a stale receipt are ignored
    pub receipt: String,
}

/// Durable, at-least-once, multi-consumer task queue
///
/// A consumed task is leased to one consumer. If it is neither acked nor
/// nacked before the visibility timeout it becomes deliverable again, so a
/// crashed worker never loses a task.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Publish a new task
    ///
    /// # Errors
    ///
    /// Returns `QueueUnavailable` if the backend cannot accept the task
    async fn publish(&self, request: &SynthesisRequest) -> Result<()>;

    /// Lease the next visible task, waiting up to `wait` for one to appear
    async fn consume(&self, wait: Duration) -> Result<Option<Delivery>>;

    /// Remove a leased task for good
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Return a leased task to the queue after `delay`, counting one more failed attempt
    async fn nack(&self, delivery: &Delivery, delay: Duration) -> Result<()>;

    /// Number of tasks not yet acked
    async fn pending(&self) -> Result<usize>;
}

/// Key-value store of synthesis results with per-key expiry, plus the
/// per-destination ready-lists pollers block on
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Upsert a result keyed by its task id (last writer wins)
    async fn put(&self, result: &SynthesisResult) -> Result<()>;

    /// Look at a result without consuming it
    ///
    /// Consumed results are not returned.
    async fn get(&self, id: &TaskId) -> Result<Option<SynthesisResult>>;

    /// Atomically fetch and consume a result
    ///
    /// A result whose TTL has elapsed comes back tagged `Expired`. Only one
    /// caller ever receives a given result. The entry stays behind as a
    /// consumed marker until its TTL elapses, so a redelivered task can tell
    /// it was already handled.
    async fn take(&self, id: &TaskId) -> Result<Option<SynthesisResult>>;

    /// Whether the result for `id` was already consumed by [`ResultStore::take`]
    async fn is_consumed(&self, id: &TaskId) -> Result<bool>;

    /// Remove a result, returning whether it existed
    async fn delete(&self, id: &TaskId) -> Result<bool>;

    /// Append a finished task id to the destination's ready-list
    async fn notify_ready(&self, destination: Destination, id: &TaskId) -> Result<()>;

    /// Pop the oldest ready task id for a destination, waiting up to `timeout`
    async fn wait_ready(&self, destination: Destination, timeout: Duration)
    -> Result<Option<TaskId>>;

    /// Drop a destination's ready-list and mark every task submitted so far
    /// for it as orphaned
    ///
    /// Returns the number of ready entries discarded.
    async fn close_destination(&self, destination: Destination) -> Result<usize>;

    /// When the destination was last closed, if ever
    ///
    /// Results of tasks submitted at or before this instant are never played.
    async fn closed_at(&self, destination: Destination) -> Result<Option<DateTime<Utc>>>;

    /// Remove every result whose TTL has elapsed
    ///
    /// Returns the purged results that were never consumed, tagged `Expired`;
    /// their artifacts are still on disk.
    async fn purge_expired(&self) -> Result<Vec<SynthesisResult>>;

    /// Remove ready-list entries that no longer point at an unconsumed result
    ///
    /// Returns the number of entries removed.
    async fn purge_dangling_ready(&self) -> Result<usize>;
}

/// Queue and store handles sharing one backend
#[derive(Clone)]
pub struct Broker {
    pub queue: Arc<dyn TaskQueue>,
    pub store: Arc<dyn ResultStore>,
}

impl Broker {
    /// Build handles from a backend that implements both halves
    #[must_use]
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: TaskQueue + ResultStore + 'static,
    {
        Self {
            queue: backend.clone(),
            store: backend,
        }
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker").finish_non_exhaustive()
    }
}
