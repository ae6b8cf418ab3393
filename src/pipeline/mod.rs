//! Synthesis task pipeline
//!
//! ```text
//! submit ──► task queue ──► worker pool ──► result store + ready-list
//!                                                   │
//!                          playback queue ◄── poller (per destination)
//! ```

mod poller;
mod retry;
mod submitter;
mod sweeper;
mod types;
mod worker;

pub use poller::{Disposition, FailureNotice, PollerSettings, ResultPoller};
pub use retry::{RetryPolicy, delay_for_attempt};
pub use submitter::TaskSubmitter;
pub use sweeper::{SweepReport, Sweeper};
pub use types::{
    Destination, PlaybackItem, ResultStatus, SynthesisRequest, SynthesisResult, TaskId,
    expiry_from_now,
};
pub use worker::{JobOutcome, Worker, WorkerPool, WorkerSettings};
