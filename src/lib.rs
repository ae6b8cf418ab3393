//! Readout Gateway - ordered text-to-speech playback for voice rooms
//!
//! This library provides:
//! - A synthesis task pipeline (submitter, worker pool with retries, sweeper)
//! - Task queue and result store backends (in-memory and `SQLite`)
//! - Per-destination result pollers and playback queues
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   publish   ┌────────────┐   consume   ┌──────────────┐
//! │ TaskSubmitter├────────────►│ Task queue ├────────────►│ Worker pool  │
//! └──────────────┘             └────────────┘             │ (synthesize, │
//!                                                         │  retry)      │
//!                                                         └──────┬───────┘
//!                                       result + ready-list      │
//!                              ┌─────────────────────────────────▼┐
//!                              │ Result store (TTL) / ready-lists │
//!                              └────────────────┬─────────────────┘
//!                                               │ one per destination
//!                              ┌────────────────▼─────────────────┐
//!                              │ ResultPoller ──► PlaybackQueue   │
//!                              │                  ──► AudioSink   │
//!                              └──────────────────────────────────┘
//! ```
//!
//! Playback follows synthesis completion order within a destination.

pub mod broker;
pub mod config;
pub mod daemon;
pub mod db;
pub mod destinations;
pub mod error;
pub mod pipeline;
pub mod voice;

pub use config::Config;
pub use daemon::{Daemon, RunOptions};
pub use error::{Error, Result};
