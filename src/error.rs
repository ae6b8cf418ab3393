//! Error types for the readout gateway

use thiserror::Error;

/// Result type alias for readout operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the readout gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Text exceeds the configured maximum; no task is created
    #[error("text too long ({length}/{max} characters)")]
    InputRejected {
        /// Length of the rejected text in characters
        length: usize,
        /// Configured maximum
        max: usize,
    },

    /// Task queue backend unavailable at submission time
    #[error("task queue unavailable: {0}")]
    QueueUnavailable(String),

    /// Synthesis process exceeded its wall-clock budget
    #[error("synthesis timed out after {0:?}")]
    SynthesisTimeout(std::time::Duration),

    /// Synthesis process failed (spawn error, non-zero exit, missing output)
    #[error("synthesis failed: {0}")]
    SynthesisFailure(String),

    /// Synthesized artifact exceeds the size ceiling
    #[error("audio artifact too large ({size}/{max} bytes)")]
    OutputTooLarge {
        /// Artifact size in bytes
        size: u64,
        /// Configured ceiling
        max: u64,
    },

    /// Result was not consumed before its TTL elapsed
    #[error("result expired: {0}")]
    ResultExpired(String),

    /// Playback sink error
    #[error("playback error: {0}")]
    Playback(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl Error {
    /// Whether a synthesis failure is worth retrying
    ///
    /// Rejected input never changes between attempts, everything else the
    /// invoker reports may succeed on a later run.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::SynthesisTimeout(_)
                | Self::SynthesisFailure(_)
                | Self::OutputTooLarge { .. }
                | Self::Io(_)
        )
    }
}
