//! Pipeline data model

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A single playback target (one voice room and its sub-channel)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Destination {
    pub room_id: u64,
    pub channel_id: u64,
}

impl Destination {
    #[must_use]
    pub const fn new(room_id: u64, channel_id: u64) -> Self {
        Self {
            room_id,
            channel_id,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.room_id, self.channel_id)
    }
}

impl FromStr for Destination {
    type Err = String;

    /// Parse the `room/channel` form produced by `Display`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (room, channel) = s
            .split_once('/')
            .ok_or_else(|| format!("expected ROOM/CHANNEL, got {s:?}"))?;
        let room_id = room
            .trim()
            .parse()
            .map_err(|e| format!("invalid room id {room:?}: {e}"))?;
        let channel_id = channel
            .trim()
            .parse()
            .map_err(|e| format!("invalid channel id {channel:?}: {e}"))?;
        Ok(Self::new(room_id, channel_id))
    }
}

/// Opaque unique identifier of a synthesis task
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskId(String);

impl TaskId {
    /// Generate a fresh, globally unique id
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A request to turn text into audio for a destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisRequest {
    pub id: TaskId,
    pub text: String,
    pub destination: Destination,
    pub submitted_at: DateTime<Utc>,
}

impl SynthesisRequest {
    /// Create a request with a freshly generated id
    #[must_use]
    pub fn new(text: impl Into<String>, destination: Destination) -> Self {
        Self {
            id: TaskId::generate(),
            text: text.into(),
            destination,
            submitted_at: Utc::now(),
        }
    }
}

/// Terminal state of a synthesis task as seen by consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultStatus {
    /// Artifact synthesized and waiting to be played
    Ready,
    /// Synthesis gave up after exhausting its attempts
    Failed,
    /// TTL elapsed before the result was consumed
    Expired,
}

impl ResultStatus {
    /// Parse from the stored string form
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ready" => Some(Self::Ready),
            "failed" => Some(Self::Failed),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    /// Convert to string representation
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }
}

/// Outcome of a synthesis task, keyed by task id
///
/// `artifact_path` is present for `Ready` results (and kept on `Expired`
/// ones so the artifact can still be removed); `error` is present iff the
/// status is `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisResult {
    pub request_id: TaskId,
    pub destination: Destination,
    pub status: ResultStatus,
    pub artifact_path: Option<PathBuf>,
    pub error: Option<String>,
    /// When the originating request was submitted
    pub submitted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SynthesisResult {
    /// A successful result pointing at a synthesized artifact
    #[must_use]
    pub fn ready(request: &SynthesisRequest, artifact_path: PathBuf, ttl: Duration) -> Self {
        Self {
            request_id: request.id.clone(),
            destination: request.destination,
            status: ResultStatus::Ready,
            artifact_path: Some(artifact_path),
            error: None,
            submitted_at: request.submitted_at,
            expires_at: expiry_from_now(ttl),
        }
    }

    /// A terminal failure carrying the last error detail
    #[must_use]
    pub fn failed(request: &SynthesisRequest, error: impl Into<String>, ttl: Duration) -> Self {
        Self {
            request_id: request.id.clone(),
            destination: request.destination,
            status: ResultStatus::Failed,
            artifact_path: None,
            error: Some(error.into()),
            submitted_at: request.submitted_at,
            expires_at: expiry_from_now(ttl),
        }
    }

    /// Whether the TTL has elapsed at `now`
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Re-tag this result as expired, keeping the artifact path for cleanup
    #[must_use]
    pub fn into_expired(self) -> Self {
        Self {
            status: ResultStatus::Expired,
            error: None,
            ..self
        }
    }
}

/// One clip waiting in (or playing from) a destination's playback queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackItem {
    pub id: TaskId,
    pub artifact_path: PathBuf,
    pub destination: Destination,
}

/// Compute an absolute expiry timestamp from a TTL
#[must_use]
pub fn expiry_from_now(ttl: Duration) -> DateTime<Utc> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    Utc::now()
        .checked_add_signed(ttl)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_display() {
        assert_eq!(Destination::new(42, 7).to_string(), "42/7");
    }

    #[test]
    fn destination_parses_display_form() {
        assert_eq!("42/7".parse::<Destination>().unwrap(), Destination::new(42, 7));
        assert!("42".parse::<Destination>().is_err());
        assert!("room/7".parse::<Destination>().is_err());
    }

    #[test]
    fn task_ids_are_unique() {
        assert_ne!(TaskId::generate(), TaskId::generate());
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [ResultStatus::Ready, ResultStatus::Failed, ResultStatus::Expired] {
            assert_eq!(ResultStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ResultStatus::parse("pending"), None);
    }

    #[test]
    fn ready_result_has_artifact_and_no_error() {
        let request = SynthesisRequest::new("hello", Destination::new(1, 2));
        let ttl = Duration::from_secs(300);
        let result = SynthesisResult::ready(&request, PathBuf::from("/tmp/a.wav"), ttl);

        assert_eq!(result.status, ResultStatus::Ready);
        assert_eq!(result.artifact_path.as_deref(), Some(std::path::Path::new("/tmp/a.wav")));
        assert!(result.error.is_none());
        assert!(!result.is_expired_at(Utc::now()));
    }

    #[test]
    fn failed_result_has_error_and_no_artifact() {
        let request = SynthesisRequest::new("hello", Destination::new(1, 2));
        let result = SynthesisResult::failed(&request, "exit 1", Duration::from_secs(300));

        assert_eq!(result.status, ResultStatus::Failed);
        assert!(result.artifact_path.is_none());
        assert_eq!(result.error.as_deref(), Some("exit 1"));
    }

    #[test]
    fn zero_ttl_is_immediately_expired() {
        let request = SynthesisRequest::new("hello", Destination::new(1, 2));
        let result = SynthesisResult::ready(&request, PathBuf::from("/tmp/a.wav"), Duration::ZERO);
        assert!(result.is_expired_at(Utc::now()));

        let expired = result.into_expired();
        assert_eq!(expired.status, ResultStatus::Expired);
        assert!(expired.artifact_path.is_some());
    }
}
