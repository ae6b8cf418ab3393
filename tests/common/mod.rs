//! Shared test utilities
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use readout_gateway::broker::{Broker, MemoryBroker, SqliteBroker};
use readout_gateway::db;
use readout_gateway::pipeline::{PlaybackItem, RetryPolicy, WorkerSettings};
use readout_gateway::voice::{AudioSink, Synthesizer};
use readout_gateway::{Error, Result};

/// Set up an in-memory broker
#[must_use]
pub fn memory_broker() -> (Arc<MemoryBroker>, Broker) {
    let backend = Arc::new(MemoryBroker::new(Duration::from_secs(30)));
    let broker = Broker::from_backend(backend.clone());
    (backend, broker)
}

/// Set up a broker over an in-memory `SQLite` database
#[must_use]
pub fn sqlite_broker(visibility_timeout: Duration) -> (Arc<SqliteBroker>, Broker) {
    let pool = db::init_memory().expect("failed to init test db");
    let backend = Arc::new(SqliteBroker::new(
        pool,
        visibility_timeout,
        Duration::from_millis(10),
    ));
    let broker = Broker::from_backend(backend.clone());
    (backend, broker)
}

/// Worker settings with fast polling and near-zero backoff
#[must_use]
pub fn fast_worker_settings(result_ttl: Duration) -> WorkerSettings {
    WorkerSettings {
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        },
        result_ttl,
        poll_interval: Duration::from_millis(10),
    }
}

/// Number of files in a directory
#[must_use]
pub fn file_count(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(Iterator::count).unwrap_or(0)
}

/// Poll `condition` until it holds, panicking after `timeout`
pub async fn wait_until<F>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(timeout, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Synthesizer that writes the text itself into the artifact
///
/// Per-text delays and failure counts let tests control completion order
/// and retries.
pub struct FakeSynthesizer {
    dir: PathBuf,
    delays: HashMap<String, Duration>,
    failures: HashMap<String, usize>,
    calls: Mutex<HashMap<String, usize>>,
    created: AtomicUsize,
}

impl FakeSynthesizer {
    #[must_use]
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            delays: HashMap::new(),
            failures: HashMap::new(),
            calls: Mutex::new(HashMap::new()),
            created: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn with_delay(mut self, text: &str, delay: Duration) -> Self {
        self.delays.insert(text.to_string(), delay);
        self
    }

    /// Fail the first `times` attempts for `text`
    #[must_use]
    pub fn failing(mut self, text: &str, times: usize) -> Self {
        self.failures.insert(text.to_string(), times);
        self
    }

    #[must_use]
    pub fn calls(&self, text: &str) -> usize {
        self.calls.lock().unwrap().get(text).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Synthesizer for FakeSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<PathBuf> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let n = calls.entry(text.to_string()).or_default();
            *n += 1;
            *n
        };

        if let Some(delay) = self.delays.get(text) {
            tokio::time::sleep(*delay).await;
        }
        if call <= self.failures.get(text).copied().unwrap_or(0) {
            return Err(Error::SynthesisFailure(format!("engine crashed on {text}")));
        }

        let path = self.dir.join(format!("{}.wav", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, text).await?;
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(path)
    }
}

/// Sink that reads each artifact's text and records play order and overlap
pub struct RecordingSink {
    duration: Duration,
    fail_on: Option<String>,
    played: Mutex<Vec<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl RecordingSink {
    #[must_use]
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            fail_on: None,
            played: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    /// Report a playback error for this text (after "playing" it)
    #[must_use]
    pub fn failing_on(mut self, text: &str) -> Self {
        self.fail_on = Some(text.to_string());
        self
    }

    #[must_use]
    pub fn played(&self) -> Vec<String> {
        self.played.lock().unwrap().clone()
    }

    #[must_use]
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioSink for RecordingSink {
    async fn play(&self, item: &PlaybackItem) -> Result<()> {
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        let text = tokio::fs::read_to_string(&item.artifact_path).await;
        tokio::time::sleep(self.duration).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        let text = text.map_err(|e| Error::Playback(e.to_string()))?;
        self.played.lock().unwrap().push(text.clone());

        if self.fail_on.as_deref() == Some(text.as_str()) {
            return Err(Error::Playback(format!("device lost while playing {text}")));
        }
        Ok(())
    }
}
