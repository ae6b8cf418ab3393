//! Configuration management for the readout gateway
//!
//! Sources, lowest priority first: built-in defaults, the TOML file
//! (see [`file`]), then `READOUT_*` environment variables.

pub mod file;

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub use file::{ReadoutConfigFile, config_file_path, load_config_file, load_config_file_from};

use crate::pipeline::RetryPolicy;
use crate::{Error, Result};

/// Placeholder in synthesizer arguments replaced by the artifact path
pub const OUTPUT_PLACEHOLDER: &str = "{output}";

/// Placeholder in player arguments replaced by the artifact path
pub const INPUT_PLACEHOLDER: &str = "{input}";

/// Readout gateway configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Synthesis process and its limits
    pub synthesis: SynthesisConfig,

    /// Worker pool behavior
    pub worker: WorkerConfig,

    /// Playback behavior
    pub playback: PlaybackConfig,

    /// Artifact housekeeping
    pub housekeeping: HousekeepingConfig,

    /// Task queue / result store backend
    pub broker: BrokerBackend,
}

/// Synthesis process configuration
#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    /// Program to run (text is written to its stdin)
    pub program: String,

    /// Arguments; must contain `{output}`
    pub args: Vec<String>,

    /// Directory artifacts are written to
    pub scratch_dir: PathBuf,

    /// Wall-clock budget per invocation
    pub timeout: Duration,

    /// Maximum input length in characters
    pub max_text_length: usize,

    /// Maximum artifact size in bytes
    pub max_artifact_bytes: u64,
}

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of workers spawned by `run` and `worker`
    pub concurrency: usize,

    /// Attempts and backoff between them
    pub retry: RetryPolicy,

    /// Lifetime of stored results
    pub result_ttl: Duration,

    /// How long an idle worker waits on the queue per poll
    pub poll_interval: Duration,

    /// How long a consumed task stays leased to one worker
    pub visibility_timeout: Duration,
}

/// Playback configuration
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// External player; `None` plays silently in real time
    pub player: Option<PlayerCommand>,

    /// Ready-list wait before a poller re-checks liveness
    pub ready_wait_timeout: Duration,
}

/// External audio player invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerCommand {
    /// Player program (e.g. "aplay")
    pub program: String,

    /// Arguments; `{input}` is replaced with the artifact path, or the path
    /// is appended when no argument contains it
    pub args: Vec<String>,
}

/// Artifact housekeeping configuration
#[derive(Debug, Clone)]
pub struct HousekeepingConfig {
    /// Age after which artifacts are removed regardless of references
    pub retention: Duration,

    /// Interval between sweeps
    pub sweep_interval: Duration,
}

/// Task queue / result store backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerBackend {
    /// In-process queue; only useful when workers and pollers share a process
    Memory,
    /// Shared `SQLite` database file
    Sqlite {
        /// Database file
        path: PathBuf,
    },
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            program: "open_jtalk".to_string(),
            args: [
                "-x",
                "/var/lib/mecab/dic/open-jtalk/naist-jdic",
                "-m",
                "/usr/share/hts-voice/mei/mei_normal.htsvoice",
                "-fm",
                "-5",
                "-r",
                "1.0",
                "-ow",
                OUTPUT_PLACEHOLDER,
            ]
            .into_iter()
            .map(ToString::to_string)
            .collect(),
            scratch_dir: std::env::temp_dir().join("readout"),
            timeout: Duration::from_secs(30),
            max_text_length: 150,
            max_artifact_bytes: 10_000_000,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            retry: RetryPolicy::default(),
            result_ttl: Duration::from_secs(300),
            poll_interval: Duration::from_millis(500),
            visibility_timeout: Duration::from_secs(120),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            player: None,
            ready_wait_timeout: Duration::from_secs(1),
        }
    }
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(3600),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            synthesis: SynthesisConfig::default(),
            worker: WorkerConfig::default(),
            playback: PlaybackConfig::default(),
            housekeeping: HousekeepingConfig::default(),
            broker: BrokerBackend::Sqlite {
                path: default_database_path(),
            },
        }
    }
}

/// Return the default database path: `~/.local/share/readout/readout.db` on Linux
#[must_use]
pub fn default_database_path() -> PathBuf {
    directories::ProjectDirs::from("dev", "omni", "readout")
        .map_or_else(|| PathBuf::from("."), |d| d.data_dir().to_path_buf())
        .join("readout.db")
}

impl Config {
    /// Load configuration from the standard file and the process environment
    ///
    /// # Errors
    ///
    /// Returns error if an environment override is malformed or the result is invalid
    pub fn load() -> Result<Self> {
        Self::from_sources(load_config_file(), |key| std::env::var(key).ok())
    }

    /// Load configuration from an explicit file and the process environment
    ///
    /// # Errors
    ///
    /// Returns error if an environment override is malformed or the result is invalid
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        Self::from_sources(load_config_file_from(path), |key| std::env::var(key).ok())
    }

    /// Build configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if an environment override is malformed or the result is invalid
    pub fn from_sources<F>(file: ReadoutConfigFile, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        config.apply_file(file)?;
        config.apply_env(&env)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, file: ReadoutConfigFile) -> Result<()> {
        let s = file.synthesis;
        if let Some(program) = s.program {
            self.synthesis.program = program;
        }
        if let Some(args) = s.args {
            self.synthesis.args = args;
        }
        if let Some(dir) = s.scratch_dir {
            self.synthesis.scratch_dir = dir;
        }
        if let Some(secs) = s.timeout_secs {
            self.synthesis.timeout = Duration::from_secs(secs);
        }
        if let Some(max) = s.max_text_length {
            self.synthesis.max_text_length = max;
        }
        if let Some(max) = s.max_artifact_bytes {
            self.synthesis.max_artifact_bytes = max;
        }

        let w = file.worker;
        if let Some(n) = w.concurrency {
            self.worker.concurrency = n;
        }
        if let Some(n) = w.max_attempts {
            self.worker.retry.max_attempts = n;
        }
        if let Some(ms) = w.backoff_base_ms {
            self.worker.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = w.backoff_max_ms {
            self.worker.retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = w.result_ttl_secs {
            self.worker.result_ttl = Duration::from_secs(secs);
        }
        if let Some(ms) = w.poll_interval_ms {
            self.worker.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = w.visibility_timeout_secs {
            self.worker.visibility_timeout = Duration::from_secs(secs);
        }

        let p = file.playback;
        if let Some(program) = p.player {
            self.playback.player = Some(PlayerCommand {
                program,
                args: p.player_args.unwrap_or_default(),
            });
        }
        if let Some(ms) = p.ready_wait_timeout_ms {
            self.playback.ready_wait_timeout = Duration::from_millis(ms);
        }

        let h = file.housekeeping;
        if let Some(secs) = h.retention_secs {
            self.housekeeping.retention = Duration::from_secs(secs);
        }
        if let Some(secs) = h.sweep_interval_secs {
            self.housekeeping.sweep_interval = Duration::from_secs(secs);
        }

        let b = file.broker;
        self.broker = parse_backend(b.backend.as_deref(), b.database_path, &self.broker)?;

        Ok(())
    }

    fn apply_env<F>(&mut self, env: &F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(program) = env("READOUT_SYNTH_PROGRAM") {
            self.synthesis.program = program;
        }
        if let Some(dir) = env("READOUT_SCRATCH_DIR") {
            self.synthesis.scratch_dir = PathBuf::from(dir);
        }
        if let Some(secs) = parse_env::<u64, _>(env, "READOUT_SYNTH_TIMEOUT_SECS")? {
            self.synthesis.timeout = Duration::from_secs(secs);
        }
        if let Some(max) = parse_env(env, "READOUT_MAX_TEXT_LENGTH")? {
            self.synthesis.max_text_length = max;
        }
        if let Some(max) = parse_env(env, "READOUT_MAX_ARTIFACT_BYTES")? {
            self.synthesis.max_artifact_bytes = max;
        }
        if let Some(n) = parse_env(env, "READOUT_WORKERS")? {
            self.worker.concurrency = n;
        }
        if let Some(n) = parse_env(env, "READOUT_MAX_ATTEMPTS")? {
            self.worker.retry.max_attempts = n;
        }
        if let Some(ms) = parse_env::<u64, _>(env, "READOUT_BACKOFF_BASE_MS")? {
            self.worker.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_env::<u64, _>(env, "READOUT_BACKOFF_MAX_MS")? {
            self.worker.retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_env::<u64, _>(env, "READOUT_VISIBILITY_TIMEOUT_SECS")? {
            self.worker.visibility_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_env::<u64, _>(env, "READOUT_RESULT_TTL_SECS")? {
            self.worker.result_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_env::<u64, _>(env, "READOUT_RETENTION_SECS")? {
            self.housekeeping.retention = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_env::<u64, _>(env, "READOUT_SWEEP_INTERVAL_SECS")? {
            self.housekeeping.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(player) = env("READOUT_PLAYER") {
            self.playback.player = if player.is_empty() || player == "none" {
                None
            } else {
                Some(PlayerCommand {
                    program: player,
                    args: Vec::new(),
                })
            };
        }

        let backend = env("READOUT_BROKER");
        let database = env("READOUT_DATABASE").map(PathBuf::from);
        if backend.is_some() || database.is_some() {
            self.broker = parse_backend(backend.as_deref(), database, &self.broker)?;
        }

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if !self
            .synthesis
            .args
            .iter()
            .any(|a| a.contains(OUTPUT_PLACEHOLDER))
        {
            return Err(Error::Config(format!(
                "synthesis args must contain the {OUTPUT_PLACEHOLDER} placeholder"
            )));
        }
        if self.synthesis.max_text_length == 0 {
            return Err(Error::Config("max_text_length must be positive".to_string()));
        }
        if self.worker.retry.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".to_string()));
        }
        if self.worker.retry.max_delay < self.worker.retry.base_delay {
            return Err(Error::Config(
                "backoff cap must not be below the backoff base".to_string(),
            ));
        }
        // A lease must outlive the synthesis budget or a second worker picks up a running task
        if self.worker.visibility_timeout <= self.synthesis.timeout {
            return Err(Error::Config(format!(
                "visibility timeout ({}s) must exceed the synthesis timeout ({}s)",
                self.worker.visibility_timeout.as_secs(),
                self.synthesis.timeout.as_secs()
            )));
        }
        Ok(())
    }
}

fn parse_backend(
    backend: Option<&str>,
    database: Option<PathBuf>,
    current: &BrokerBackend,
) -> Result<BrokerBackend> {
    let current_path = match current {
        BrokerBackend::Sqlite { path } => Some(path.clone()),
        BrokerBackend::Memory => None,
    };

    match backend {
        Some("memory") => Ok(BrokerBackend::Memory),
        Some("sqlite") => Ok(BrokerBackend::Sqlite {
            path: database
                .or(current_path)
                .unwrap_or_else(default_database_path),
        }),
        Some(other) => Err(Error::Config(format!("unknown broker backend: {other}"))),
        None => Ok(match (database, current) {
            (Some(path), BrokerBackend::Sqlite { .. }) => BrokerBackend::Sqlite { path },
            _ => current.clone(),
        }),
    }
}

fn parse_env<T, F>(env: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    env(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| Error::Config(format!("invalid {key}={raw}: {e}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::from_sources(ReadoutConfigFile::default(), env_from(&[])).unwrap();

        assert_eq!(config.synthesis.program, "open_jtalk");
        assert_eq!(config.synthesis.max_text_length, 150);
        assert_eq!(config.synthesis.max_artifact_bytes, 10_000_000);
        assert_eq!(config.synthesis.timeout, Duration::from_secs(30));
        assert_eq!(config.worker.retry.max_attempts, 3);
        assert_eq!(config.worker.result_ttl, Duration::from_secs(300));
        assert_eq!(config.housekeeping.retention, Duration::from_secs(3600));
        assert_eq!(config.housekeeping.sweep_interval, Duration::from_secs(3600));
        assert!(matches!(config.broker, BrokerBackend::Sqlite { .. }));
    }

    #[test]
    fn env_overrides_file() {
        let mut file = ReadoutConfigFile::default();
        file.synthesis.max_text_length = Some(200);
        file.worker.max_attempts = Some(5);

        let config = Config::from_sources(
            file,
            env_from(&[("READOUT_MAX_TEXT_LENGTH", "80"), ("READOUT_BROKER", "memory")]),
        )
        .unwrap();

        assert_eq!(config.synthesis.max_text_length, 80);
        assert_eq!(config.worker.retry.max_attempts, 5);
        assert_eq!(config.broker, BrokerBackend::Memory);
    }

    #[test]
    fn database_override_keeps_sqlite_backend() {
        let config = Config::from_sources(
            ReadoutConfigFile::default(),
            env_from(&[("READOUT_DATABASE", "/var/lib/readout/queue.db")]),
        )
        .unwrap();

        assert_eq!(
            config.broker,
            BrokerBackend::Sqlite {
                path: PathBuf::from("/var/lib/readout/queue.db")
            }
        );
    }

    #[test]
    fn malformed_env_value_is_a_config_error() {
        let err = Config::from_sources(
            ReadoutConfigFile::default(),
            env_from(&[("READOUT_RESULT_TTL_SECS", "five minutes")]),
        )
        .unwrap_err();

        assert!(matches!(err, Error::Config(msg) if msg.contains("READOUT_RESULT_TTL_SECS")));
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let err = Config::from_sources(
            ReadoutConfigFile::default(),
            env_from(&[("READOUT_BROKER", "redis")]),
        )
        .unwrap_err();

        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn synth_args_without_output_placeholder_are_rejected() {
        let mut file = ReadoutConfigFile::default();
        file.synthesis.args = Some(vec!["-w".to_string(), "out.wav".to_string()]);

        assert!(Config::from_sources(file, env_from(&[])).is_err());
    }

    #[test]
    fn zero_attempts_are_rejected() {
        let err = Config::from_sources(
            ReadoutConfigFile::default(),
            env_from(&[("READOUT_MAX_ATTEMPTS", "0")]),
        )
        .unwrap_err();

        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn player_from_file_and_disabled_by_env() {
        let mut file = ReadoutConfigFile::default();
        file.playback.player = Some("aplay".to_string());
        file.playback.player_args = Some(vec!["-q".to_string(), INPUT_PLACEHOLDER.to_string()]);

        let with_player = Config::from_sources(file, env_from(&[])).unwrap();
        assert_eq!(
            with_player.playback.player,
            Some(PlayerCommand {
                program: "aplay".to_string(),
                args: vec!["-q".to_string(), "{input}".to_string()],
            })
        );

        let mut file = ReadoutConfigFile::default();
        file.playback.player = Some("aplay".to_string());
        let silenced = Config::from_sources(file, env_from(&[("READOUT_PLAYER", "none")])).unwrap();
        assert!(silenced.playback.player.is_none());
    }

    #[test]
    fn backoff_cap_from_env() {
        let config = Config::from_sources(
            ReadoutConfigFile::default(),
            env_from(&[("READOUT_BACKOFF_BASE_MS", "200"), ("READOUT_BACKOFF_MAX_MS", "5000")]),
        )
        .unwrap();

        assert_eq!(config.worker.retry.base_delay, Duration::from_millis(200));
        assert_eq!(config.worker.retry.max_delay, Duration::from_secs(5));

        let err = Config::from_sources(
            ReadoutConfigFile::default(),
            env_from(&[("READOUT_BACKOFF_BASE_MS", "2000"), ("READOUT_BACKOFF_MAX_MS", "500")]),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn lease_shorter_than_synthesis_timeout_is_rejected() {
        let mut file = ReadoutConfigFile::default();
        file.worker.visibility_timeout_secs = Some(10);

        let err = Config::from_sources(file, env_from(&[])).unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("visibility timeout")));

        let err = Config::from_sources(
            ReadoutConfigFile::default(),
            env_from(&[("READOUT_VISIBILITY_TIMEOUT_SECS", "30")]),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let config = Config::from_sources(
            ReadoutConfigFile::default(),
            env_from(&[
                ("READOUT_SYNTH_TIMEOUT_SECS", "5"),
                ("READOUT_VISIBILITY_TIMEOUT_SECS", "6"),
            ]),
        )
        .unwrap();
        assert_eq!(config.worker.visibility_timeout, Duration::from_secs(6));
    }
}
