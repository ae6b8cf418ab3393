//! TOML configuration file loading
//!
//! Supports `~/.config/readout/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct ReadoutConfigFile {
    /// Synthesis process configuration
    #[serde(default)]
    pub synthesis: SynthesisFileConfig,

    /// Worker pool configuration
    #[serde(default)]
    pub worker: WorkerFileConfig,

    /// Playback configuration
    #[serde(default)]
    pub playback: PlaybackFileConfig,

    /// Artifact housekeeping configuration
    #[serde(default)]
    pub housekeeping: HousekeepingFileConfig,

    /// Task queue / result store backend
    #[serde(default)]
    pub broker: BrokerFileConfig,
}

/// Synthesis process configuration
#[derive(Debug, Default, Deserialize)]
pub struct SynthesisFileConfig {
    /// Synthesis program (e.g. "`open_jtalk`")
    pub program: Option<String>,

    /// Program arguments; `{output}` is replaced with the artifact path
    pub args: Option<Vec<String>>,

    /// Directory artifacts are written to
    pub scratch_dir: Option<PathBuf>,

    /// Wall-clock budget per invocation
    pub timeout_secs: Option<u64>,

    /// Maximum input length in characters
    pub max_text_length: Option<usize>,

    /// Maximum artifact size in bytes
    pub max_artifact_bytes: Option<u64>,
}

/// Worker pool configuration
#[derive(Debug, Default, Deserialize)]
pub struct WorkerFileConfig {
    /// Number of workers in the pool
    pub concurrency: Option<usize>,

    /// Total synthesis attempts per task
    pub max_attempts: Option<u32>,

    /// Backoff base delay
    pub backoff_base_ms: Option<u64>,

    /// Backoff cap
    pub backoff_max_ms: Option<u64>,

    /// Lifetime of stored results
    pub result_ttl_secs: Option<u64>,

    /// Queue poll interval while idle
    pub poll_interval_ms: Option<u64>,

    /// Lease length of a consumed task
    pub visibility_timeout_secs: Option<u64>,
}

/// Playback configuration
#[derive(Debug, Default, Deserialize)]
pub struct PlaybackFileConfig {
    /// Player program (e.g. "aplay"); unset plays silently in real time
    pub player: Option<String>,

    /// Player arguments; `{input}` is replaced with the artifact path
    pub player_args: Option<Vec<String>>,

    /// Ready-list wait before a poller re-checks liveness
    pub ready_wait_timeout_ms: Option<u64>,
}

/// Artifact housekeeping configuration
#[derive(Debug, Default, Deserialize)]
pub struct HousekeepingFileConfig {
    /// Age after which artifacts are removed
    pub retention_secs: Option<u64>,

    /// Interval between sweeps
    pub sweep_interval_secs: Option<u64>,
}

/// Broker backend configuration
#[derive(Debug, Default, Deserialize)]
pub struct BrokerFileConfig {
    /// "memory" or "sqlite"
    pub backend: Option<String>,

    /// Database file for the sqlite backend
    pub database_path: Option<PathBuf>,
}

/// Load the TOML config file from the standard path
///
/// Returns `ReadoutConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> ReadoutConfigFile {
    config_file_path().map_or_else(ReadoutConfigFile::default, |path| load_config_file_from(&path))
}

/// Load a TOML config file from an explicit path
///
/// Returns `ReadoutConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file_from(path: &Path) -> ReadoutConfigFile {
    if !path.exists() {
        return ReadoutConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                ReadoutConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            ReadoutConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/readout/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("readout").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let file = load_config_file_from(&dir.path().join("absent.toml"));
        assert!(file.synthesis.program.is_none());
        assert!(file.broker.backend.is_none());
    }

    #[test]
    fn partial_file_overlays_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            [synthesis]
            program = "espeak-ng"
            args = ["-w", "{output}"]
            max_text_length = 200

            [worker]
            max_attempts = 5

            [broker]
            backend = "sqlite"
            "#,
        )
        .unwrap();

        let file = load_config_file_from(&path);
        assert_eq!(file.synthesis.program.as_deref(), Some("espeak-ng"));
        assert_eq!(file.synthesis.max_text_length, Some(200));
        assert_eq!(file.worker.max_attempts, Some(5));
        assert!(file.worker.result_ttl_secs.is_none());
        assert_eq!(file.broker.backend.as_deref(), Some("sqlite"));
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[synthesis\nprogram = ").unwrap();

        let file = load_config_file_from(&path);
        assert!(file.synthesis.program.is_none());
    }
}
