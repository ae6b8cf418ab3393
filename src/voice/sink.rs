//! Audio sinks that play one artifact at a time

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::{INPUT_PLACEHOLDER, PlaybackConfig, PlayerCommand};
use crate::pipeline::PlaybackItem;
use crate::{Error, Result};

/// Plays one artifact and resolves once playback has finished
///
/// The future resolving (with success or an error) is the only completion
/// signal the playback queue uses. Dropping it must stop playback.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Play the item's artifact to completion
    ///
    /// # Errors
    ///
    /// Returns `Playback` if the artifact cannot be played
    async fn play(&self, item: &PlaybackItem) -> Result<()>;
}

/// Build the sink described by the playback configuration
#[must_use]
pub fn sink_from_config(config: &PlaybackConfig) -> Arc<dyn AudioSink> {
    match &config.player {
        Some(player) => Arc::new(CommandSink::new(player.clone())),
        None => Arc::new(PacedSink),
    }
}

/// Plays artifacts through an external player such as `aplay`
#[derive(Debug, Clone)]
pub struct CommandSink {
    player: PlayerCommand,
}

impl CommandSink {
    #[must_use]
    pub const fn new(player: PlayerCommand) -> Self {
        Self { player }
    }

    fn args_for(&self, input: &Path) -> Vec<String> {
        let input = input.to_string_lossy();
        let mut args: Vec<String> = self
            .player
            .args
            .iter()
            .map(|arg| arg.replace(INPUT_PLACEHOLDER, &input))
            .collect();
        if !self
            .player
            .args
            .iter()
            .any(|arg| arg.contains(INPUT_PLACEHOLDER))
        {
            args.push(input.into_owned());
        }
        args
    }
}

#[async_trait]
impl AudioSink for CommandSink {
    async fn play(&self, item: &PlaybackItem) -> Result<()> {
        let program = &self.player.program;
        let output = Command::new(program)
            .args(self.args_for(&item.artifact_path))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Playback(format!("failed to run {program}: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Playback(format!(
                "{program} exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(())
    }
}

/// Headless sink: reads the WAV header and waits for the clip's duration
///
/// Keeps the queue's timing realistic on hosts without an audio device.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacedSink;

impl PacedSink {
    /// Duration of a WAV file according to its header
    ///
    /// # Errors
    ///
    /// Returns `Playback` if the file is missing or not a WAV file
    pub fn clip_duration(path: &Path) -> Result<Duration> {
        let reader = hound::WavReader::open(path)
            .map_err(|e| Error::Playback(format!("unreadable artifact {}: {e}", path.display())))?;
        let spec = reader.spec();
        if spec.sample_rate == 0 {
            return Err(Error::Playback(format!(
                "artifact {} has no sample rate",
                path.display()
            )));
        }
        Ok(Duration::from_secs_f64(
            f64::from(reader.duration()) / f64::from(spec.sample_rate),
        ))
    }
}

#[async_trait]
impl AudioSink for PacedSink {
    async fn play(&self, item: &PlaybackItem) -> Result<()> {
        let path = item.artifact_path.clone();
        let duration = tokio::task::spawn_blocking(move || Self::clip_duration(&path))
            .await
            .map_err(|e| Error::Playback(format!("reading clip duration panicked: {e}")))??;

        tracing::trace!(
            destination = %item.destination,
            duration_ms = duration.as_millis(),
            "pacing clip"
        );
        tokio::time::sleep(duration).await;
        Ok(())
    }
}
