//! Speech synthesis via an external process

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use uuid::Uuid;

use super::artifact::{artifact_size, remove_artifact};
use crate::config::{OUTPUT_PLACEHOLDER, SynthesisConfig};
use crate::{Error, Result};

/// Turns text into an audio artifact on disk
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesize `text`, returning the path of a freshly created artifact
    ///
    /// # Errors
    ///
    /// Returns `InputRejected`, `SynthesisTimeout`, `SynthesisFailure` or
    /// `OutputTooLarge`. No artifact is left behind on error.
    async fn synthesize(&self, text: &str) -> Result<PathBuf>;
}

/// Reject text longer than `max` characters
///
/// # Errors
///
/// Returns `InputRejected` carrying the measured length
pub fn check_text_length(text: &str, max: usize) -> Result<()> {
    let length = text.chars().count();
    if length > max {
        return Err(Error::InputRejected { length, max });
    }
    Ok(())
}

/// Runs a configured synthesis program once per request
///
/// The text is written to the program's stdin; the artifact path is passed
/// through the `{output}` placeholder in its arguments.
#[derive(Debug, Clone)]
pub struct CommandSynthesizer {
    config: SynthesisConfig,
}

impl CommandSynthesizer {
    #[must_use]
    pub const fn new(config: SynthesisConfig) -> Self {
        Self { config }
    }

    /// Directory artifacts are written to
    #[must_use]
    pub fn scratch_dir(&self) -> &Path {
        &self.config.scratch_dir
    }

    fn next_artifact_path(&self) -> PathBuf {
        self.config
            .scratch_dir
            .join(format!("{}.wav", Uuid::new_v4()))
    }

    fn args_for(&self, output: &Path) -> Vec<String> {
        let output = output.to_string_lossy();
        self.config
            .args
            .iter()
            .map(|arg| arg.replace(OUTPUT_PLACEHOLDER, &output))
            .collect()
    }

    async fn invoke(&self, text: &str, output: &Path) -> Result<()> {
        let program = &self.config.program;

        let mut child = Command::new(program)
            .args(self.args_for(output))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::SynthesisFailure(format!("failed to spawn {program}: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(text.as_bytes())
                .await
                .map_err(|e| {
                    Error::SynthesisFailure(format!("failed to write to {program}: {e}"))
                })?;
        }

        let budget = self.config.timeout;
        let output_status = timeout(budget, child.wait_with_output())
            .await
            .map_err(|_| Error::SynthesisTimeout(budget))?
            .map_err(|e| Error::SynthesisFailure(format!("{program} did not complete: {e}")))?;

        if !output_status.status.success() {
            let stderr = String::from_utf8_lossy(&output_status.stderr);
            let stderr = stderr.trim();
            return Err(Error::SynthesisFailure(if stderr.is_empty() {
                format!("{program} exited with {}", output_status.status)
            } else {
                format!("{program} exited with {}: {stderr}", output_status.status)
            }));
        }

        Ok(())
    }

    fn check_output(&self, output: &Path) -> Result<()> {
        match artifact_size(output) {
            None | Some(0) => Err(Error::SynthesisFailure(format!(
                "{} produced no audio",
                self.config.program
            ))),
            Some(size) if size > self.config.max_artifact_bytes => Err(Error::OutputTooLarge {
                size,
                max: self.config.max_artifact_bytes,
            }),
            Some(_) => Ok(()),
        }
    }
}

#[async_trait]
impl Synthesizer for CommandSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<PathBuf> {
        check_text_length(text, self.config.max_text_length)?;

        tokio::fs::create_dir_all(&self.config.scratch_dir).await?;
        let output = self.next_artifact_path();

        let started = tokio::time::Instant::now();
        let result = match self.invoke(text, &output).await {
            Ok(()) => self.check_output(&output),
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            remove_artifact(&output);
            tracing::debug!(
                program = %self.config.program,
                error = %e,
                "synthesis attempt failed"
            );
            return Err(e);
        }

        tracing::debug!(
            path = %output.display(),
            elapsed_ms = duration_ms(started.elapsed()),
            "synthesized artifact"
        );
        Ok(output)
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
