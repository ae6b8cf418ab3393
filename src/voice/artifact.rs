//! Scratch artifact helpers

use std::io::ErrorKind;
use std::path::Path;

/// Delete an artifact, returning whether a file was actually removed
///
/// A file that is already gone is not an error; the sweeper and the
/// playback path may race for orphaned artifacts.
pub fn remove_artifact(path: &Path) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::trace!(path = %path.display(), "artifact removed");
            true
        }
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove artifact");
            false
        }
    }
}

/// Size of an artifact in bytes, `None` if it does not exist
#[must_use]
pub fn artifact_size(path: &Path) -> Option<u64> {
    std::fs::metadata(path)
        .ok()
        .filter(std::fs::Metadata::is_file)
        .map(|m| m.len())
}
