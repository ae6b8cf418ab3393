//! Voice output
//!
//! Turns text into audio artifacts and plays them back, one clip at a time
//! per destination. Artifacts live in a scratch directory and are removed
//! once they have been played or discarded.

mod artifact;
mod playback;
mod sink;
mod synth;

pub use artifact::{artifact_size, remove_artifact};
pub use playback::{
    Advance, Enqueued, PlaybackHandle, PlaybackQueue, PlaybackState, PlaybackStatus,
    spawn_playback,
};
pub use sink::{AudioSink, CommandSink, PacedSink, sink_from_config};
pub use synth::{CommandSynthesizer, Synthesizer, check_text_length};
