// Playback sinks: a wall-clock sink and, with the `cpal` feature, the default output device

mod clocked;
pub mod pcm;

#[cfg(feature = "cpal")]
mod cpal_sink;

pub use clocked::ClockedSink;

#[cfg(feature = "cpal")]
pub use cpal_sink::CpalSink;

pub use streamplay_sink_api::{CompletionHandler, PlaybackSink, SinkBuffer};
