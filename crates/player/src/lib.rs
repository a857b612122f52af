// Streaming audio player: queue, ingest and playback threads, and the public handle

mod driver;
mod engine;
mod entry;
mod filters;
mod ingest;
mod logging;
mod metering;
mod options;
mod player;
mod queue;

pub use filters::FrameFilter;
pub use logging::init_logging;
pub use metering::{MeterReading, METER_FLOOR_DB};
pub use options::PlayerOptions;
pub use player::AudioPlayer;

// Re-export the types callers need alongside the player
pub use streamplay_core::{
    AudioError, DataSource, ErrorCode, InternalState, ParserFactory, PlayerEvent, PlayerListener,
    PublicState, QueueItemId, Result, StopReason, Subscription,
};
pub use streamplay_sink_api::PlaybackSink;
