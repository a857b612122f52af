// Playback sink API: the output side of the engine

use streamplay_core::{BufferId, PacketDescription, Result, StreamFormat};

/// A frame buffer lent to a sink. The sink hands it back through the completion
/// handler once played, or from `flush`/`stop` when discarded.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkBuffer {
    pub id: BufferId,
    pub data: Vec<u8>,
    /// Variable-size packet descriptors; empty for PCM
    pub packets: Vec<PacketDescription>,
    pub frames: u64,
}

/// Called with every buffer the sink has finished playing.
/// May run on any thread, including synchronously inside `enqueue` or `start`.
pub type CompletionHandler = Box<dyn Fn(SinkBuffer) + Send + Sync>;

/// Audio output collaborator
///
/// A sink never reports completion for a buffer it returned from `flush` or `stop`,
/// and must not block waiting for the completion handler to return.
pub trait PlaybackSink: Send {
    /// Prepare for a new stream format. Only called while nothing is enqueued.
    fn configure(&mut self, format: &StreamFormat) -> Result<()>;

    /// Queue a buffer for playback after those already queued
    fn enqueue(&mut self, buffer: SinkBuffer) -> Result<()>;

    /// Start or resume output
    fn start(&mut self) -> Result<()>;

    fn pause(&mut self) -> Result<()>;

    /// Discard queued audio, returning the buffers that were not played
    fn flush(&mut self) -> Result<Vec<SinkBuffer>>;

    /// Stop output and discard queued audio
    fn stop(&mut self) -> Result<Vec<SinkBuffer>>;

    fn set_volume(&mut self, volume: f32) -> Result<()>;

    fn set_completion_handler(&mut self, handler: CompletionHandler);

    /// Buffers accepted but not yet completed
    fn queued(&self) -> usize;

    fn is_running(&self) -> bool;
}

impl<S: PlaybackSink + ?Sized> PlaybackSink for Box<S> {
    fn configure(&mut self, format: &StreamFormat) -> Result<()> {
        (**self).configure(format)
    }

    fn enqueue(&mut self, buffer: SinkBuffer) -> Result<()> {
        (**self).enqueue(buffer)
    }

    fn start(&mut self) -> Result<()> {
        (**self).start()
    }

    fn pause(&mut self) -> Result<()> {
        (**self).pause()
    }

    fn flush(&mut self) -> Result<Vec<SinkBuffer>> {
        (**self).flush()
    }

    fn stop(&mut self) -> Result<Vec<SinkBuffer>> {
        (**self).stop()
    }

    fn set_volume(&mut self, volume: f32) -> Result<()> {
        (**self).set_volume(volume)
    }

    fn set_completion_handler(&mut self, handler: CompletionHandler) {
        (**self).set_completion_handler(handler)
    }

    fn queued(&self) -> usize {
        (**self).queued()
    }

    fn is_running(&self) -> bool {
        (**self).is_running()
    }
}
