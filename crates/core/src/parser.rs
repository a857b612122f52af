// Stream parser collaborator: turns raw container bytes into format, audio and metadata events

use crate::error::Result;
use crate::format::{PacketDescription, StreamFormat};

/// Where the audio data sits inside a stream, as announced by its parser.
/// Enough to resume parsing at any offset inside the audio without the header.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioDataLayout {
    pub format: StreamFormat,
    /// Offset of the first audio byte within the source
    pub audio_data_offset: u64,
    /// Length of the audio data, when known
    pub audio_data_byte_count: Option<u64>,
}

/// Events produced by a push parser
#[derive(Debug, Clone, PartialEq)]
pub enum ParserEvent {
    /// Stream format discovered. Emitted once per stream, before any audio.
    Format {
        format: StreamFormat,
        /// Offset of the first audio byte within the source
        audio_data_offset: u64,
        /// Length of the audio data, when the container declares it
        audio_data_byte_count: Option<u64>,
        /// Largest packet the stream may contain
        packet_buffer_size_hint: usize,
    },

    /// Audio bytes. `packets` describes variable-size packets inside `data` and is
    /// empty for constant-size frames.
    Audio {
        data: Vec<u8>,
        packets: Vec<PacketDescription>,
    },

    /// Inline metadata, tagged with the approximate frame it belongs to
    Metadata { frame: u64, tags: Vec<(String, String)> },
}

/// Push parser for one stream
pub trait StreamParser: Send {
    /// Consume `bytes`, appending any resulting events to `out`
    fn parse(&mut self, bytes: &[u8], out: &mut Vec<ParserEvent>) -> Result<()>;

    /// Continue at `audio_byte_offset` (relative to the start of the audio data) after
    /// a discontinuity. Works on a fresh parser that has never seen the header.
    fn seek(&mut self, layout: &AudioDataLayout, audio_byte_offset: u64) -> Result<()>;

    /// End of data reached; emit anything still held back
    fn finish(&mut self, _out: &mut Vec<ParserEvent>) -> Result<()> {
        Ok(())
    }
}

/// Picks a parser for an entry based on its data source's format hint
pub trait ParserFactory: Send + Sync {
    fn create(&self, hint: Option<&str>) -> Result<Box<dyn StreamParser>>;
}
