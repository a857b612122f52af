// Push parsers that turn container bytes into format, audio and metadata events

mod raw;
mod wav;

pub use raw::RawPcmParser;
pub use wav::WavStreamParser;

use streamplay_core::{
    AudioError, ParserFactory, Result, SampleEncoding, StreamFormat, StreamParser,
};

/// Container kinds the default factory understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    Wav,
    RawPcm,
}

/// Map a file extension or MIME type onto a container
pub fn container_from_hint(hint: &str) -> Option<Container> {
    let hint = hint.trim().to_ascii_lowercase();
    let hint = hint.split(';').next().unwrap_or_default().trim();
    match hint {
        "wav" | "wave" | "audio/wav" | "audio/wave" | "audio/x-wav" | "audio/vnd.wave" => {
            Some(Container::Wav)
        }
        "raw" | "pcm" | "audio/l16" | "audio/pcm" => Some(Container::RawPcm),
        _ => None,
    }
}

/// Chooses a parser from the data source's format hint. Sources without a hint are
/// assumed to be WAV; headerless PCM is interpreted with `raw_format`.
#[derive(Debug, Clone)]
pub struct DefaultParserFactory {
    raw_format: StreamFormat,
}

impl DefaultParserFactory {
    pub fn new() -> Self {
        Self {
            raw_format: StreamFormat::pcm(44_100, 2, 16, SampleEncoding::PcmSigned),
        }
    }

    pub fn with_raw_format(mut self, format: StreamFormat) -> Self {
        self.raw_format = format;
        self
    }
}

impl Default for DefaultParserFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ParserFactory for DefaultParserFactory {
    fn create(&self, hint: Option<&str>) -> Result<Box<dyn StreamParser>> {
        let container = match hint {
            None => Container::Wav,
            Some(hint) => container_from_hint(hint)
                .ok_or_else(|| AudioError::UnsupportedFormat(format!("No parser for '{}'", hint)))?,
        };
        log::debug!("[demux] using {:?} parser for hint {:?}", container, hint);

        Ok(match container {
            Container::Wav => Box::new(WavStreamParser::new()),
            Container::RawPcm => Box::new(RawPcmParser::new(self.raw_format)?),
        })
    }
}
