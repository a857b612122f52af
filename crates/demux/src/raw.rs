// Headerless interleaved PCM

use streamplay_core::{AudioDataLayout, AudioError, ParserEvent, Result, StreamFormat, StreamParser};

/// Parser for raw PCM whose format is known in advance
pub struct RawPcmParser {
    format: StreamFormat,
    announced: bool,
    carry: Vec<u8>,
}

impl RawPcmParser {
    pub fn new(format: StreamFormat) -> Result<Self> {
        format.validate()?;
        if !format.is_pcm() {
            return Err(AudioError::UnsupportedFormat(
                "Raw parser only handles PCM".to_string(),
            ));
        }
        Ok(Self {
            format,
            announced: false,
            carry: Vec::new(),
        })
    }
}

impl StreamParser for RawPcmParser {
    fn parse(&mut self, bytes: &[u8], out: &mut Vec<ParserEvent>) -> Result<()> {
        if !self.announced {
            out.push(ParserEvent::Format {
                format: self.format,
                audio_data_offset: 0,
                audio_data_byte_count: None,
                packet_buffer_size_hint: self.format.bytes_per_frame as usize,
            });
            self.announced = true;
        }

        let frame = self.format.bytes_per_frame as usize;
        let mut data = std::mem::take(&mut self.carry);
        data.extend_from_slice(bytes);
        let whole = data.len() / frame * frame;
        self.carry = data.split_off(whole);
        if !data.is_empty() {
            out.push(ParserEvent::Audio {
                data,
                packets: Vec::new(),
            });
        }
        Ok(())
    }

    fn seek(&mut self, _layout: &AudioDataLayout, _audio_byte_offset: u64) -> Result<()> {
        self.carry.clear();
        self.announced = true;
        Ok(())
    }

    fn finish(&mut self, _out: &mut Vec<ParserEvent>) -> Result<()> {
        if !self.carry.is_empty() {
            log::debug!("[demux] dropping {} bytes of a partial frame", self.carry.len());
            self.carry.clear();
        }
        Ok(())
    }
}
