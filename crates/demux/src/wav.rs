// RIFF/WAVE push parser

use streamplay_core::{
    AudioDataLayout, AudioError, ParserEvent, Result, SampleEncoding, StreamFormat, StreamParser,
};

const WAVE_FORMAT_PCM: u16 = 0x0001;
const WAVE_FORMAT_IEEE_FLOAT: u16 = 0x0003;
const WAVE_FORMAT_EXTENSIBLE: u16 = 0xFFFE;

/// LIST chunks larger than this are skipped rather than buffered
const MAX_LIST_SIZE: u32 = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Body {
    Fmt,
    List,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    RiffHeader,
    ChunkHeader,
    Body { kind: Body, size: usize },
    Skip { remaining: u64 },
    Audio { remaining: Option<u64>, pad: u64 },
}

/// Incremental WAV parser. Bytes may arrive in arbitrary pieces; audio is emitted in
/// whole frames as soon as it is available.
pub struct WavStreamParser {
    stage: Stage,
    pending: Vec<u8>,
    /// Absolute stream offset of `pending[0]`
    offset: u64,
    format: Option<StreamFormat>,
    data_offset: u64,
    data_size: Option<u64>,
    frames_emitted: u64,
}

impl WavStreamParser {
    pub fn new() -> Self {
        Self {
            stage: Stage::RiffHeader,
            pending: Vec::new(),
            offset: 0,
            format: None,
            data_offset: 0,
            data_size: None,
            frames_emitted: 0,
        }
    }

    pub fn format(&self) -> Option<StreamFormat> {
        self.format
    }

    fn frame_size(&self) -> usize {
        self.format.map(|f| f.bytes_per_frame as usize).unwrap_or(0)
    }

    /// Process as much of `pending` as possible, returning the bytes consumed
    fn step(&mut self, out: &mut Vec<ParserEvent>) -> Result<usize> {
        let mut pos = 0;
        loop {
            let available = self.pending.len() - pos;
            match self.stage {
                Stage::RiffHeader => {
                    if available < 12 {
                        return Ok(pos);
                    }
                    let header = &self.pending[pos..pos + 12];
                    if &header[0..4] != b"RIFF" || &header[8..12] != b"WAVE" {
                        return Err(AudioError::ParseError("Not a RIFF/WAVE stream".to_string()));
                    }
                    pos += 12;
                    self.stage = Stage::ChunkHeader;
                }
                Stage::ChunkHeader => {
                    if available < 8 {
                        return Ok(pos);
                    }
                    let id: [u8; 4] = [
                        self.pending[pos],
                        self.pending[pos + 1],
                        self.pending[pos + 2],
                        self.pending[pos + 3],
                    ];
                    let size = read_u32(&self.pending[pos + 4..pos + 8]);
                    pos += 8;
                    let padded = size as u64 + (size as u64 & 1);

                    self.stage = match &id {
                        b"fmt " => Stage::Body {
                            kind: Body::Fmt,
                            size: padded as usize,
                        },
                        b"LIST" if size <= MAX_LIST_SIZE => Stage::Body {
                            kind: Body::List,
                            size: padded as usize,
                        },
                        b"data" => {
                            let format = self.format.ok_or_else(|| {
                                AudioError::ParseError("data chunk before fmt chunk".to_string())
                            })?;
                            self.data_offset = self.offset + pos as u64;
                            // Streaming encoders write 0 or 0xFFFFFFFF when the length is unknown
                            self.data_size = match size {
                                0 | u32::MAX => None,
                                n => Some(n as u64),
                            };
                            out.push(ParserEvent::Format {
                                format,
                                audio_data_offset: self.data_offset,
                                audio_data_byte_count: self.data_size,
                                packet_buffer_size_hint: format.bytes_per_frame as usize,
                            });
                            Stage::Audio {
                                remaining: self.data_size,
                                pad: self.data_size.map(|s| s & 1).unwrap_or(0),
                            }
                        }
                        _ => Stage::Skip { remaining: padded },
                    };
                }
                Stage::Body { kind, size } => {
                    if available < size {
                        return Ok(pos);
                    }
                    let body = self.pending[pos..pos + size].to_vec();
                    pos += size;
                    match kind {
                        Body::Fmt => self.format = Some(parse_fmt(&body)?),
                        Body::List => {
                            let tags = parse_info(&body);
                            if !tags.is_empty() {
                                out.push(ParserEvent::Metadata {
                                    frame: self.frames_emitted,
                                    tags,
                                });
                            }
                        }
                    }
                    self.stage = Stage::ChunkHeader;
                }
                Stage::Skip { remaining } => {
                    if remaining == 0 {
                        self.stage = Stage::ChunkHeader;
                        continue;
                    }
                    if available == 0 {
                        return Ok(pos);
                    }
                    let take = (available as u64).min(remaining);
                    pos += take as usize;
                    self.stage = Stage::Skip {
                        remaining: remaining - take,
                    };
                }
                Stage::Audio { remaining, pad } => {
                    let frame = self.frame_size();
                    if remaining.map(|r| r < frame as u64).unwrap_or(false) {
                        // End of the data chunk (plus any stray partial frame)
                        self.stage = Stage::Skip {
                            remaining: remaining.unwrap_or(0) + pad,
                        };
                        continue;
                    }
                    let limit = remaining
                        .map(|r| r.min(available as u64) as usize)
                        .unwrap_or(available);
                    let whole = limit / frame * frame;
                    if whole == 0 {
                        return Ok(pos);
                    }
                    out.push(ParserEvent::Audio {
                        data: self.pending[pos..pos + whole].to_vec(),
                        packets: Vec::new(),
                    });
                    pos += whole;
                    self.frames_emitted += (whole / frame) as u64;
                    self.stage = Stage::Audio {
                        remaining: remaining.map(|r| r - whole as u64),
                        pad,
                    };
                }
            }
        }
    }
}

impl Default for WavStreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamParser for WavStreamParser {
    fn parse(&mut self, bytes: &[u8], out: &mut Vec<ParserEvent>) -> Result<()> {
        self.pending.extend_from_slice(bytes);
        let consumed = self.step(out)?;
        self.pending.drain(..consumed);
        self.offset += consumed as u64;
        Ok(())
    }

    fn seek(&mut self, layout: &AudioDataLayout, audio_byte_offset: u64) -> Result<()> {
        let format = layout.format;
        if format.bytes_per_frame == 0 {
            return Err(AudioError::ParseError("Cannot seek without a frame size".to_string()));
        }
        self.format = Some(format);
        self.data_offset = layout.audio_data_offset;
        self.data_size = layout.audio_data_byte_count;
        self.pending.clear();
        self.offset = self.data_offset + audio_byte_offset;
        self.frames_emitted = audio_byte_offset / format.bytes_per_frame as u64;
        self.stage = Stage::Audio {
            remaining: self.data_size.map(|s| s.saturating_sub(audio_byte_offset)),
            pad: self.data_size.map(|s| s & 1).unwrap_or(0),
        };
        Ok(())
    }

    fn finish(&mut self, _out: &mut Vec<ParserEvent>) -> Result<()> {
        if self.format.is_none() || matches!(self.stage, Stage::RiffHeader) {
            return Err(AudioError::ParseError(
                "Stream ended before any audio data".to_string(),
            ));
        }
        if let Stage::Audio {
            remaining: Some(remaining),
            ..
        } = self.stage
        {
            if remaining > 0 {
                log::warn!("[demux] stream ended {} bytes short of its data chunk", remaining);
            }
        }
        Ok(())
    }
}

fn read_u16(bytes: &[u8]) -> u16 {
    u16::from_le_bytes([bytes[0], bytes[1]])
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn parse_fmt(body: &[u8]) -> Result<StreamFormat> {
    if body.len() < 16 {
        return Err(AudioError::ParseError(format!("fmt chunk too short: {} bytes", body.len())));
    }
    let mut tag = read_u16(&body[0..2]);
    let channels = read_u16(&body[2..4]);
    let sample_rate = read_u32(&body[4..8]);
    let block_align = read_u16(&body[12..14]);
    let bits = read_u16(&body[14..16]);

    if tag == WAVE_FORMAT_EXTENSIBLE {
        if body.len() < 26 {
            return Err(AudioError::ParseError("Truncated WAVE_FORMAT_EXTENSIBLE".to_string()));
        }
        // First two bytes of the sub-format GUID carry the actual format tag
        tag = read_u16(&body[24..26]);
    }

    let encoding = match (tag, bits) {
        (WAVE_FORMAT_PCM, 8) => SampleEncoding::PcmUnsigned,
        (WAVE_FORMAT_PCM, 16 | 24 | 32) => SampleEncoding::PcmSigned,
        (WAVE_FORMAT_IEEE_FLOAT, 32) => SampleEncoding::PcmFloat,
        _ => {
            return Err(AudioError::UnsupportedFormat(format!(
                "WAV format tag {:#06x} with {} bits per sample",
                tag, bits
            )))
        }
    };

    let format = StreamFormat::pcm(sample_rate, channels, bits, encoding);
    format.validate()?;
    if block_align as u32 != format.bytes_per_frame {
        return Err(AudioError::UnsupportedFormat(format!(
            "Block alignment {} does not match {} channels of {} bits",
            block_align, channels, bits
        )));
    }
    Ok(format)
}

/// Tags from a `LIST/INFO` chunk body
fn parse_info(body: &[u8]) -> Vec<(String, String)> {
    let mut tags = Vec::new();
    if body.len() < 4 || &body[0..4] != b"INFO" {
        return tags;
    }

    let mut pos = 4;
    while pos + 8 <= body.len() {
        let id = &body[pos..pos + 4];
        let size = read_u32(&body[pos + 4..pos + 8]) as usize;
        pos += 8;
        let end = (pos + size).min(body.len());
        let text = String::from_utf8_lossy(&body[pos..end])
            .trim_end_matches('\0')
            .trim()
            .to_string();
        pos = end + (size & 1);

        if text.is_empty() {
            continue;
        }
        let key = match id {
            b"INAM" => "title".to_string(),
            b"IART" => "artist".to_string(),
            b"IPRD" => "album".to_string(),
            b"ICMT" => "comment".to_string(),
            b"IGNR" => "genre".to_string(),
            b"ICRD" => "date".to_string(),
            b"ITRK" | b"IPRT" => "track".to_string(),
            other => String::from_utf8_lossy(other).to_ascii_lowercase(),
        };
        tags.push((key, text));
    }
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info_chunk(tags: &[(&[u8; 4], &str)]) -> Vec<u8> {
        let mut body = b"INFO".to_vec();
        for (id, text) in tags {
            let mut value = text.as_bytes().to_vec();
            value.push(0);
            body.extend_from_slice(*id);
            body.extend_from_slice(&(value.len() as u32).to_le_bytes());
            body.extend_from_slice(&value);
            if value.len() % 2 == 1 {
                body.push(0);
            }
        }
        let mut chunk = b"LIST".to_vec();
        chunk.extend_from_slice(&(body.len() as u32).to_le_bytes());
        chunk.extend_from_slice(&body);
        chunk
    }

    fn wav(channels: u16, rate: u32, bits: u16, tag: u16, extra: &[u8], audio: &[u8]) -> Vec<u8> {
        let block = channels * bits / 8;
        let mut out = b"RIFF".to_vec();
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&tag.to_le_bytes());
        out.extend_from_slice(&channels.to_le_bytes());
        out.extend_from_slice(&rate.to_le_bytes());
        out.extend_from_slice(&(rate * block as u32).to_le_bytes());
        out.extend_from_slice(&block.to_le_bytes());
        out.extend_from_slice(&bits.to_le_bytes());
        out.extend_from_slice(extra);
        out.extend_from_slice(b"data");
        out.extend_from_slice(&(audio.len() as u32).to_le_bytes());
        out.extend_from_slice(audio);
        out
    }

    fn audio_bytes(events: &[ParserEvent]) -> Vec<u8> {
        events
            .iter()
            .filter_map(|e| match e {
                ParserEvent::Audio { data, .. } => Some(data.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[test]
    fn parses_header_and_audio() {
        let audio: Vec<u8> = (0..16).collect();
        let bytes = wav(2, 44_100, 16, WAVE_FORMAT_PCM, &[], &audio);
        let mut parser = WavStreamParser::new();
        let mut events = Vec::new();
        parser.parse(&bytes, &mut events).unwrap();

        match &events[0] {
            ParserEvent::Format {
                format,
                audio_data_offset,
                audio_data_byte_count,
                ..
            } => {
                assert_eq!(format.sample_rate, 44_100);
                assert_eq!(format.bytes_per_frame, 4);
                assert_eq!(*audio_data_offset, 44);
                assert_eq!(*audio_data_byte_count, Some(16));
            }
            other => panic!("expected format, got {:?}", other),
        }
        assert_eq!(audio_bytes(&events), audio);
    }

    #[test]
    fn byte_at_a_time_input_yields_same_audio() {
        let audio: Vec<u8> = (0..24).collect();
        let bytes = wav(1, 8_000, 24, WAVE_FORMAT_PCM, &[], &audio);
        let mut parser = WavStreamParser::new();
        let mut events = Vec::new();
        for b in &bytes {
            parser.parse(std::slice::from_ref(b), &mut events).unwrap();
        }
        assert_eq!(audio_bytes(&events), audio);
        assert!(parser.finish(&mut events).is_ok());
    }

    #[test]
    fn info_tags_become_metadata() {
        let list = info_chunk(&[(b"INAM", "Song"), (b"IART", "Band")]);
        let bytes = wav(1, 8_000, 16, WAVE_FORMAT_PCM, &list, &[0, 0]);
        let mut parser = WavStreamParser::new();
        let mut events = Vec::new();
        parser.parse(&bytes, &mut events).unwrap();

        let tags = events
            .iter()
            .find_map(|e| match e {
                ParserEvent::Metadata { frame, tags } => Some((*frame, tags.clone())),
                _ => None,
            })
            .unwrap();
        assert_eq!(tags.0, 0);
        assert_eq!(
            tags.1,
            vec![
                ("title".to_string(), "Song".to_string()),
                ("artist".to_string(), "Band".to_string())
            ]
        );
    }

    #[test]
    fn float_and_unknown_tags() {
        let bytes = wav(1, 48_000, 32, WAVE_FORMAT_IEEE_FLOAT, &[], &[0; 4]);
        let mut parser = WavStreamParser::new();
        parser.parse(&bytes, &mut Vec::new()).unwrap();
        assert_eq!(parser.format().unwrap().encoding, SampleEncoding::PcmFloat);

        let bytes = wav(1, 48_000, 16, 0x0055, &[], &[0; 4]);
        let mut parser = WavStreamParser::new();
        assert!(matches!(
            parser.parse(&bytes, &mut Vec::new()),
            Err(AudioError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let mut parser = WavStreamParser::new();
        let err = parser.parse(b"ID3\x04\0\0\0\0\0\0\0\0\0", &mut Vec::new()).unwrap_err();
        assert!(matches!(err, AudioError::ParseError(_)));
    }

    #[test]
    fn seek_resumes_inside_data_chunk() {
        let audio: Vec<u8> = (0..32).collect();
        let bytes = wav(2, 8_000, 16, WAVE_FORMAT_PCM, &[], &audio);
        let mut first = WavStreamParser::new();
        let mut events = Vec::new();
        first.parse(&bytes[..50], &mut events).unwrap();
        let layout = match events[0] {
            ParserEvent::Format {
                format,
                audio_data_offset,
                audio_data_byte_count,
                ..
            } => AudioDataLayout {
                format,
                audio_data_offset,
                audio_data_byte_count,
            },
            _ => panic!("expected format"),
        };

        // A fresh parser resumes without seeing the header again
        let mut parser = WavStreamParser::new();
        parser.seek(&layout, 20).unwrap();
        let mut events = Vec::new();
        parser.parse(&bytes[44 + 20..], &mut events).unwrap();
        assert_eq!(audio_bytes(&events), audio[20..].to_vec());
        assert!(parser.finish(&mut events).is_ok());
    }

    #[test]
    fn truncated_stream_fails_at_finish() {
        let mut parser = WavStreamParser::new();
        parser.parse(b"RIFF\0\0\0\0WAVEfmt ", &mut Vec::new()).unwrap();
        assert!(parser.finish(&mut Vec::new()).is_err());
    }
}
