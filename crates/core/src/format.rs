// Stream format description and per-buffer bookkeeping types

/// How samples are encoded in a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleEncoding {
    /// Signed little-endian integer PCM
    PcmSigned,
    /// Unsigned integer PCM (8-bit WAV)
    PcmUnsigned,
    /// IEEE float PCM
    PcmFloat,
    /// Compressed packets, identified by a four character code
    Compressed(u32),
}

/// Audio stream format
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    /// Zero for variable-size compressed frames
    pub bytes_per_frame: u32,
    pub frames_per_packet: u32,
    /// Zero for variable-size packets
    pub bytes_per_packet: u32,
    pub encoding: SampleEncoding,
}

impl StreamFormat {
    /// Interleaved linear PCM with one frame per packet
    pub fn pcm(
        sample_rate: u32,
        channels: u16,
        bits_per_sample: u16,
        encoding: SampleEncoding,
    ) -> Self {
        let bytes_per_frame = channels as u32 * ((bits_per_sample as u32 + 7) / 8);
        Self {
            sample_rate,
            channels,
            bits_per_sample,
            bytes_per_frame,
            frames_per_packet: 1,
            bytes_per_packet: bytes_per_frame,
            encoding,
        }
    }

    pub fn is_pcm(&self) -> bool {
        !matches!(self.encoding, SampleEncoding::Compressed(_))
    }

    pub fn bytes_per_sample(&self) -> u32 {
        (self.bits_per_sample as u32 + 7) / 8
    }

    /// Seconds covered by one packet
    pub fn packet_duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames_per_packet as f64 / self.sample_rate as f64
    }

    /// Frames contained in `bytes` of constant-size data; zero when frame size is variable
    pub fn frames_in(&self, bytes: usize) -> u64 {
        if self.bytes_per_frame > 0 {
            bytes as u64 / self.bytes_per_frame as u64
        } else if self.bytes_per_packet > 0 {
            bytes as u64 / self.bytes_per_packet as u64 * self.frames_per_packet as u64
        } else {
            0
        }
    }

    /// Byte alignment used when translating a time offset into a byte offset
    pub fn byte_alignment(&self) -> u64 {
        if self.bytes_per_packet > 0 {
            self.bytes_per_packet as u64
        } else if self.bytes_per_frame > 0 {
            self.bytes_per_frame as u64
        } else {
            1
        }
    }

    /// True when a sink configured for `self` can keep playing `other` without being
    /// drained and reconfigured (gapless continuation)
    pub fn is_definitely_compatible(&self, other: &StreamFormat) -> bool {
        self.sample_rate == other.sample_rate
            && self.channels == other.channels
            && self.bits_per_sample == other.bits_per_sample
            && self.bytes_per_frame == other.bytes_per_frame
            && self.frames_per_packet == other.frames_per_packet
            && self.encoding == other.encoding
    }

    /// Reject formats a sink cannot be configured with
    pub fn validate(&self) -> crate::Result<()> {
        if self.sample_rate == 0 || self.channels == 0 {
            return Err(crate::AudioError::UnsupportedFormat(format!(
                "Invalid stream format: {} Hz, {} channels",
                self.sample_rate, self.channels
            )));
        }
        if self.is_pcm() && self.bytes_per_frame == 0 {
            return Err(crate::AudioError::UnsupportedFormat(
                "PCM format without a frame size".to_string(),
            ));
        }
        Ok(())
    }
}

/// Byte size and frame count of one packet inside a frame buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketDescription {
    /// Offset of the packet from the start of the buffer
    pub start_offset: usize,
    pub byte_size: usize,
    /// Frames in the packet; zero means "use the format's frames per packet"
    pub frames: u32,
}

/// Handle of a frame buffer pool slot. The lease changes every time the slot is
/// handed out, so stale handles are detected when returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId {
    pub slot: usize,
    pub lease: u64,
}
