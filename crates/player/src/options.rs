// Player configuration

use std::time::Duration;
use streamplay_core::{AudioError, Result};

/// Tuning knobs for an [`AudioPlayer`](crate::AudioPlayer)
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerOptions {
    /// Frame buffers in the pool; bounds how far ingest runs ahead of playback
    pub buffer_count: usize,
    /// Bytes per frame buffer
    pub buffer_size: usize,
    /// Packet descriptors per buffer for variable-size packets
    pub max_packets_per_buffer: usize,
    /// Bytes pulled from a data source per read
    pub read_buffer_size: usize,
    /// Upper bound on any blocking wait before a loop re-checks its requests
    pub wait_interval: Duration,
    pub metering_enabled: bool,
}

impl Default for PlayerOptions {
    fn default() -> Self {
        Self {
            buffer_count: 64,
            buffer_size: 8192,
            max_packets_per_buffer: 512,
            read_buffer_size: 64 * 1024,
            wait_interval: Duration::from_millis(250),
            metering_enabled: false,
        }
    }
}

impl PlayerOptions {
    pub fn with_buffer_count(mut self, count: usize) -> Self {
        self.buffer_count = count;
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn with_max_packets_per_buffer(mut self, packets: usize) -> Self {
        self.max_packets_per_buffer = packets;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn with_wait_interval(mut self, interval: Duration) -> Self {
        self.wait_interval = interval;
        self
    }

    pub fn with_metering(mut self, enabled: bool) -> Self {
        self.metering_enabled = enabled;
        self
    }

    /// Seconds of audio the pool can hold for a given frame size and rate
    pub fn buffered_seconds(&self, bytes_per_frame: u32, sample_rate: u32) -> f64 {
        if bytes_per_frame == 0 || sample_rate == 0 {
            return 0.0;
        }
        let frames = (self.buffer_count * self.buffer_size) as f64 / bytes_per_frame as f64;
        frames / sample_rate as f64
    }

    pub fn validate(&self) -> Result<()> {
        let zero = if self.buffer_count == 0 {
            Some("buffer_count")
        } else if self.buffer_size == 0 {
            Some("buffer_size")
        } else if self.max_packets_per_buffer == 0 {
            Some("max_packets_per_buffer")
        } else if self.read_buffer_size == 0 {
            Some("read_buffer_size")
        } else if self.wait_interval.is_zero() {
            Some("wait_interval")
        } else {
            None
        };

        match zero {
            Some(field) => Err(AudioError::InvalidState(format!(
                "Player option {} must be greater than zero",
                field
            ))),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let options = PlayerOptions::default();
        assert!(options.validate().is_ok());
        assert_eq!(options.buffer_count, 64);
        assert!(!options.metering_enabled);
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let options = PlayerOptions::default().with_buffer_size(0);
        assert!(matches!(options.validate(), Err(AudioError::InvalidState(_))));
        let options = PlayerOptions::default().with_wait_interval(Duration::ZERO);
        assert!(options.validate().is_err());
    }

    #[test]
    fn pool_depth_in_seconds() {
        let options = PlayerOptions::default().with_buffer_count(10).with_buffer_size(4410 * 4);
        assert!((options.buffered_seconds(4, 44_100) - 1.0).abs() < 1e-9);
        assert_eq!(options.buffered_seconds(0, 44_100), 0.0);
    }
}
