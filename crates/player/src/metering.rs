// Peak and average power of the most recently played buffer

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use streamplay_core::StreamFormat;
use streamplay_sink::pcm::to_f32_samples;

/// Floor of the reported range; silence maps here
pub const METER_FLOOR_DB: f32 = -60.0;

/// Levels of one channel in decibels, within [-60, 0]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeterReading {
    pub peak_db: f32,
    pub average_db: f32,
}

impl MeterReading {
    pub const SILENT: MeterReading = MeterReading {
        peak_db: METER_FLOOR_DB,
        average_db: METER_FLOOR_DB,
    };
}

fn to_db(amplitude: f32) -> f32 {
    if amplitude <= 0.0 || !amplitude.is_finite() {
        return METER_FLOOR_DB;
    }
    (20.0 * amplitude.log10()).clamp(METER_FLOOR_DB, 0.0)
}

#[derive(Default)]
struct MeterState {
    format: Option<StreamFormat>,
    samples: Vec<u8>,
    /// Readings for `samples`, computed on first request
    readings: Option<Vec<MeterReading>>,
}

/// Keeps a copy of the last drained buffer and computes levels only when asked
pub(crate) struct Meter {
    enabled: AtomicBool,
    state: Mutex<MeterState>,
}

impl Meter {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            state: Mutex::new(MeterState::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        if !enabled {
            *self.state.lock() = MeterState::default();
        }
    }

    /// Remember a buffer the sink just finished playing
    pub fn capture(&self, format: &StreamFormat, data: &[u8]) {
        if !self.is_enabled() || !format.is_pcm() || data.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        state.format = Some(*format);
        state.samples.clear();
        state.samples.extend_from_slice(data);
        state.readings = None;
    }

    /// `None` when metering is off or the channel does not exist. Silence before
    /// anything has played.
    pub fn reading(&self, channel: usize) -> Option<MeterReading> {
        if !self.is_enabled() {
            return None;
        }
        let mut state = self.state.lock();
        let Some(format) = state.format else {
            return Some(MeterReading::SILENT);
        };
        if channel >= format.channels as usize {
            return None;
        }
        if state.readings.is_none() {
            let readings = compute(&format, &state.samples);
            state.readings = Some(readings);
        }
        state.readings.as_ref().and_then(|r| r.get(channel).copied())
    }
}

fn compute(format: &StreamFormat, data: &[u8]) -> Vec<MeterReading> {
    let channels = format.channels.max(1) as usize;
    let mut samples = Vec::new();
    if let Err(err) = to_f32_samples(format, data, &mut samples) {
        log::debug!("[meter] cannot read samples: {}", err);
        return vec![MeterReading::SILENT; channels];
    }

    let mut peak = vec![0f32; channels];
    let mut sum_squares = vec![0f64; channels];
    let mut counts = vec![0usize; channels];
    for (i, sample) in samples.iter().enumerate() {
        let ch = i % channels;
        let magnitude = sample.abs();
        if magnitude > peak[ch] {
            peak[ch] = magnitude;
        }
        sum_squares[ch] += (*sample as f64) * (*sample as f64);
        counts[ch] += 1;
    }

    (0..channels)
        .map(|ch| {
            let rms = if counts[ch] > 0 {
                (sum_squares[ch] / counts[ch] as f64).sqrt() as f32
            } else {
                0.0
            };
            MeterReading {
                peak_db: to_db(peak[ch]),
                average_db: to_db(rms),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamplay_core::SampleEncoding;

    fn stereo_16() -> StreamFormat {
        StreamFormat::pcm(44_100, 2, 16, SampleEncoding::PcmSigned)
    }

    fn frames(left: i16, right: i16, count: usize) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(count * 4);
        for _ in 0..count {
            bytes.extend_from_slice(&left.to_le_bytes());
            bytes.extend_from_slice(&right.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn disabled_meter_reports_nothing() {
        let meter = Meter::new(false);
        meter.capture(&stereo_16(), &frames(1000, 1000, 8));
        assert_eq!(meter.reading(0), None);
    }

    #[test]
    fn silence_maps_to_floor() {
        let meter = Meter::new(true);
        assert_eq!(meter.reading(0), Some(MeterReading::SILENT));
        meter.capture(&stereo_16(), &frames(0, 0, 8));
        assert_eq!(meter.reading(1), Some(MeterReading::SILENT));
        assert_eq!(meter.reading(2), None);
    }

    #[test]
    fn full_scale_is_zero_db_and_half_is_minus_six() {
        let meter = Meter::new(true);
        meter.capture(&stereo_16(), &frames(i16::MIN, 16_384, 16));
        let left = meter.reading(0).unwrap();
        let right = meter.reading(1).unwrap();
        assert!(left.peak_db.abs() < 0.01);
        assert!(left.average_db.abs() < 0.01);
        assert!((right.peak_db + 6.02).abs() < 0.05);
        assert!(right.average_db <= right.peak_db);
    }

    #[test]
    fn very_quiet_signal_is_clamped() {
        let meter = Meter::new(true);
        meter.capture(&stereo_16(), &frames(1, -1, 4));
        let reading = meter.reading(0).unwrap();
        assert_eq!(reading.peak_db, METER_FLOOR_DB);
    }
}
