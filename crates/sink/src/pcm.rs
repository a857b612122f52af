// Interleaved PCM byte conversion

use streamplay_core::{AudioError, Result, SampleEncoding, StreamFormat};
use symphonia::core::conv::FromSample;

/// Decode interleaved PCM bytes into f32 samples in [-1.0, 1.0], appending to `out`
pub fn to_f32_samples(format: &StreamFormat, bytes: &[u8], out: &mut Vec<f32>) -> Result<()> {
    let width = format.bytes_per_sample() as usize;
    if width == 0 {
        return Err(AudioError::UnsupportedFormat("Zero-width samples".to_string()));
    }
    out.reserve(bytes.len() / width);

    let chunks = bytes.chunks_exact(width);
    match (format.encoding, format.bits_per_sample) {
        (SampleEncoding::PcmUnsigned, 8) => {
            out.extend(chunks.map(|c| f32::from_sample(c[0])));
        }
        (SampleEncoding::PcmSigned, 8) => {
            out.extend(chunks.map(|c| f32::from_sample(c[0] as i8)));
        }
        (SampleEncoding::PcmSigned, 16) => {
            out.extend(chunks.map(|c| f32::from_sample(i16::from_le_bytes([c[0], c[1]]))));
        }
        (SampleEncoding::PcmSigned, 24) => {
            // Sign-extend into the top three bytes of an i32
            out.extend(chunks.map(|c| f32::from_sample(i32::from_le_bytes([0, c[0], c[1], c[2]]))));
        }
        (SampleEncoding::PcmSigned, 32) => {
            out.extend(
                chunks.map(|c| f32::from_sample(i32::from_le_bytes([c[0], c[1], c[2], c[3]]))),
            );
        }
        (SampleEncoding::PcmFloat, 32) => {
            out.extend(chunks.map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])));
        }
        (encoding, bits) => {
            return Err(AudioError::UnsupportedFormat(format!(
                "Cannot convert {:?} samples of {} bits",
                encoding, bits
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sixteen_bit_extremes() {
        let format = StreamFormat::pcm(44_100, 1, 16, SampleEncoding::PcmSigned);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&i16::MIN.to_le_bytes());
        bytes.extend_from_slice(&0i16.to_le_bytes());
        let mut out = Vec::new();
        to_f32_samples(&format, &bytes, &mut out).unwrap();
        assert_eq!(out.len(), 2);
        assert!((out[0] + 1.0).abs() < 1e-6);
        assert_eq!(out[1], 0.0);
    }

    #[test]
    fn twenty_four_bit_is_sign_extended() {
        let format = StreamFormat::pcm(48_000, 1, 24, SampleEncoding::PcmSigned);
        // -1 in 24-bit two's complement
        let bytes = [0xff, 0xff, 0xff];
        let mut out = Vec::new();
        to_f32_samples(&format, &bytes, &mut out).unwrap();
        assert!(out[0] < 0.0 && out[0] > -0.001);
    }

    #[test]
    fn unsigned_eight_bit_midpoint_is_silence() {
        let format = StreamFormat::pcm(8_000, 1, 8, SampleEncoding::PcmUnsigned);
        let mut out = Vec::new();
        to_f32_samples(&format, &[128], &mut out).unwrap();
        assert!(out[0].abs() < 1e-6);
    }
}
