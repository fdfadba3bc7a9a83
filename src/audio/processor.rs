//! # Audio Processing
//!
//! Sample-level operations between the codec and the recognizer.
//!
//! ## Key Functions:
//! - **Format conversion**: Little-endian 16-bit PCM bytes ⇄ `i16` samples
//! - **Loudness boost**: Fixed linear gain with saturation
//! - **Audio units**: Fixed-format (16-bit, 16kHz, mono) containers with
//!   millisecond slicing, used by the noise-suppression window policy

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Sample rate of every unit handed to the recognizer.
pub const SAMPLE_RATE: u32 = 16000;

/// Bytes per sample (16-bit PCM).
pub const SAMPLE_WIDTH: usize = 2;

/// Channel count (mono).
pub const CHANNELS: u16 = 1;

/// Applies the fixed loudness policy to decoded PCM.
///
/// ## Purpose:
/// The device's microphone records quietly; the legacy middleware multiplied
/// every sample by a constant before recognition. The factor never adapts to
/// the signal.
#[derive(Debug, Clone, Copy)]
pub struct AudioProcessor {
    gain: f32,
}

impl AudioProcessor {
    /// Create a processor with the given gain factor.
    pub fn new(gain: f32) -> Self {
        Self { gain }
    }

    #[cfg(test)]
    pub fn gain(&self) -> f32 {
        self.gain
    }

    /// Multiply every sample by the gain factor.
    ///
    /// ## Saturation:
    /// Results are clamped to the 16-bit range and truncated toward zero, so a
    /// loud sample clips instead of wrapping around.
    pub fn apply_gain(&self, samples: &mut [i16]) {
        let factor = self.gain as f64;
        for sample in samples {
            let scaled = *sample as f64 * factor;
            *sample = scaled.clamp(i16::MIN as f64, i16::MAX as f64) as i16;
        }
    }

    /// Convert raw decoder output into a boosted audio unit.
    pub fn process(&self, pcm: &[u8]) -> anyhow::Result<PcmUnit> {
        let mut samples = pcm_bytes_to_samples(pcm)?;
        self.apply_gain(&mut samples);
        Ok(PcmUnit::new(samples))
    }
}

/// A fixed-format piece of audio: 16-bit samples, 16kHz, mono.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PcmUnit {
    samples: Vec<i16>,
}

impl PcmUnit {
    pub fn new(samples: Vec<i16>) -> Self {
        Self { samples }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration of this unit in milliseconds (rounded down).
    pub fn duration_ms(&self) -> u64 {
        (self.samples.len() as u64 * 1000) / SAMPLE_RATE as u64
    }

    /// Sub-unit covering `[start_ms, end_ms)`, clamped to the unit's length.
    ///
    /// ## Example:
    /// At 16kHz one millisecond is 16 samples, so `slice_ms(10, 20)` covers
    /// samples 160..320. Slicing past the end yields a shorter (or empty) unit.
    pub fn slice_ms(&self, start_ms: u64, end_ms: u64) -> PcmUnit {
        let per_ms = SAMPLE_RATE as u64 / 1000;
        let start = ((start_ms * per_ms) as usize).min(self.samples.len());
        let end = ((end_ms * per_ms) as usize).clamp(start, self.samples.len());
        PcmUnit::new(self.samples[start..end].to_vec())
    }

    /// Append another unit's samples to this one.
    pub fn append(&mut self, other: PcmUnit) {
        self.samples.extend(other.samples);
    }

    /// Little-endian PCM bytes, the format the recognizer accepts.
    pub fn to_bytes(&self) -> Vec<u8> {
        samples_to_pcm_bytes(&self.samples)
    }
}

/// Read little-endian 16-bit samples.
///
/// Odd-length input cannot be 16-bit PCM and is rejected.
pub fn pcm_bytes_to_samples(data: &[u8]) -> anyhow::Result<Vec<i16>> {
    if data.len() % SAMPLE_WIDTH != 0 {
        anyhow::bail!(
            "PCM data length {} is not a multiple of {} bytes",
            data.len(),
            SAMPLE_WIDTH
        );
    }

    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / SAMPLE_WIDTH);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    Ok(samples)
}

/// Write samples as little-endian 16-bit PCM.
pub fn samples_to_pcm_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * SAMPLE_WIDTH);
    for &sample in samples {
        // Writing into a Vec cannot fail
        let _ = bytes.write_i16::<LittleEndian>(sample);
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gain_multiplies_and_saturates() {
        let processor = AudioProcessor::new(6.0);
        let mut samples = vec![0, 100, -100, 10000, -10000, i16::MAX, i16::MIN];
        processor.apply_gain(&mut samples);
        assert_eq!(samples, vec![0, 600, -600, i16::MAX, i16::MIN, i16::MAX, i16::MIN]);
    }

    #[test]
    fn test_fractional_gain_truncates_toward_zero() {
        let processor = AudioProcessor::new(1.5);
        let mut samples = vec![3, -3];
        processor.apply_gain(&mut samples);
        assert_eq!(samples, vec![4, -4]);
    }

    #[test]
    fn test_process_rejects_odd_length() {
        let processor = AudioProcessor::new(2.0);
        assert!(processor.process(&[1, 2, 3]).is_err());

        let unit = processor.process(&samples_to_pcm_bytes(&[1, -2])).unwrap();
        assert_eq!(unit.samples(), &[2, -4]);
    }

    #[test]
    fn test_pcm_byte_conversion() {
        let samples = vec![0i16, 16384, -16384, 32767, -32768];
        let bytes = samples_to_pcm_bytes(&samples);
        assert_eq!(bytes.len(), 10);
        assert_eq!(&bytes[2..4], &16384i16.to_le_bytes());
        assert_eq!(pcm_bytes_to_samples(&bytes).unwrap(), samples);
    }

    #[test]
    fn test_slice_ms() {
        // 30ms of audio
        let unit = PcmUnit::new((0..480).map(|i| i as i16).collect());
        assert_eq!(unit.duration_ms(), 30);

        let second = unit.slice_ms(10, 20);
        assert_eq!(second.len(), 160);
        assert_eq!(second.samples()[0], 160);

        // Past the end
        assert_eq!(unit.slice_ms(20, 40).len(), 160);
        assert!(unit.slice_ms(40, 50).is_empty());
    }
}
