//! PCM frame and format types

use serde::{Deserialize, Serialize};

/// Sample format of the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    /// Frame duration in milliseconds
    pub frame_ms: u32,
}

impl AudioFormat {
    /// Samples per channel in one frame
    pub fn frame_samples(&self) -> usize {
        (self.sample_rate as usize * self.frame_ms as usize) / 1000
    }

    /// Interleaved samples in one frame (all channels)
    pub fn samples_per_frame(&self) -> usize {
        self.frame_samples() * self.channels as usize
    }

    /// Bytes in one PCM frame
    pub fn frame_bytes(&self) -> usize {
        self.samples_per_frame() * (self.bits_per_sample as usize / 8)
    }

    pub fn frame_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.frame_ms as u64)
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: crate::constants::DEFAULT_SAMPLE_RATE,
            channels: crate::constants::DEFAULT_CHANNELS,
            bits_per_sample: 16,
            frame_ms: crate::constants::DEFAULT_FRAME_MS,
        }
    }
}

/// Serialize samples as little-endian i16 into `out`.
/// `out` must hold at least `samples.len() * 2` bytes.
pub fn samples_to_bytes(samples: &[i16], out: &mut [u8]) {
    for (sample, chunk) in samples.iter().zip(out.chunks_exact_mut(2)) {
        chunk.copy_from_slice(&sample.to_le_bytes());
    }
}

/// Deserialize little-endian i16 samples from `bytes` into `out`.
/// Returns the number of samples written.
pub fn bytes_to_samples(bytes: &[u8], out: &mut [i16]) -> usize {
    let mut written = 0;
    for (chunk, sample) in bytes.chunks_exact(2).zip(out.iter_mut()) {
        *sample = i16::from_le_bytes([chunk[0], chunk[1]]);
        written += 1;
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_format_sizes() {
        let format = AudioFormat::default();
        // 20 ms at 48 kHz mono
        assert_eq!(format.frame_samples(), 960);
        assert_eq!(format.frame_bytes(), 1920);
    }

    #[test]
    fn test_sample_byte_conversion() {
        let samples = [0i16, 1, -1, i16::MAX, i16::MIN];
        let mut bytes = [0u8; 10];
        samples_to_bytes(&samples, &mut bytes);

        let mut back = [0i16; 5];
        assert_eq!(bytes_to_samples(&bytes, &mut back), 5);
        assert_eq!(back, samples);
    }
}
