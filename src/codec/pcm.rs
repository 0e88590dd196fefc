//! Raw PCM passthrough for `AudioRaw` streams

use bytes::Bytes;

use crate::audio::frame::{bytes_to_samples, samples_to_bytes, AudioFormat};
use crate::codec::{FrameDecoder, FrameEncoder};
use crate::error::CodecError;

/// Serializes frames as little-endian i16 without compression
pub struct PcmCodec {
    samples_per_frame: usize,
    scratch: Vec<u8>,
}

impl PcmCodec {
    pub fn new(format: &AudioFormat) -> Self {
        let samples_per_frame = format.samples_per_frame();
        Self {
            samples_per_frame,
            scratch: vec![0u8; samples_per_frame * 2],
        }
    }
}

impl FrameEncoder for PcmCodec {
    fn encode(&mut self, pcm: &[i16]) -> Result<Bytes, CodecError> {
        if pcm.len() != self.samples_per_frame {
            return Err(CodecError::InvalidFrameSize(pcm.len()));
        }
        samples_to_bytes(pcm, &mut self.scratch);
        Ok(Bytes::copy_from_slice(&self.scratch))
    }

    fn reset(&mut self) -> Result<(), CodecError> {
        Ok(())
    }
}

impl FrameDecoder for PcmCodec {
    fn decode(&mut self, data: &[u8], out: &mut [i16]) -> Result<usize, CodecError> {
        if data.len() % 2 != 0 || data.len() / 2 > out.len() {
            return Err(CodecError::InvalidFrameSize(data.len()));
        }
        Ok(bytes_to_samples(data, out))
    }

    fn reset(&mut self) -> Result<(), CodecError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm_passthrough() {
        let format = AudioFormat::default();
        let mut codec = PcmCodec::new(&format);
        let input: Vec<i16> = (0..format.samples_per_frame() as i32).map(|i| (i * 7) as i16).collect();

        let encoded = FrameEncoder::encode(&mut codec, &input).unwrap();
        assert_eq!(encoded.len(), format.frame_bytes());

        let mut out = vec![0i16; input.len()];
        assert_eq!(codec.decode(&encoded, &mut out).unwrap(), input.len());
        assert_eq!(out, input);
    }

    #[test]
    fn test_pcm_rejects_wrong_sizes() {
        let mut codec = PcmCodec::new(&AudioFormat::default());
        assert!(FrameEncoder::encode(&mut codec, &[0i16; 10]).is_err());

        let mut out = [0i16; 4];
        assert!(codec.decode(&[0u8; 3], &mut out).is_err());
        assert!(codec.decode(&[0u8; 10], &mut out).is_err());
    }
}
