//! Opus decoder wrapper

use opus::Decoder;

use crate::audio::frame::AudioFormat;
use crate::codec::encoder::opus_channels;
use crate::codec::FrameDecoder;
use crate::error::CodecError;

/// Opus decoder producing interleaved i16 frames
pub struct OpusDecoder {
    decoder: Decoder,
    channels: usize,
    frames_decoded: u64,
}

impl OpusDecoder {
    pub fn new(format: &AudioFormat) -> Result<Self, CodecError> {
        let channels = opus_channels(format.channels).ok_or_else(|| {
            CodecError::DecoderInit(format!("Unsupported channel count: {}", format.channels))
        })?;

        let decoder = Decoder::new(format.sample_rate, channels)
            .map_err(|e| CodecError::DecoderInit(e.to_string()))?;

        Ok(Self {
            decoder,
            channels: format.channels as usize,
            frames_decoded: 0,
        })
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }
}

impl FrameDecoder for OpusDecoder {
    fn decode(&mut self, data: &[u8], out: &mut [i16]) -> Result<usize, CodecError> {
        let per_channel = self
            .decoder
            .decode(data, out, false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;
        self.frames_decoded += 1;
        Ok(per_channel * self.channels)
    }

    fn reset(&mut self) -> Result<(), CodecError> {
        self.decoder
            .reset_state()
            .map_err(|e| CodecError::DecoderInit(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FrameEncoder, OpusEncoder};
    use crate::config::CodecConfig;

    #[test]
    fn test_encode_decode_roundtrip() {
        let format = AudioFormat::default();
        let mut encoder = OpusEncoder::new(&format, &CodecConfig::default()).unwrap();
        let mut decoder = OpusDecoder::new(&format).unwrap();

        let frame_size = format.samples_per_frame();
        let samples: Vec<i16> = (0..frame_size)
            .map(|i| {
                let t = i as f32 / format.sample_rate as f32;
                ((t * 440.0 * std::f32::consts::TAU).sin() * 8000.0) as i16
            })
            .collect();

        let encoded = encoder.encode(&samples).unwrap();
        let mut decoded = vec![0i16; frame_size];
        assert_eq!(decoder.decode(&encoded, &mut decoded).unwrap(), frame_size);
        assert_eq!(decoder.frames_decoded(), 1);
    }

    #[test]
    fn test_garbage_is_a_decode_error() {
        let mut decoder = OpusDecoder::new(&AudioFormat::default()).unwrap();
        let mut out = vec![0i16; 960];
        // ten samples is smaller than any Opus frame
        assert!(decoder.decode(&[0xFF, 0xFF, 0xFF, 0xFF], &mut out[..10]).is_err());
        decoder.reset().unwrap();
    }
}
