//! Opus encoder wrapper
//!
//! Encodes fixed-length i16 frames with settings from [`CodecConfig`].

use bytes::Bytes;
use opus::{Application, Bitrate, Channels, Encoder};

use crate::audio::frame::AudioFormat;
use crate::codec::{FrameEncoder, OPUS_MAX_FRAME_BYTES};
use crate::config::CodecConfig;
use crate::error::CodecError;

pub(crate) fn opus_channels(channels: u16) -> Option<Channels> {
    match channels {
        1 => Some(Channels::Mono),
        2 => Some(Channels::Stereo),
        _ => None,
    }
}

/// Opus encoder with a reusable output buffer
pub struct OpusEncoder {
    encoder: Encoder,
    config: CodecConfig,
    samples_per_frame: usize,
    /// Encoding buffer (reused to avoid allocations)
    encode_buffer: Vec<u8>,
    frames_encoded: u64,
    bytes_produced: u64,
}

impl OpusEncoder {
    pub fn new(format: &AudioFormat, config: &CodecConfig) -> Result<Self, CodecError> {
        let channels = opus_channels(format.channels).ok_or_else(|| {
            CodecError::EncoderInit(format!("Unsupported channel count: {}", format.channels))
        })?;

        let mut encoder = Encoder::new(format.sample_rate, channels, Application::Audio)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;
        Self::configure_encoder(&mut encoder, config)?;

        Ok(Self {
            encoder,
            config: config.clone(),
            samples_per_frame: format.samples_per_frame(),
            encode_buffer: vec![0u8; OPUS_MAX_FRAME_BYTES],
            frames_encoded: 0,
            bytes_produced: 0,
        })
    }

    fn configure_encoder(encoder: &mut Encoder, config: &CodecConfig) -> Result<(), CodecError> {
        encoder
            .set_bitrate(Bitrate::Bits(config.bitrate as i32))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;

        encoder
            .set_vbr(config.vbr)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set VBR: {}", e)))?;

        if config.vbr && config.vbr_constraint {
            encoder
                .set_vbr_constraint(true)
                .map_err(|e| CodecError::EncoderInit(format!("Failed to set CVBR: {}", e)))?;
        }

        encoder
            .set_inband_fec(config.inband_fec)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set FEC: {}", e)))?;

        if config.inband_fec {
            encoder
                .set_packet_loss_perc(config.packet_loss_perc as i32)
                .map_err(|e| CodecError::EncoderInit(format!("Failed to set packet loss: {}", e)))?;
        }

        Ok(())
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    pub fn samples_per_frame(&self) -> usize {
        self.samples_per_frame
    }

    pub fn frames_encoded(&self) -> u64 {
        self.frames_encoded
    }

    /// Mean encoded frame size in bytes
    pub fn average_frame_size(&self) -> f32 {
        if self.frames_encoded > 0 {
            self.bytes_produced as f32 / self.frames_encoded as f32
        } else {
            0.0
        }
    }
}

impl FrameEncoder for OpusEncoder {
    /// Input must hold exactly one frame of interleaved samples
    fn encode(&mut self, pcm: &[i16]) -> Result<Bytes, CodecError> {
        if pcm.len() != self.samples_per_frame {
            return Err(CodecError::InvalidFrameSize(pcm.len()));
        }

        let size = self
            .encoder
            .encode(pcm, &mut self.encode_buffer)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;

        self.frames_encoded += 1;
        self.bytes_produced += size as u64;

        Ok(Bytes::copy_from_slice(&self.encode_buffer[..size]))
    }

    fn reset(&mut self) -> Result<(), CodecError> {
        self.encoder
            .reset_state()
            .map_err(|e| CodecError::EncoderInit(e.to_string()))
    }
}
