//! Frame codecs
//!
//! The pipeline drives codecs through [`FrameEncoder`] and [`FrameDecoder`].
//! A failed call means "drop this frame"; the pipeline decides when a run of
//! failures warrants a [`reset`](FrameEncoder::reset).

pub mod decoder;
pub mod encoder;
pub mod pcm;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::audio::frame::AudioFormat;
use crate::config::CodecConfig;
use crate::error::CodecError;
use crate::protocol::FrameType;

pub use decoder::OpusDecoder;
pub use encoder::OpusEncoder;
pub use pcm::PcmCodec;

/// Largest compressed frame the pipeline carries
pub const OPUS_MAX_FRAME_BYTES: usize = 512;

/// Wire encoding of audio frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    #[default]
    Opus,
    /// Uncompressed little-endian PCM16
    Pcm,
}

impl CodecKind {
    pub fn frame_type(self) -> FrameType {
        match self {
            CodecKind::Opus => FrameType::AudioOpus,
            CodecKind::Pcm => FrameType::AudioRaw,
        }
    }

    /// Upper bound on one encoded frame
    pub fn max_frame_bytes(self, format: &AudioFormat) -> usize {
        match self {
            CodecKind::Opus => OPUS_MAX_FRAME_BYTES,
            CodecKind::Pcm => format.frame_bytes(),
        }
    }
}

/// Compresses one frame of interleaved PCM
pub trait FrameEncoder: Send {
    fn encode(&mut self, pcm: &[i16]) -> Result<Bytes, CodecError>;

    fn reset(&mut self) -> Result<(), CodecError>;
}

/// Expands one encoded frame into interleaved PCM, returning the total
/// sample count written to `out`
pub trait FrameDecoder: Send {
    fn decode(&mut self, data: &[u8], out: &mut [i16]) -> Result<usize, CodecError>;

    fn reset(&mut self) -> Result<(), CodecError>;
}

pub fn create_encoder(format: &AudioFormat, config: &CodecConfig) -> Result<Box<dyn FrameEncoder>, CodecError> {
    match config.kind {
        CodecKind::Opus => Ok(Box::new(OpusEncoder::new(format, config)?)),
        CodecKind::Pcm => Ok(Box::new(PcmCodec::new(format))),
    }
}

pub fn create_decoder(format: &AudioFormat, config: &CodecConfig) -> Result<Box<dyn FrameDecoder>, CodecError> {
    match config.kind {
        CodecKind::Opus => Ok(Box::new(OpusDecoder::new(format)?)),
        CodecKind::Pcm => Ok(Box::new(PcmCodec::new(format))),
    }
}
