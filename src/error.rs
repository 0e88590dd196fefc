//! Error types for the audio streaming pipeline

use std::time::Duration;
use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Ring buffer errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("Invalid buffer capacity: {0}")]
    InvalidCapacity(usize),

    #[error("Write would overflow: {needed} bytes needed, {free} free")]
    WouldOverflow { needed: usize, free: usize },

    #[error("Buffer empty")]
    Empty,

    #[error("Timed out waiting for data")]
    Timeout,

    #[error("An item is already borrowed from this buffer")]
    ItemOutstanding,

    #[error("Consumer still has a pending wake")]
    WakePending,
}

/// Wire format errors. Any of these discards the whole datagram.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Datagram too short: {0} bytes")]
    Truncated(usize),

    #[error("Bad magic byte: {0:#04x}")]
    BadMagic(u8),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown frame type: {0:#04x}")]
    UnknownFrameType(u8),

    #[error("Payload length mismatch: header says {declared}, datagram carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Unexpected frame type: {0:?}")]
    UnexpectedFrameType(crate::protocol::FrameType),

    #[error("Odd PCM payload length: {0}")]
    OddPcmPayload(usize),

    #[error("Stale packet: seq {seq}, last seen {last}")]
    Stale { seq: u16, last: u16 },

    #[error("Control payload error: {0}")]
    ControlPayload(String),
}

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Encoder initialization failed: {0}")]
    EncoderInit(String),

    #[error("Decoder initialization failed: {0}")]
    DecoderInit(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Decoding failed: {0}")]
    DecodingFailed(String),

    #[error("Invalid frame size: {0}")]
    InvalidFrameSize(usize),
}

/// Audio device errors
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Device I/O timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to open stream: {0}")]
    Stream(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Device disconnected")]
    Disconnected,
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Packet too large: {0} bytes")]
    PacketTooLarge(usize),

    #[error("Transport not connected")]
    NotConnected,
}

/// Pipeline orchestration errors
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Operation requires the {0:?} role")]
    WrongRole(crate::pipeline::Role),

    #[error("Pipeline is not running")]
    NotRunning,

    #[error("Audio device {0} is already used by a running pipeline")]
    DeviceBusy(String),

    #[error("Role I/O does not match configured role {0:?}")]
    IoMismatch(crate::pipeline::Role),

    #[error("Failed to spawn {task} task: {reason}")]
    Spawn { task: &'static str, reason: String },

    #[error("Frame buffer saturated: {0}")]
    Capacity(#[from] BufferError),

    #[error("Packet rejected: {0}")]
    Rejected(#[from] ProtocolError),

    #[error("Pipeline resources unavailable")]
    ResourcesLost,
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
