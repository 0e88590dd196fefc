//! # Meshnet Audio
//!
//! Low-latency live audio between nodes of a lossy wireless/UDP mesh.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────── TRANSMIT NODE ────────────────────────────────┐
//! │                                                                               │
//! │  ┌────────────┐  ┌────────────┐  ┌────────────┐                               │
//! │  │ Line (cpal)│  │ Tone gen   │  │ USB (cpal) │   audio::source               │
//! │  └─────┬──────┘  └─────┬──────┘  └─────┬──────┘                               │
//! │        └───────────────┼───────────────┘  selected per frame (InputMode)      │
//! │                        ▼                                                      │
//! │               ┌─────────────────┐                                             │
//! │               │ Capture thread  │   pipeline::tasks                           │
//! │               └────────┬────────┘                                             │
//! │                        ▼                                                      │
//! │               ┌─────────────────┐                                             │
//! │               │ PCM StreamBuffer│   audio::buffer (wakes encode on write)     │
//! │               └────────┬────────┘                                             │
//! │                        ▼                                                      │
//! │               ┌─────────────────┐   ┌─────────────┐                           │
//! │               │ Encode thread   │──►│ Packetizer  │   codec + protocol        │
//! │               └─────────────────┘   └──────┬──────┘                           │
//! │                                            ▼                                  │
//! │                                  ┌───────────────────┐                        │
//! │                                  │ UdpTransport      │   network::udp         │
//! │                                  └─────────┬─────────┘                        │
//! └────────────────────────────────────────────┼──────────────────────────────────┘
//!                                              │ UDP broadcast, [14-byte header | payload]
//!                                              ▼
//! ┌──────────────────────────────── RECEIVE NODE ─────────────────────────────────┐
//! │                                  ┌───────────────────┐                        │
//! │                                  │ AudioReceiver     │──► relay (ttl - 1)     │
//! │                                  │ parse, dedupe     │                        │
//! │                                  └─────────┬─────────┘                        │
//! │                                            ▼ Pipeline::feed                   │
//! │               ┌─────────────────┐                                             │
//! │               │ Item buffer     │   whole compressed frames                   │
//! │               └────────┬────────┘                                             │
//! │                        ▼                                                      │
//! │               ┌─────────────────┐                                             │
//! │               │ Decode thread   │                                             │
//! │               └────────┬────────┘                                             │
//! │                        ▼                                                      │
//! │               ┌─────────────────┐                                             │
//! │               │ Jitter buffer   │   prefill, then steady playout            │
//! │               └────────┬────────┘                                             │
//! │                        ▼                                                      │
//! │               ┌─────────────────┐   ┌─────────────┐                           │
//! │               │ Playback thread │──►│ AudioSink   │   cpal or null            │
//! │               └─────────────────┘   └─────────────┘                           │
//! └───────────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod network;
pub mod pipeline;
pub mod protocol;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default sample rate for audio processing
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Default channel count (mono)
    pub const DEFAULT_CHANNELS: u16 = 1;

    /// Default Opus bitrate in bits per second
    pub const DEFAULT_BITRATE: u32 = 64_000;

    /// Default frame size in milliseconds
    pub const DEFAULT_FRAME_MS: u32 = 20;

    /// Default UDP port for the mesh
    pub const DEFAULT_UDP_PORT: u16 = 3333;

    /// Largest UDP payload we send or accept. Raw PCM frames exceed the MTU
    /// and rely on IP fragmentation.
    pub const MAX_DATAGRAM_SIZE: usize = 65_507;

    /// Interval between stats lines in the node binaries
    pub const STATS_INTERVAL_SECS: u64 = 10;
}
