//! Wire protocol: frame header, packetizing and control payloads

pub mod control;
pub mod frame;
pub mod packetizer;

pub use control::{relay_copy, ControlMessage, DuplicateFilter, Heartbeat, NodeRole, StreamAnnounce};
pub use frame::{build_frame, FrameType, NetFrame, NetworkFrameHeader, DEFAULT_TTL, FRAME_MAGIC, FRAME_VERSION, HEADER_SIZE};
pub use packetizer::{Depacketizer, Packetizer, SeqEvent, SequenceTracker, TimestampBase};
