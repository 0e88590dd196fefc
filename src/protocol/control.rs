//! Control-layer frames and relay rules
//!
//! Heartbeat and stream-announce frames carry small fixed-size payloads and
//! never enter the audio path. Payloads are big-endian with fixed-width
//! integers.

use bincode::Options;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};

use crate::audio::frame::AudioFormat;
use crate::error::ProtocolError;
use crate::protocol::frame::{build_frame, FrameType, NetFrame, NetworkFrameHeader, HEADER_SIZE};

/// Entries remembered by [`DuplicateFilter`]
pub const DEDUPE_CACHE_SIZE: usize = 256;

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_big_endian()
        .with_fixint_encoding()
}

/// Node role advertised in heartbeats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum NodeRole {
    Receiver,
    Transmitter,
}

impl From<NodeRole> for u8 {
    fn from(role: NodeRole) -> u8 {
        match role {
            NodeRole::Receiver => 0,
            NodeRole::Transmitter => 1,
        }
    }
}

impl TryFrom<u8> for NodeRole {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(NodeRole::Receiver),
            1 => Ok(NodeRole::Transmitter),
            other => Err(format!("unknown node role {}", other)),
        }
    }
}

/// Periodic liveness beacon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub role: NodeRole,
    /// Hops from the transmitter
    pub hop_count: u8,
    pub uptime_ms: u32,
    pub children: u8,
    pub rssi: i8,
}

/// Stream parameters announced by a transmitter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamAnnounce {
    pub stream_id: u8,
    pub sample_rate: u32,
    pub channels: u8,
    pub bits_per_sample: u8,
    pub frame_ms: u16,
}

impl StreamAnnounce {
    pub fn from_format(stream_id: u8, format: &AudioFormat) -> Self {
        Self {
            stream_id,
            sample_rate: format.sample_rate,
            channels: format.channels as u8,
            bits_per_sample: format.bits_per_sample as u8,
            frame_ms: format.frame_ms as u16,
        }
    }

    /// Whether a receiver configured with `format` can play this stream
    pub fn matches(&self, format: &AudioFormat) -> bool {
        self.sample_rate == format.sample_rate
            && self.channels as u16 == format.channels
            && self.bits_per_sample as u16 == format.bits_per_sample
            && self.frame_ms as u32 == format.frame_ms
    }
}

/// Decoded control frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Heartbeat(Heartbeat),
    StreamAnnounce(StreamAnnounce),
    /// Opaque application control payload
    Other(Bytes),
}

impl ControlMessage {
    /// Decode the payload of a validated control frame
    pub fn from_frame(frame: &NetFrame<'_>) -> Result<Self, ProtocolError> {
        let decode_err = |e: bincode::Error| ProtocolError::ControlPayload(e.to_string());
        match frame.header.frame_type {
            FrameType::Heartbeat => wire_options()
                .deserialize(frame.payload)
                .map(ControlMessage::Heartbeat)
                .map_err(decode_err),
            FrameType::StreamAnnounce => wire_options()
                .deserialize(frame.payload)
                .map(ControlMessage::StreamAnnounce)
                .map_err(decode_err),
            FrameType::Control => Ok(ControlMessage::Other(Bytes::copy_from_slice(frame.payload))),
            other => Err(ProtocolError::UnexpectedFrameType(other)),
        }
    }

    pub fn frame_type(&self) -> FrameType {
        match self {
            ControlMessage::Heartbeat(_) => FrameType::Heartbeat,
            ControlMessage::StreamAnnounce(_) => FrameType::StreamAnnounce,
            ControlMessage::Other(_) => FrameType::Control,
        }
    }

    /// Encode as a complete datagram
    pub fn to_frame(&self, stream_id: u8, seq: u16, timestamp: u32) -> Result<Bytes, ProtocolError> {
        let encode_err = |e: bincode::Error| ProtocolError::ControlPayload(e.to_string());
        let payload = match self {
            ControlMessage::Heartbeat(hb) => wire_options().serialize(hb).map_err(encode_err)?,
            ControlMessage::StreamAnnounce(sa) => wire_options().serialize(sa).map_err(encode_err)?,
            ControlMessage::Other(bytes) => bytes.to_vec(),
        };
        let header = NetworkFrameHeader::new(self.frame_type(), stream_id, seq, timestamp, 0);
        build_frame(&header, &payload)
    }
}

/// Remembers recently seen `(stream_id, seq)` pairs so a frame reaching a
/// node over several mesh paths is handled once.
pub struct DuplicateFilter {
    seen: HashSet<(u8, u16)>,
    order: VecDeque<(u8, u16)>,
    capacity: usize,
}

impl DuplicateFilter {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Record the pair; returns false if it was already seen
    pub fn check_and_mark(&mut self, stream_id: u8, seq: u16) -> bool {
        let key = (stream_id, seq);
        if self.seen.contains(&key) {
            return false;
        }

        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(key);
        self.seen.insert(key);
        true
    }
}

impl Default for DuplicateFilter {
    fn default() -> Self {
        Self::new(DEDUPE_CACHE_SIZE)
    }
}

/// Copy of a validated datagram for forwarding, with the hop limit
/// decremented. Returns `None` when the hop limit is already exhausted.
pub fn relay_copy(frame: &NetFrame<'_>) -> Option<Bytes> {
    if frame.header.ttl == 0 {
        return None;
    }

    let header = NetworkFrameHeader {
        ttl: frame.header.ttl - 1,
        ..frame.header
    };
    let mut buf = bytes::BytesMut::with_capacity(HEADER_SIZE + frame.payload.len());
    header.encode(&mut buf);
    buf.extend_from_slice(frame.payload);
    Some(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_wire_size_and_round_trip() {
        let hb = Heartbeat {
            role: NodeRole::Transmitter,
            hop_count: 2,
            uptime_ms: 123_456,
            children: 3,
            rssi: -61,
        };
        let datagram = ControlMessage::Heartbeat(hb).to_frame(1, 7, 99).unwrap();
        assert_eq!(datagram.len(), HEADER_SIZE + 8);

        let frame = NetFrame::parse(&datagram).unwrap();
        assert_eq!(frame.header.frame_type, FrameType::Heartbeat);
        assert_eq!(ControlMessage::from_frame(&frame).unwrap(), ControlMessage::Heartbeat(hb));
    }

    #[test]
    fn test_stream_announce_matches_format() {
        let format = AudioFormat::default();
        let announce = StreamAnnounce::from_format(1, &format);
        assert!(announce.matches(&format));

        let datagram = ControlMessage::StreamAnnounce(announce).to_frame(1, 0, 0).unwrap();
        assert_eq!(datagram.len(), HEADER_SIZE + 9);
        // sample rate is big-endian right after the stream id
        assert_eq!(&datagram[HEADER_SIZE + 1..HEADER_SIZE + 5], &48_000u32.to_be_bytes());

        let stereo = AudioFormat { channels: 2, ..format };
        assert!(!announce.matches(&stereo));
    }

    #[test]
    fn test_audio_frame_is_not_control() {
        let header = NetworkFrameHeader::new(FrameType::AudioOpus, 1, 0, 0, 0);
        let datagram = build_frame(&header, &[1, 2]).unwrap();
        let frame = NetFrame::parse(&datagram).unwrap();
        assert!(matches!(
            ControlMessage::from_frame(&frame),
            Err(ProtocolError::UnexpectedFrameType(FrameType::AudioOpus))
        ));
    }

    #[test]
    fn test_duplicate_filter_evicts_oldest() {
        let mut filter = DuplicateFilter::new(2);
        assert!(filter.check_and_mark(1, 10));
        assert!(!filter.check_and_mark(1, 10));
        assert!(filter.check_and_mark(2, 10));
        assert!(filter.check_and_mark(1, 11));
        // (1, 10) was evicted
        assert!(filter.check_and_mark(1, 10));
    }

    #[test]
    fn test_relay_decrements_ttl() {
        let mut header = NetworkFrameHeader::new(FrameType::AudioOpus, 1, 5, 0, 0);
        header.ttl = 1;
        let datagram = build_frame(&header, &[4, 4]).unwrap();
        let frame = NetFrame::parse(&datagram).unwrap();

        let relayed = relay_copy(&frame).unwrap();
        let relayed = NetFrame::parse(&relayed).unwrap();
        assert_eq!(relayed.header.ttl, 0);
        assert_eq!(relayed.payload, &[4, 4]);
        assert!(relay_copy(&relayed).is_none());
    }
}
