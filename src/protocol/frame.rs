//! Network frame header and datagram validation
//!
//! Every datagram is a 14-byte header followed by exactly `payload_len`
//! bytes. Multi-byte fields are big-endian.
//!
//! ```text
//!  0      1        2     3          4..6   6..10      10..12       12   13
//! +------+--------+-----+----------+------+----------+------------+----+--------+
//! |magic |version |type |stream_id | seq  |timestamp |payload_len |ttl |reserved|
//! +------+--------+-----+----------+------+----------+------------+----+--------+
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// First byte of every frame
pub const FRAME_MAGIC: u8 = 0xA5;

/// Supported protocol version
pub const FRAME_VERSION: u8 = 1;

/// Header size in bytes
pub const HEADER_SIZE: usize = 14;

/// Hop limit stamped on locally originated frames
pub const DEFAULT_TTL: u8 = 6;

/// Frame type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameType {
    /// Uncompressed little-endian PCM16
    AudioRaw,
    /// One Opus frame
    AudioOpus,
    Heartbeat,
    StreamAnnounce,
    Control,
}

impl FrameType {
    pub fn to_u8(self) -> u8 {
        match self {
            FrameType::AudioRaw => 0x01,
            FrameType::AudioOpus => 0x02,
            FrameType::Heartbeat => 0x10,
            FrameType::StreamAnnounce => 0x11,
            FrameType::Control => 0x20,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(FrameType::AudioRaw),
            0x02 => Some(FrameType::AudioOpus),
            0x10 => Some(FrameType::Heartbeat),
            0x11 => Some(FrameType::StreamAnnounce),
            0x20 => Some(FrameType::Control),
            _ => None,
        }
    }

    /// Whether the audio path consumes this type
    pub fn is_audio(self) -> bool {
        matches!(self, FrameType::AudioRaw | FrameType::AudioOpus)
    }
}

/// Fixed 14-byte frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkFrameHeader {
    pub version: u8,
    pub frame_type: FrameType,
    pub stream_id: u8,
    /// Wraps mod 65536
    pub seq: u16,
    /// Sender timestamp
    pub timestamp: u32,
    pub payload_len: u16,
    /// Hop limit, decremented by relays
    pub ttl: u8,
    pub reserved: u8,
}

impl NetworkFrameHeader {
    pub fn new(frame_type: FrameType, stream_id: u8, seq: u16, timestamp: u32, payload_len: u16) -> Self {
        Self {
            version: FRAME_VERSION,
            frame_type,
            stream_id,
            seq,
            timestamp,
            payload_len,
            ttl: DEFAULT_TTL,
            reserved: 0,
        }
    }

    /// Write the header into `buf`
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(FRAME_MAGIC);
        buf.put_u8(self.version);
        buf.put_u8(self.frame_type.to_u8());
        buf.put_u8(self.stream_id);
        buf.put_u16(self.seq);
        buf.put_u32(self.timestamp);
        buf.put_u16(self.payload_len);
        buf.put_u8(self.ttl);
        buf.put_u8(self.reserved);
    }

    /// Parse a header from the start of `data`
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::Truncated(data.len()));
        }
        if data[0] != FRAME_MAGIC {
            return Err(ProtocolError::BadMagic(data[0]));
        }
        if data[1] != FRAME_VERSION {
            return Err(ProtocolError::UnsupportedVersion(data[1]));
        }
        let frame_type = FrameType::from_u8(data[2]).ok_or(ProtocolError::UnknownFrameType(data[2]))?;

        Ok(Self {
            version: data[1],
            frame_type,
            stream_id: data[3],
            seq: u16::from_be_bytes([data[4], data[5]]),
            timestamp: u32::from_be_bytes([data[6], data[7], data[8], data[9]]),
            payload_len: u16::from_be_bytes([data[10], data[11]]),
            ttl: data[12],
            reserved: data[13],
        })
    }
}

/// A validated datagram: header plus its payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetFrame<'a> {
    pub header: NetworkFrameHeader,
    pub payload: &'a [u8],
}

impl<'a> NetFrame<'a> {
    /// Validate a whole datagram. Nothing is accepted from a datagram that
    /// fails any check.
    pub fn parse(datagram: &'a [u8]) -> Result<Self, ProtocolError> {
        let header = NetworkFrameHeader::parse(datagram)?;
        let actual = datagram.len() - HEADER_SIZE;
        if header.payload_len as usize != actual {
            return Err(ProtocolError::LengthMismatch {
                declared: header.payload_len as usize,
                actual,
            });
        }

        Ok(Self {
            header,
            payload: &datagram[HEADER_SIZE..],
        })
    }
}

/// Build a complete datagram from a header template and payload.
/// `payload_len` in the template is overwritten with the real length.
pub fn build_frame(header: &NetworkFrameHeader, payload: &[u8]) -> Result<Bytes, ProtocolError> {
    let payload_len = u16::try_from(payload.len()).map_err(|_| ProtocolError::PayloadTooLarge(payload.len()))?;
    let header = NetworkFrameHeader { payload_len, ..*header };

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    header.encode(&mut buf);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> Bytes {
        let header = NetworkFrameHeader::new(FrameType::AudioOpus, 1, 0xBEEF, 0x0102_0304, 0);
        build_frame(&header, &[9, 8, 7]).unwrap()
    }

    #[test]
    fn test_header_layout_is_network_order() {
        let frame = sample_frame();
        assert_eq!(frame.len(), HEADER_SIZE + 3);
        assert_eq!(
            &frame[..HEADER_SIZE],
            &[0xA5, 1, 0x02, 1, 0xBE, 0xEF, 1, 2, 3, 4, 0, 3, DEFAULT_TTL, 0]
        );
        assert_eq!(&frame[HEADER_SIZE..], &[9, 8, 7]);
    }

    #[test]
    fn test_parse_valid_frame() {
        let frame = sample_frame();
        let parsed = NetFrame::parse(&frame).unwrap();
        assert_eq!(parsed.header.frame_type, FrameType::AudioOpus);
        assert_eq!(parsed.header.seq, 0xBEEF);
        assert_eq!(parsed.header.timestamp, 0x0102_0304);
        assert_eq!(parsed.header.ttl, DEFAULT_TTL);
        assert_eq!(parsed.payload, &[9, 8, 7]);
    }

    #[test]
    fn test_reject_flipped_magic() {
        let mut frame = sample_frame().to_vec();
        frame[0] ^= 0xFF;
        assert_eq!(NetFrame::parse(&frame), Err(ProtocolError::BadMagic(0x5A)));
    }

    #[test]
    fn test_reject_wrong_version_and_type() {
        let mut frame = sample_frame().to_vec();
        frame[1] = 2;
        assert_eq!(NetFrame::parse(&frame), Err(ProtocolError::UnsupportedVersion(2)));

        let mut frame = sample_frame().to_vec();
        frame[2] = 0x7F;
        assert_eq!(NetFrame::parse(&frame), Err(ProtocolError::UnknownFrameType(0x7F)));
    }

    #[test]
    fn test_reject_length_mismatch() {
        let mut frame = sample_frame().to_vec();
        frame.push(0);
        assert_eq!(
            NetFrame::parse(&frame),
            Err(ProtocolError::LengthMismatch { declared: 3, actual: 4 })
        );

        let short = &sample_frame()[..HEADER_SIZE + 2];
        assert!(matches!(NetFrame::parse(short), Err(ProtocolError::LengthMismatch { .. })));

        assert_eq!(NetFrame::parse(&[FRAME_MAGIC; 5]), Err(ProtocolError::Truncated(5)));
    }
}
