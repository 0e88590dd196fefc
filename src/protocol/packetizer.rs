//! Packetizer, depacketizer and sequence accounting

use bytes::Bytes;
use std::time::Instant;
use tracing::{debug, warn};

use crate::audio::frame::{bytes_to_samples, samples_to_bytes};
use crate::error::ProtocolError;
use crate::protocol::frame::{build_frame, FrameType, NetFrame, NetworkFrameHeader};

/// Consecutive stale packets after which the sender is assumed to have
/// restarted and the tracker takes the next sequence as a new baseline
const RESYNC_AFTER_STALE: u32 = 16;

/// Clock used for the header timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampBase {
    /// Running count of samples emitted, wrapping
    Samples,
    /// Milliseconds since the packetizer was created
    Millis,
}

/// Stamps outgoing payloads with a sequence number and timestamp
pub struct Packetizer {
    stream_id: u8,
    frame_type: FrameType,
    ttl: u8,
    base: TimestampBase,
    seq: u16,
    timestamp_samples: u32,
    epoch: Instant,
    scratch: Vec<u8>,
}

impl Packetizer {
    pub fn new(stream_id: u8, frame_type: FrameType, ttl: u8, base: TimestampBase) -> Self {
        Self {
            stream_id,
            frame_type,
            ttl,
            base,
            seq: 0,
            timestamp_samples: 0,
            epoch: Instant::now(),
            scratch: Vec::new(),
        }
    }

    /// Wrap one payload in a frame. `samples` is the per-frame sample count
    /// the payload represents. Sequence and timestamp only advance on success.
    pub fn process(&mut self, payload: &[u8], samples: u32) -> Result<Bytes, ProtocolError> {
        let timestamp = match self.base {
            TimestampBase::Samples => self.timestamp_samples,
            TimestampBase::Millis => self.epoch.elapsed().as_millis() as u32,
        };

        let mut header = NetworkFrameHeader::new(self.frame_type, self.stream_id, self.seq, timestamp, 0);
        header.ttl = self.ttl;
        let frame = build_frame(&header, payload)?;

        self.seq = self.seq.wrapping_add(1);
        self.timestamp_samples = self.timestamp_samples.wrapping_add(samples);
        Ok(frame)
    }

    /// Serialize PCM as little-endian i16 and wrap it
    pub fn process_pcm(&mut self, pcm: &[i16]) -> Result<Bytes, ProtocolError> {
        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.resize(pcm.len() * 2, 0);
        samples_to_bytes(pcm, &mut scratch);
        let result = self.process(&scratch, pcm.len() as u32);
        self.scratch = scratch;
        result
    }

    /// Sequence number the next frame will carry
    pub fn next_seq(&self) -> u16 {
        self.seq
    }

    pub fn stream_id(&self) -> u8 {
        self.stream_id
    }
}

/// Classification of an incoming sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqEvent {
    /// First packet seen; sets the baseline
    First,
    InOrder,
    /// Ahead of the expected sequence by this many packets
    Gap(u16),
    /// Behind the last sequence but within the stale window; accepted
    Reordered,
    /// Too far behind; rejected
    Stale,
    /// Stale run long enough to treat as a sender restart
    Resync,
}

impl SeqEvent {
    pub fn is_accepted(self) -> bool {
        !matches!(self, SeqEvent::Stale)
    }
}

/// Loss, reorder and staleness accounting over a wrapping 16-bit sequence
#[derive(Debug, Clone)]
pub struct SequenceTracker {
    last: Option<u16>,
    stale_window: u16,
    stale_run: u32,
    lost: u64,
    reordered: u64,
    stale: u64,
}

impl SequenceTracker {
    pub fn new(stale_window: u16) -> Self {
        Self {
            last: None,
            stale_window,
            stale_run: 0,
            lost: 0,
            reordered: 0,
            stale: 0,
        }
    }

    /// Account for `seq`. The gap to the expected sequence is read as a
    /// signed 16-bit value so wraparound counts as in-order.
    pub fn observe(&mut self, seq: u16) -> SeqEvent {
        let last = match self.last {
            Some(last) => last,
            None => {
                self.last = Some(seq);
                return SeqEvent::First;
            }
        };

        let gap = seq.wrapping_sub(last.wrapping_add(1)) as i16;
        if gap >= 0 {
            self.stale_run = 0;
            self.last = Some(seq);
            if gap == 0 {
                return SeqEvent::InOrder;
            }
            self.lost += gap as u64;
            return SeqEvent::Gap(gap as u16);
        }

        let behind = last.wrapping_sub(seq);
        if behind > self.stale_window {
            self.stale += 1;
            self.stale_run += 1;
            if self.stale_run >= RESYNC_AFTER_STALE {
                debug!(seq, last, "sequence resync after stale run");
                self.stale_run = 0;
                self.last = Some(seq);
                return SeqEvent::Resync;
            }
            return SeqEvent::Stale;
        }

        self.stale_run = 0;
        self.reordered += 1;
        self.last = Some(seq);
        SeqEvent::Reordered
    }

    pub fn last_seq(&self) -> Option<u16> {
        self.last
    }

    pub fn lost(&self) -> u64 {
        self.lost
    }

    pub fn reordered(&self) -> u64 {
        self.reordered
    }

    pub fn stale(&self) -> u64 {
        self.stale
    }

    pub fn stale_window(&self) -> u16 {
        self.stale_window
    }
}

/// Validates raw PCM frames and extracts their samples
pub struct Depacketizer {
    tracker: SequenceTracker,
    packets: u64,
    rejected: u64,
}

impl Depacketizer {
    pub fn new(stale_window: u16) -> Self {
        Self {
            tracker: SequenceTracker::new(stale_window),
            packets: 0,
            rejected: 0,
        }
    }

    /// Decode one datagram into `out`, returning the sample count. Nothing is
    /// written to `out` when the datagram is rejected.
    pub fn process(&mut self, datagram: &[u8], out: &mut [i16]) -> Result<usize, ProtocolError> {
        let result = self.extract(datagram, out);
        if result.is_err() {
            self.rejected += 1;
        }
        result
    }

    fn extract(&mut self, datagram: &[u8], out: &mut [i16]) -> Result<usize, ProtocolError> {
        let frame = NetFrame::parse(datagram)?;
        if frame.header.frame_type != FrameType::AudioRaw {
            return Err(ProtocolError::UnexpectedFrameType(frame.header.frame_type));
        }
        if frame.payload.len() % 2 != 0 {
            return Err(ProtocolError::OddPcmPayload(frame.payload.len()));
        }
        if frame.payload.len() / 2 > out.len() {
            return Err(ProtocolError::PayloadTooLarge(frame.payload.len()));
        }

        let seq = frame.header.seq;
        match self.tracker.observe(seq) {
            SeqEvent::Stale => {
                let last = self.tracker.last_seq().unwrap_or(seq);
                return Err(ProtocolError::Stale { seq, last });
            }
            SeqEvent::Gap(lost) => {
                warn!(seq, lost, "packet loss detected");
            }
            _ => {}
        }

        self.packets += 1;
        Ok(bytes_to_samples(frame.payload, out))
    }

    pub fn tracker(&self) -> &SequenceTracker {
        &self.tracker
    }

    pub fn packets(&self) -> u64 {
        self.packets
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::HEADER_SIZE;

    fn pcm(n: usize, seed: i16) -> Vec<i16> {
        (0..n as i16).map(|i| i.wrapping_mul(331).wrapping_add(seed)).collect()
    }

    #[test]
    fn test_packetizer_stamps_seq_and_samples() {
        let mut p = Packetizer::new(3, FrameType::AudioRaw, 6, TimestampBase::Samples);
        let a = p.process_pcm(&pcm(960, 0)).unwrap();
        let b = p.process_pcm(&pcm(960, 1)).unwrap();

        let a = NetFrame::parse(&a).unwrap();
        let b = NetFrame::parse(&b).unwrap();
        assert_eq!((a.header.seq, a.header.timestamp), (0, 0));
        assert_eq!((b.header.seq, b.header.timestamp), (1, 960));
        assert_eq!(b.header.stream_id, 3);
        assert_eq!(b.payload.len(), 1920);
        assert_eq!(p.next_seq(), 2);
    }

    #[test]
    fn test_sequence_wraps() {
        let mut tracker = SequenceTracker::new(3);
        assert_eq!(tracker.observe(u16::MAX - 1), SeqEvent::First);
        assert_eq!(tracker.observe(u16::MAX), SeqEvent::InOrder);
        assert_eq!(tracker.observe(0), SeqEvent::InOrder);
        assert_eq!(tracker.observe(2), SeqEvent::Gap(1));
        assert_eq!(tracker.lost(), 1);
    }

    #[test]
    fn test_reorder_and_stale() {
        let mut tracker = SequenceTracker::new(3);
        tracker.observe(10);
        assert_eq!(tracker.observe(8), SeqEvent::Reordered);
        assert_eq!(tracker.last_seq(), Some(8));
        assert_eq!(tracker.observe(20), SeqEvent::Gap(11));
        assert_eq!(tracker.observe(16), SeqEvent::Stale);
        // rejected packets do not move the baseline
        assert_eq!(tracker.last_seq(), Some(20));
        assert_eq!((tracker.reordered(), tracker.stale()), (1, 1));
    }

    #[test]
    fn test_resync_after_long_stale_run() {
        let mut tracker = SequenceTracker::new(3);
        tracker.observe(30_000);
        for seq in 0..RESYNC_AFTER_STALE as u16 - 1 {
            assert_eq!(tracker.observe(seq), SeqEvent::Stale);
        }
        assert_eq!(tracker.observe(100), SeqEvent::Resync);
        assert_eq!(tracker.observe(101), SeqEvent::InOrder);
    }

    #[test]
    fn test_gap_accounting_delivers_everything() {
        let mut p = Packetizer::new(1, FrameType::AudioRaw, 6, TimestampBase::Samples);
        let frames: Vec<Bytes> = (0..7).map(|i| p.process_pcm(&pcm(4, i)).unwrap()).collect();

        let mut d = Depacketizer::new(3);
        let mut out = [0i16; 4];
        let mut delivered = 0;
        for idx in [0usize, 1, 2, 5, 6] {
            assert_eq!(d.process(&frames[idx], &mut out).unwrap(), 4);
            delivered += 1;
        }
        assert_eq!(delivered, 5);
        assert_eq!(d.packets(), 5);
        // 3 and 4 never arrived
        assert_eq!(d.tracker().lost(), 2);
    }

    #[test]
    fn test_invalid_datagrams_produce_no_output() {
        let mut p = Packetizer::new(1, FrameType::AudioRaw, 6, TimestampBase::Samples);
        let frame = p.process_pcm(&pcm(8, 5)).unwrap();
        let mut d = Depacketizer::new(3);
        let mut out = [0i16; 8];

        let mut bad_magic = frame.to_vec();
        bad_magic[0] ^= 0xFF;
        assert!(d.process(&bad_magic, &mut out).is_err());

        let mut bad_len = frame.to_vec();
        bad_len[HEADER_SIZE - 3] = 3;
        assert!(d.process(&bad_len, &mut out).is_err());

        assert_eq!(out, [0i16; 8]);
        assert_eq!(d.rejected(), 2);
        assert_eq!(d.packets(), 0);
    }

    #[test]
    fn test_opus_frame_rejected_by_raw_depacketizer() {
        let mut p = Packetizer::new(1, FrameType::AudioOpus, 6, TimestampBase::Millis);
        let frame = p.process(&[1, 2, 3, 4], 960).unwrap();
        let mut out = [0i16; 8];
        assert_eq!(
            Depacketizer::new(3).process(&frame, &mut out),
            Err(ProtocolError::UnexpectedFrameType(FrameType::AudioOpus))
        );
    }

    #[test]
    fn test_raw_round_trip_is_bit_identical() {
        let samples: Vec<i16> = vec![i16::MIN, -1, 0, 1, i16::MAX, 0x1234, -0x1234, 7];
        let mut p = Packetizer::new(1, FrameType::AudioRaw, 6, TimestampBase::Samples);
        let frame = p.process_pcm(&samples).unwrap();

        let mut out = vec![0i16; samples.len()];
        let n = Depacketizer::new(3).process(&frame, &mut out).unwrap();
        assert_eq!(n, samples.len());
        assert_eq!(out, samples);
    }
}
