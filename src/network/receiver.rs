//! Network receive thread
//!
//! Pulls datagrams off the mesh socket, validates them, forwards audio with
//! hops left when relaying is enabled, and hands audio frames for the local
//! stream to the receive pipeline. Audio arriving with a zero hop limit is
//! discarded.

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::audio::frame::AudioFormat;
use crate::config::AppConfig;
use crate::constants::MAX_DATAGRAM_SIZE;
use crate::error::{NetworkError, PipelineError};
use crate::network::UdpTransport;
use crate::pipeline::health::LogThrottle;
use crate::pipeline::PipelineFeed;
use crate::protocol::{relay_copy, ControlMessage, DuplicateFilter, FrameType, NetFrame};

const LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Counters kept by the receive thread
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReceiverStats {
    pub datagrams: u64,
    pub audio_frames: u64,
    pub control_frames: u64,
    pub malformed: u64,
    pub duplicates: u64,
    /// Audio that arrived with its hop limit spent
    pub expired: u64,
    /// Audio for a stream this node does not play
    pub foreign_frames: u64,
    /// Frames the pipeline refused (stale, full, wrong codec)
    pub rejected: u64,
    pub relayed: u64,
    pub format_mismatches: u64,
    /// Hop count in the most recent heartbeat heard
    pub last_peer_hops: Option<u8>,
}

#[derive(Debug, Clone)]
pub struct ReceiverOptions {
    pub stream_id: u8,
    pub format: AudioFormat,
    /// Audio frame type the local decoder understands
    pub frame_type: FrameType,
    pub relay: bool,
    pub dedupe_entries: usize,
}

impl ReceiverOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            stream_id: config.node.stream_id,
            format: config.audio.format(),
            frame_type: config.codec.kind.frame_type(),
            relay: config.network.relay,
            dedupe_entries: config.network.dedupe_entries,
        }
    }
}

/// Where a datagram should go
#[derive(Debug, PartialEq)]
pub(crate) enum Routed<'a> {
    Audio {
        payload: &'a [u8],
        seq: u16,
        timestamp: u32,
    },
    Control(ControlMessage),
    Dropped,
}

/// Per-datagram decisions, independent of the socket
pub(crate) struct FrameRouter {
    options: ReceiverOptions,
    audio_seen: DuplicateFilter,
    stats: Arc<Mutex<ReceiverStats>>,
    malformed_log: LogThrottle,
}

impl FrameRouter {
    pub(crate) fn new(options: ReceiverOptions, stats: Arc<Mutex<ReceiverStats>>) -> Self {
        Self {
            audio_seen: DuplicateFilter::new(options.dedupe_entries),
            options,
            stats,
            malformed_log: LogThrottle::new(LOG_INTERVAL),
        }
    }

    /// Classify one datagram. The second value is the copy to forward, if any.
    pub(crate) fn route<'a>(&mut self, datagram: &'a [u8]) -> (Routed<'a>, Option<Bytes>) {
        self.stats.lock().datagrams += 1;

        let frame = match NetFrame::parse(datagram) {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.lock().malformed += 1;
                if let Some(skipped) = self.malformed_log.ready() {
                    debug!(error = %e, skipped, "Malformed datagram dropped");
                }
                return (Routed::Dropped, None);
            }
        };

        let header = frame.header;
        if !header.frame_type.is_audio() {
            // Beacons are per hop: never deduplicated or forwarded
            return (self.route_control(&frame), None);
        }

        if !self.audio_seen.check_and_mark(header.stream_id, header.seq) {
            self.stats.lock().duplicates += 1;
            return (Routed::Dropped, None);
        }
        if header.ttl == 0 {
            self.stats.lock().expired += 1;
            return (Routed::Dropped, None);
        }

        let forward = if self.options.relay { relay_copy(&frame) } else { None };
        if forward.is_some() {
            self.stats.lock().relayed += 1;
        }
        (self.route_audio(&frame), forward)
    }

    fn route_control(&mut self, frame: &NetFrame<'_>) -> Routed<'static> {
        self.stats.lock().control_frames += 1;
        match ControlMessage::from_frame(frame) {
            Ok(message) => {
                self.observe_control(&message);
                Routed::Control(message)
            }
            Err(e) => {
                self.stats.lock().malformed += 1;
                debug!(error = %e, "Undecodable control frame");
                Routed::Dropped
            }
        }
    }

    fn route_audio<'a>(&mut self, frame: &NetFrame<'a>) -> Routed<'a> {
        let header = frame.header;
        let mut stats = self.stats.lock();
        if header.stream_id != self.options.stream_id {
            stats.foreign_frames += 1;
            return Routed::Dropped;
        }
        if header.frame_type != self.options.frame_type {
            stats.rejected += 1;
            return Routed::Dropped;
        }

        stats.audio_frames += 1;
        Routed::Audio {
            payload: frame.payload,
            seq: header.seq,
            timestamp: header.timestamp,
        }
    }

    fn observe_control(&mut self, message: &ControlMessage) {
        match message {
            ControlMessage::Heartbeat(hb) => {
                self.stats.lock().last_peer_hops = Some(hb.hop_count);
                debug!(role = ?hb.role, hops = hb.hop_count, uptime_ms = hb.uptime_ms, "Heartbeat");
            }
            ControlMessage::StreamAnnounce(announce) if announce.stream_id == self.options.stream_id => {
                if !announce.matches(&self.options.format) {
                    let mut stats = self.stats.lock();
                    stats.format_mismatches += 1;
                    // Warn once, the counter tracks repeats
                    if stats.format_mismatches == 1 {
                        warn!(
                            announced_rate = announce.sample_rate,
                            announced_channels = announce.channels,
                            announced_frame_ms = announce.frame_ms,
                            local_rate = self.options.format.sample_rate,
                            "Announced stream format differs from local playback format"
                        );
                    }
                }
            }
            ControlMessage::StreamAnnounce(_) | ControlMessage::Other(_) => {}
        }
    }
}

/// Receive thread feeding one pipeline
pub struct AudioReceiver {
    running: Arc<AtomicBool>,
    stats: Arc<Mutex<ReceiverStats>>,
    handle: Option<JoinHandle<()>>,
}

impl AudioReceiver {
    pub fn spawn(transport: UdpTransport, feed: PipelineFeed, options: ReceiverOptions) -> Result<Self, NetworkError> {
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(Mutex::new(ReceiverStats::default()));
        let router = FrameRouter::new(options, stats.clone());

        let thread_running = running.clone();
        let handle = thread::Builder::new()
            .name("meshnet-net-rx".into())
            .spawn(move || receive_loop(transport, feed, router, thread_running))
            .map_err(|e| NetworkError::ReceiveFailed(format!("spawn: {}", e)))?;

        Ok(Self {
            running,
            stats,
            handle: Some(handle),
        })
    }

    pub fn stats(&self) -> ReceiverStats {
        self.stats.lock().clone()
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Network receive thread panicked");
            }
        }
    }
}

impl Drop for AudioReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_loop(transport: UdpTransport, feed: PipelineFeed, mut router: FrameRouter, running: Arc<AtomicBool>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut feed_log = LogThrottle::new(LOG_INTERVAL);
    let mut net_log = LogThrottle::new(LOG_INTERVAL);

    info!("Network receive thread started");
    while running.load(Ordering::Acquire) {
        let len = match transport.recv(&mut buf) {
            Ok(Some((len, _from))) => len,
            Ok(None) => continue,
            Err(e) => {
                if let Some(skipped) = net_log.ready() {
                    warn!(error = %e, skipped, "Receive failed");
                }
                thread::sleep(Duration::from_millis(10));
                continue;
            }
        };

        let (routed, forward) = router.route(&buf[..len]);
        if let Some(copy) = forward {
            if let Err(e) = transport.send_to(&copy, transport.destination()) {
                if let Some(skipped) = net_log.ready() {
                    warn!(error = %e, skipped, "Relay send failed");
                }
            }
        }

        let Routed::Audio { payload, seq, timestamp } = routed else {
            continue;
        };
        match feed.feed(payload, seq, timestamp) {
            Ok(()) => {}
            // Not started yet or shutting down
            Err(PipelineError::NotRunning) => {}
            Err(e) => {
                router.stats.lock().rejected += 1;
                if let Some(skipped) = feed_log.ready() {
                    debug!(error = %e, seq, skipped, "Frame not accepted by pipeline");
                }
            }
        }
    }
    info!("Network receive thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{build_frame, Heartbeat, NetworkFrameHeader, NodeRole, StreamAnnounce};

    fn options(relay: bool) -> ReceiverOptions {
        ReceiverOptions {
            stream_id: 1,
            format: AudioFormat::default(),
            frame_type: FrameType::AudioOpus,
            relay,
            dedupe_entries: 16,
        }
    }

    fn router(relay: bool) -> (FrameRouter, Arc<Mutex<ReceiverStats>>) {
        let stats = Arc::new(Mutex::new(ReceiverStats::default()));
        (FrameRouter::new(options(relay), stats.clone()), stats)
    }

    fn audio(stream_id: u8, seq: u16, ttl: u8) -> Bytes {
        let mut header = NetworkFrameHeader::new(FrameType::AudioOpus, stream_id, seq, seq as u32 * 20, 0);
        header.ttl = ttl;
        build_frame(&header, &[1, 2, 3]).unwrap()
    }

    #[test]
    fn test_audio_for_local_stream_is_delivered() {
        let (mut router, stats) = router(false);
        let datagram = audio(1, 7, 6);
        let (routed, forward) = router.route(&datagram);
        assert_eq!(
            routed,
            Routed::Audio {
                payload: &[1, 2, 3],
                seq: 7,
                timestamp: 140
            }
        );
        assert!(forward.is_none());
        assert_eq!(stats.lock().audio_frames, 1);
    }

    #[test]
    fn test_duplicates_and_garbage_dropped() {
        let (mut router, stats) = router(false);
        let datagram = audio(1, 7, 6);
        router.route(&datagram);
        assert_eq!(router.route(&datagram).0, Routed::Dropped);
        assert_eq!(router.route(&[0u8; 5]).0, Routed::Dropped);

        let stats = stats.lock();
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.datagrams, 3);
    }

    #[test]
    fn test_relay_forwards_with_hop_spent() {
        let (mut router, stats) = router(true);
        let datagram = audio(9, 1, 2);
        let (routed, forward) = router.route(&datagram);
        // Not our stream, still forwarded
        assert_eq!(routed, Routed::Dropped);
        let copy = forward.unwrap();
        assert_eq!(NetFrame::parse(&copy).unwrap().header.ttl, 1);

        let exhausted = audio(9, 2, 0);
        assert!(router.route(&exhausted).1.is_none());

        let stats = stats.lock();
        assert_eq!(stats.relayed, 1);
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.foreign_frames, 1);
    }

    #[test]
    fn test_spent_hop_limit_not_played() {
        let (mut router, stats) = router(true);
        let datagram = audio(1, 3, 0);
        let (routed, forward) = router.route(&datagram);
        assert_eq!(routed, Routed::Dropped);
        assert!(forward.is_none());

        // Same seq with hops left was already marked seen
        assert_eq!(router.route(&audio(1, 3, 4)).0, Routed::Dropped);

        let stats = stats.lock();
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.audio_frames, 0);
    }

    #[test]
    fn test_wrong_codec_frame_rejected() {
        let (mut router, stats) = router(false);
        let header = NetworkFrameHeader::new(FrameType::AudioRaw, 1, 0, 0, 0);
        let datagram = build_frame(&header, &[0, 0]).unwrap();
        assert_eq!(router.route(&datagram).0, Routed::Dropped);
        assert_eq!(stats.lock().rejected, 1);
    }

    #[test]
    fn test_control_frames_do_not_collide_with_audio_sequence() {
        let (mut router, stats) = router(false);
        router.route(&audio(1, 0, 6));

        let hb = ControlMessage::Heartbeat(Heartbeat {
            role: NodeRole::Transmitter,
            hop_count: 0,
            uptime_ms: 1000,
            children: 0,
            rssi: -40,
        });
        let datagram = hb.to_frame(1, 0, 0).unwrap();
        let (routed, _) = router.route(&datagram);
        assert_eq!(routed, Routed::Control(hb));
        assert_eq!(stats.lock().last_peer_hops, Some(0));
    }

    #[test]
    fn test_heartbeats_from_different_nodes_share_seq() {
        let (mut router, stats) = router(true);
        let heartbeat = |role, hop_count| {
            ControlMessage::Heartbeat(Heartbeat {
                role,
                hop_count,
                uptime_ms: 500,
                children: 0,
                rssi: -50,
            })
        };
        let transmitter = heartbeat(NodeRole::Transmitter, 0);
        let receiver = heartbeat(NodeRole::Receiver, 1);

        let datagram = transmitter.to_frame(1, 0, 0).unwrap();
        let (routed, forward) = router.route(&datagram);
        assert_eq!(routed, Routed::Control(transmitter));
        assert!(forward.is_none());
        let datagram = receiver.to_frame(1, 0, 0).unwrap();
        let (routed, _) = router.route(&datagram);
        assert_eq!(routed, Routed::Control(receiver));

        let stats = stats.lock();
        assert_eq!(stats.duplicates, 0);
        assert_eq!(stats.control_frames, 2);
        assert_eq!(stats.relayed, 0);
    }

    #[test]
    fn test_announce_mismatch_counted() {
        let (mut router, stats) = router(false);
        let mut format = AudioFormat::default();
        format.sample_rate = 16_000;
        let announce = ControlMessage::StreamAnnounce(StreamAnnounce::from_format(1, &format));
        router.route(&announce.to_frame(1, 0, 0).unwrap());

        let matching = ControlMessage::StreamAnnounce(StreamAnnounce::from_format(1, &AudioFormat::default()));
        router.route(&matching.to_frame(1, 1, 0).unwrap());

        assert_eq!(stats.lock().format_mismatches, 1);
        assert_eq!(stats.lock().control_frames, 2);
    }
}
