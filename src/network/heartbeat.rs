//! Periodic heartbeat and stream-announce beacons

use bytes::Bytes;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::audio::frame::AudioFormat;
use crate::error::{NetworkError, ProtocolError};
use crate::network::{Transport, UdpTransport};
use crate::protocol::{ControlMessage, Heartbeat, NodeRole, StreamAnnounce};

#[derive(Debug, Clone)]
pub struct BeaconOptions {
    pub role: NodeRole,
    pub stream_id: u8,
    /// Hops from the transmitter; 0 on the transmitter itself
    pub hop_count: u8,
    /// Announced alongside each heartbeat when set
    pub announce: Option<AudioFormat>,
    pub interval: Duration,
}

/// Builds the beacon datagrams for one tick
struct Beacon {
    options: BeaconOptions,
    started: Instant,
    seq: u16,
}

impl Beacon {
    fn new(options: BeaconOptions) -> Self {
        Self {
            options,
            started: Instant::now(),
            seq: 0,
        }
    }

    fn tick(&mut self) -> Result<Vec<Bytes>, ProtocolError> {
        let uptime_ms = self.started.elapsed().as_millis().min(u32::MAX as u128) as u32;
        let mut messages = vec![ControlMessage::Heartbeat(Heartbeat {
            role: self.options.role,
            hop_count: self.options.hop_count,
            uptime_ms,
            children: 0,
            rssi: 0,
        })];
        if let Some(format) = &self.options.announce {
            messages.push(ControlMessage::StreamAnnounce(StreamAnnounce::from_format(
                self.options.stream_id,
                format,
            )));
        }

        let mut frames = Vec::with_capacity(messages.len());
        for message in &messages {
            frames.push(message.to_frame(self.options.stream_id, self.seq, uptime_ms)?);
            self.seq = self.seq.wrapping_add(1);
        }
        Ok(frames)
    }
}

/// Background thread sending beacons until stopped
pub struct HeartbeatSender {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl HeartbeatSender {
    pub fn spawn(mut transport: UdpTransport, options: BeaconOptions) -> Result<Self, NetworkError> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let interval = options.interval;
        let mut beacon = Beacon::new(options);

        let handle = thread::Builder::new()
            .name("meshnet-heartbeat".into())
            .spawn(move || {
                info!(interval_ms = interval.as_millis() as u64, "Heartbeat sender started");
                loop {
                    match beacon.tick() {
                        Ok(frames) => {
                            for frame in &frames {
                                if let Err(e) = transport.send(frame) {
                                    warn!(error = %e, "Heartbeat send failed");
                                }
                            }
                            debug!(frames = frames.len(), "Beacon sent");
                        }
                        Err(e) => warn!(error = %e, "Beacon encoding failed"),
                    }

                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("Heartbeat sender stopped");
            })
            .map_err(|e| NetworkError::SendFailed(format!("spawn: {}", e)))?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        // Dropping the sender wakes the thread immediately
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Heartbeat thread panicked");
            }
        }
    }
}

impl Drop for HeartbeatSender {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FrameType, NetFrame};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn options(announce: Option<AudioFormat>) -> BeaconOptions {
        BeaconOptions {
            role: NodeRole::Transmitter,
            stream_id: 3,
            hop_count: 0,
            announce,
            interval: Duration::from_millis(50),
        }
    }

    #[test]
    fn test_tick_emits_heartbeat_then_announce() {
        let format = AudioFormat::default();
        let mut beacon = Beacon::new(options(Some(format)));
        let frames = beacon.tick().unwrap();
        assert_eq!(frames.len(), 2);

        let hb = NetFrame::parse(&frames[0]).unwrap();
        assert_eq!(hb.header.frame_type, FrameType::Heartbeat);
        assert_eq!(hb.header.seq, 0);
        let announce = NetFrame::parse(&frames[1]).unwrap();
        assert_eq!(announce.header.seq, 1);
        match ControlMessage::from_frame(&announce).unwrap() {
            ControlMessage::StreamAnnounce(sa) => {
                assert_eq!(sa.stream_id, 3);
                assert!(sa.matches(&format));
            }
            other => panic!("unexpected {:?}", other),
        }

        let next = beacon.tick().unwrap();
        assert_eq!(NetFrame::parse(&next[0]).unwrap().header.seq, 2);
    }

    #[test]
    fn test_receiver_beacon_has_no_announce() {
        let mut beacon = Beacon::new(BeaconOptions {
            role: NodeRole::Receiver,
            hop_count: 1,
            ..options(None)
        });
        assert_eq!(beacon.tick().unwrap().len(), 1);
    }

    #[test]
    fn test_sender_delivers_and_stops_promptly() {
        let loopback = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let rx = UdpTransport::bind(loopback, loopback).unwrap();
        let tx = UdpTransport::bind(loopback, rx.local_addr().unwrap()).unwrap();

        let mut sender = HeartbeatSender::spawn(tx, options(None)).unwrap();
        let mut buf = [0u8; 64];
        let (n, _) = rx.recv(&mut buf).unwrap().unwrap();
        assert_eq!(
            NetFrame::parse(&buf[..n]).unwrap().header.frame_type,
            FrameType::Heartbeat
        );

        let started = Instant::now();
        sender.stop();
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
