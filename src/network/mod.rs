//! Network subsystem for UDP audio transport

pub mod heartbeat;
pub mod receiver;
pub mod udp;

use crate::error::NetworkError;

pub use heartbeat::{BeaconOptions, HeartbeatSender};
pub use receiver::{AudioReceiver, ReceiverOptions, ReceiverStats};
pub use udp::UdpTransport;

/// Datagram sink used by the transmit pipeline. Delivery is fire-and-forget;
/// implementations never retransmit.
pub trait Transport: Send {
    fn send(&mut self, datagram: &[u8]) -> Result<(), NetworkError>;
}
