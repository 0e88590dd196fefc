//! UDP socket setup and datagram I/O

use socket2::{Domain, Protocol, Socket, Type};
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::NetworkConfig;
use crate::constants::MAX_DATAGRAM_SIZE;
use crate::error::NetworkError;
use crate::network::Transport;

/// Receive timeout so the receive thread notices shutdown
const RECV_TIMEOUT: Duration = Duration::from_millis(200);

/// Broadcast-capable UDP socket bound to the mesh port
pub struct UdpTransport {
    socket: UdpSocket,
    destination: SocketAddr,
    datagrams_sent: u64,
}

impl UdpTransport {
    pub fn bind(bind_addr: SocketAddr, destination: SocketAddr) -> Result<Self, NetworkError> {
        let domain = Domain::for_address(bind_addr);
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| NetworkError::BindFailed(format!("socket: {}", e)))?;

        socket
            .set_reuse_address(true)
            .map_err(|e| NetworkError::BindFailed(format!("reuse address: {}", e)))?;
        if bind_addr.is_ipv4() {
            socket
                .set_broadcast(true)
                .map_err(|e| NetworkError::BindFailed(format!("broadcast: {}", e)))?;
        }
        socket
            .set_read_timeout(Some(RECV_TIMEOUT))
            .map_err(|e| NetworkError::BindFailed(format!("read timeout: {}", e)))?;
        socket
            .bind(&bind_addr.into())
            .map_err(|e| NetworkError::BindFailed(format!("{}: {}", bind_addr, e)))?;

        info!(%bind_addr, %destination, "UDP transport ready");
        Ok(Self {
            socket: socket.into(),
            destination,
            datagrams_sent: 0,
        })
    }

    pub fn from_config(config: &NetworkConfig) -> Result<Self, NetworkError> {
        let parse = |addr: &str| {
            addr.parse::<IpAddr>()
                .map_err(|e| NetworkError::BindFailed(format!("invalid address {}: {}", addr, e)))
        };
        let bind_addr = SocketAddr::new(parse(&config.bind_addr)?, config.port);
        let destination = SocketAddr::new(parse(&config.destination)?, config.port);
        Self::bind(bind_addr, destination)
    }

    /// Second handle on the same socket, for a separate receive thread
    pub fn try_clone(&self) -> Result<Self, NetworkError> {
        let socket = self
            .socket
            .try_clone()
            .map_err(|e| NetworkError::BindFailed(format!("clone: {}", e)))?;
        Ok(Self {
            socket,
            destination: self.destination,
            datagrams_sent: 0,
        })
    }

    /// Blocking receive bounded by the socket timeout. `Ok(None)` on timeout.
    pub fn recv(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, NetworkError> {
        match self.socket.recv_from(buf) {
            Ok(received) => Ok(Some(received)),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(NetworkError::ReceiveFailed(e.to_string())),
        }
    }

    pub fn send_to(&self, datagram: &[u8], addr: SocketAddr) -> Result<(), NetworkError> {
        if datagram.len() > MAX_DATAGRAM_SIZE {
            return Err(NetworkError::PacketTooLarge(datagram.len()));
        }
        let sent = self
            .socket
            .send_to(datagram, addr)
            .map_err(|e| NetworkError::SendFailed(e.to_string()))?;
        if sent != datagram.len() {
            debug!(sent, len = datagram.len(), "Partial datagram send");
        }
        Ok(())
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        self.socket.local_addr().map_err(|_| NetworkError::NotConnected)
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    pub fn datagrams_sent(&self) -> u64 {
        self.datagrams_sent
    }
}

impl Transport for UdpTransport {
    fn send(&mut self, datagram: &[u8]) -> Result<(), NetworkError> {
        self.send_to(datagram, self.destination)?;
        self.datagrams_sent += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn loopback() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }

    #[test]
    fn test_loopback_send_and_receive() {
        let rx = UdpTransport::bind(loopback(), loopback()).unwrap();
        let mut tx = UdpTransport::bind(loopback(), rx.local_addr().unwrap()).unwrap();

        tx.send(b"meshnet").unwrap();
        assert_eq!(tx.datagrams_sent(), 1);

        let mut buf = [0u8; 64];
        let (n, from) = rx.recv(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..n], b"meshnet");
        assert_eq!(from, tx.local_addr().unwrap());
    }

    #[test]
    fn test_recv_times_out_quietly() {
        let rx = UdpTransport::bind(loopback(), loopback()).unwrap();
        let mut buf = [0u8; 16];
        assert!(rx.recv(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversize_datagram_rejected() {
        let mut tx = UdpTransport::bind(loopback(), loopback()).unwrap();
        let big = vec![0u8; MAX_DATAGRAM_SIZE + 1];
        assert!(matches!(tx.send(&big), Err(NetworkError::PacketTooLarge(_))));
    }

    #[test]
    fn test_invalid_config_address() {
        let config = NetworkConfig {
            destination: "not-an-ip".into(),
            ..NetworkConfig::default()
        };
        assert!(matches!(
            UdpTransport::from_config(&config),
            Err(NetworkError::BindFailed(_))
        ));
    }
}
