use std::io::{ErrorKind, Read};
use std::net::{Ipv4Addr, SocketAddrV4, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::errors::TransportError;
use crate::logging::LogLevel;

/// Datagram-level access to the network: whole IPv4 packets out, whole IPv4
/// packets in. The TCP state machine only talks to this seam, which is what
/// lets tests stand in a simulated peer for the raw socket.
pub trait PacketLink {
    fn send_packet(&mut self, packet: &[u8], destination: SocketAddrV4) -> Result<(), TransportError>;

    /// Block for at most `timeout` waiting for one inbound packet. Expiry is
    /// `TransportError::Timeout`.
    fn recv_packet(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;
}

/// Raw IPv4 socket with `IP_HDRINCL`, exclusively owned by one session.
/// Closed when dropped.
pub struct RawSocketLink {
    socket: Socket,
}

impl RawSocketLink {
    pub fn open(bind_address: Ipv4Addr) -> Result<Self, TransportError> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::TCP))
            .map_err(TransportError::SocketCreate)?;
        socket.set_header_included(true).map_err(TransportError::SocketCreate)?;
        socket
            .bind(&SockAddr::from(SocketAddrV4::new(bind_address, 0)))
            .map_err(TransportError::Bind)?;
        crate::log!(LogLevel::Debug, "Raw socket bound to {}", bind_address);
        Ok(Self { socket })
    }
}

impl PacketLink for RawSocketLink {
    fn send_packet(&mut self, packet: &[u8], destination: SocketAddrV4) -> Result<(), TransportError> {
        // The kernel ignores the port for raw sockets; the address selects the route.
        let addr = SockAddr::from(SocketAddrV4::new(*destination.ip(), 0));
        self.socket.send_to(packet, &addr).map_err(TransportError::Send)?;
        Ok(())
    }

    fn recv_packet(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        // A zero read timeout means "block forever" to the kernel.
        let timeout = timeout.max(Duration::from_millis(1));
        self.socket
            .set_read_timeout(Some(timeout))
            .map_err(TransportError::Receive)?;
        match self.socket.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Err(TransportError::Timeout { waited: timeout })
            }
            Err(e) => Err(TransportError::Receive(e)),
        }
    }
}

/// Resolve `host` to its first IPv4 address.
pub fn resolve_ipv4(host: &str, port: u16) -> Result<SocketAddrV4, TransportError> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|_| TransportError::Resolve { host: host.to_string() })?;
    for addr in addrs {
        if let std::net::SocketAddr::V4(v4) = addr {
            return Ok(v4);
        }
    }
    Err(TransportError::Resolve { host: host.to_string() })
}

/// Source address the routing table would pick toward `destination`.
/// Connecting a UDP socket sends nothing; it only binds a route.
pub fn discover_local_address(destination: SocketAddrV4) -> Result<Ipv4Addr, TransportError> {
    let probe = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).map_err(TransportError::Bind)?;
    probe.connect(destination).map_err(TransportError::Bind)?;
    match probe.local_addr().map_err(TransportError::Bind)? {
        std::net::SocketAddr::V4(v4) => Ok(*v4.ip()),
        std::net::SocketAddr::V6(_) => Err(TransportError::Resolve {
            host: destination.ip().to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_ipv4_literal() {
        let addr = resolve_ipv4("192.0.2.7", 443).unwrap();
        assert_eq!(addr, SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 7), 443));
    }

    #[test]
    fn test_local_address_toward_loopback() {
        let local = discover_local_address(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9)).unwrap();
        assert!(local.is_loopback());
    }
}
