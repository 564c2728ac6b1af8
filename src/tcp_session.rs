//! Minimal client-side TCP state machine over a [`PacketLink`].
//!
//! `Closed -> SynSent -> Established -> DataExchange -> Closing -> Closed`.
//! There is no retransmission and no congestion control. Every blocking
//! receive is bounded by the session's receive timeout.

use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use crate::core::observability;
use crate::errors::TransportError;
use crate::logging::LogLevel;
use crate::packet::{ConnectionIntent, InboundSegment, Ipv4Header, SegmentKind, TcpFlags, IPPROTO_TCP};
use crate::transport::PacketLink;

const RECV_BUFFER_LEN: usize = 65_535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    SynSent,
    Established,
    DataExchange,
    Closing,
}

impl TcpState {
    pub fn name(self) -> &'static str {
        match self {
            TcpState::Closed => "CLOSED",
            TcpState::SynSent => "SYN_SENT",
            TcpState::Established => "ESTABLISHED",
            TcpState::DataExchange => "DATA_EXCHANGE",
            TcpState::Closing => "CLOSING",
        }
    }
}

/// Peer sequence/ack numbers adopted from the SYN-ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceBaseline {
    pub peer_seq: u32,
    pub peer_ack: u32,
}

/// `(seq, ack)` for the ACK answering `segment`: seq is the peer's ack
/// number, ack is the peer's sequence number advanced by the payload length,
/// modulo 2^32.
pub fn acknowledgement_for(segment: &InboundSegment) -> (u32, u32) {
    (
        segment.tcp.ack_number,
        segment.tcp.seq_number.wrapping_add(segment.payload.len() as u32),
    )
}

/// `a` precedes `b` in 32-bit sequence space.
fn seq_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// Keep only TCP packets from `peer` addressed to `local`. Anything else on
/// the raw socket, including undecodable packets, is somebody else's traffic.
fn filter_segment(packet: &[u8], local: SocketAddrV4, peer: SocketAddrV4) -> Option<InboundSegment> {
    let ip = Ipv4Header::parse(packet).ok()?;
    if ip.protocol != IPPROTO_TCP || ip.source != *peer.ip() {
        return None;
    }
    match InboundSegment::parse_after(ip, packet) {
        Ok(segment) if segment.tcp.source_port == peer.port() && segment.tcp.destination_port == local.port() => {
            Some(segment)
        }
        Ok(_) => None,
        Err(e) => {
            crate::log!(LogLevel::Trace, "Discarding undecodable packet from {}: {}", peer, e);
            None
        }
    }
}

pub struct TcpSession<L: PacketLink> {
    link: L,
    local: SocketAddrV4,
    peer: SocketAddrV4,
    state: TcpState,
    snd_nxt: u32,
    rcv_nxt: u32,
    baseline: Option<SequenceBaseline>,
    receive_timeout: Duration,
    identification: u16,
    recv_buf: Vec<u8>,
    peer_fin: bool,
}

impl<L: PacketLink> TcpSession<L> {
    pub fn new(link: L, local: SocketAddrV4, peer: SocketAddrV4, receive_timeout: Duration) -> Self {
        Self {
            link,
            local,
            peer,
            state: TcpState::Closed,
            snd_nxt: 0,
            rcv_nxt: 0,
            baseline: None,
            receive_timeout,
            identification: rand::random(),
            recv_buf: vec![0u8; RECV_BUFFER_LEN],
            peer_fin: false,
        }
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    pub fn local(&self) -> SocketAddrV4 {
        self.local
    }

    pub fn peer(&self) -> SocketAddrV4 {
        self.peer
    }

    pub fn baseline(&self) -> Option<SequenceBaseline> {
        self.baseline
    }

    /// Sequence number of the next byte this side sends.
    pub fn seq_number(&self) -> u32 {
        self.snd_nxt
    }

    /// Next sequence number expected from the peer.
    pub fn ack_number(&self) -> u32 {
        self.rcv_nxt
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn into_link(self) -> L {
        self.link
    }

    fn require(&self, allowed: &[TcpState], expected: &'static str) -> Result<(), TransportError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(TransportError::InvalidState {
                expected,
                actual: self.state.name(),
            })
        }
    }

    fn transition(&mut self, next: TcpState) {
        crate::log!(LogLevel::Debug, "TCP {} -> {} ({})", self.state.name(), next.name(), self.peer);
        self.state = next;
    }

    fn transmit(&mut self, kind: SegmentKind, seq_number: u32, ack_number: u32, payload: &[u8]) -> Result<(), TransportError> {
        let intent = ConnectionIntent {
            destination: self.peer,
            kind,
            seq_number,
            ack_number,
            payload: payload.to_vec(),
        };
        let packet = intent.build(self.local, self.identification)?;
        self.identification = self.identification.wrapping_add(1);
        self.link.send_packet(&packet, self.peer)?;
        observability::record_segment_sent(payload.len());
        crate::log!(
            LogLevel::Trace,
            "-> {} seq={} ack={} len={}",
            kind.flags(),
            seq_number,
            ack_number,
            payload.len()
        );
        Ok(())
    }

    fn receive_segment(&mut self, deadline: Instant) -> Result<InboundSegment, TransportError> {
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Timeout { waited: self.receive_timeout });
            }
            let n = match self.link.recv_packet(&mut self.recv_buf, deadline - now) {
                Ok(n) => n,
                Err(TransportError::Timeout { .. }) => {
                    return Err(TransportError::Timeout { waited: self.receive_timeout })
                }
                Err(e) => return Err(e),
            };
            if let Some(segment) = filter_segment(&self.recv_buf[..n], self.local, self.peer) {
                observability::record_segment_received(segment.payload.len());
                crate::log!(
                    LogLevel::Trace,
                    "<- {} seq={} ack={} len={}",
                    segment.tcp.flags,
                    segment.tcp.seq_number,
                    segment.tcp.ack_number,
                    segment.payload.len()
                );
                return Ok(segment);
            }
        }
    }

    /// Send a SYN with initial sequence number `isn` and wait for the peer's
    /// acknowledgement, whose numbers become the session baseline.
    pub fn connect(&mut self, isn: u32) -> Result<SequenceBaseline, TransportError> {
        self.require(&[TcpState::Closed], "CLOSED")?;
        self.snd_nxt = isn;
        self.transmit(SegmentKind::Syn, isn, 0, &[])?;
        self.transition(TcpState::SynSent);

        let deadline = Instant::now() + self.receive_timeout;
        loop {
            let segment = self.receive_segment(deadline)?;
            if segment.tcp.flags.contains(TcpFlags::RST) {
                self.transition(TcpState::Closed);
                return Err(TransportError::ConnectionReset);
            }
            if !segment.tcp.flags.contains(TcpFlags::ACK) {
                continue;
            }
            if segment.tcp.ack_number != isn.wrapping_add(1) {
                crate::log!(
                    LogLevel::Debug,
                    "Ignoring ACK {} that does not answer SYN {}",
                    segment.tcp.ack_number,
                    isn
                );
                continue;
            }

            let baseline = SequenceBaseline {
                peer_seq: segment.tcp.seq_number,
                peer_ack: segment.tcp.ack_number,
            };
            self.baseline = Some(baseline);
            self.snd_nxt = baseline.peer_ack;
            self.rcv_nxt = baseline.peer_seq;
            if segment.tcp.flags.contains(TcpFlags::SYN) {
                // The peer's SYN occupies one sequence number.
                self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
                self.transmit(SegmentKind::Ack, self.snd_nxt, self.rcv_nxt, &[])?;
            }
            self.transition(TcpState::Established);
            return Ok(baseline);
        }
    }

    /// Send `payload` in one PSH+ACK segment.
    pub fn send_data(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        self.require(&[TcpState::Established, TcpState::DataExchange], "ESTABLISHED or DATA_EXCHANGE")?;
        self.transmit(SegmentKind::PshAck, self.snd_nxt, self.rcv_nxt, payload)?;
        self.snd_nxt = self.snd_nxt.wrapping_add(payload.len() as u32);
        if self.state == TcpState::Established {
            self.transition(TcpState::DataExchange);
        }
        Ok(())
    }

    /// Wait for the next in-order segment carrying payload, acknowledge it and
    /// hand back its bytes. A FIN riding on that segment is acknowledged with
    /// it and reported as `PeerClosed` by the following call.
    pub fn receive_data(&mut self) -> Result<Vec<u8>, TransportError> {
        self.require(&[TcpState::Established, TcpState::DataExchange], "ESTABLISHED or DATA_EXCHANGE")?;
        if self.peer_fin {
            return Err(TransportError::PeerClosed);
        }
        let deadline = Instant::now() + self.receive_timeout;
        loop {
            let segment = self.receive_segment(deadline)?;
            if segment.tcp.flags.contains(TcpFlags::RST) {
                self.transition(TcpState::Closed);
                return Err(TransportError::ConnectionReset);
            }
            if segment.payload.is_empty() {
                if segment.tcp.flags.contains(TcpFlags::FIN) {
                    return Err(TransportError::PeerClosed);
                }
                continue;
            }
            if segment.tcp.seq_number != self.rcv_nxt {
                if seq_before(segment.tcp.seq_number, self.rcv_nxt) {
                    crate::log!(LogLevel::Debug, "Duplicate segment seq={}, re-acknowledging", segment.tcp.seq_number);
                    self.transmit(SegmentKind::Ack, self.snd_nxt, self.rcv_nxt, &[])?;
                } else {
                    crate::log!(LogLevel::Debug, "Dropping out-of-order segment seq={}", segment.tcp.seq_number);
                }
                continue;
            }

            let (seq, mut ack) = acknowledgement_for(&segment);
            if segment.tcp.flags.contains(TcpFlags::FIN) {
                // The FIN occupies one sequence number after the payload.
                ack = ack.wrapping_add(1);
                self.peer_fin = true;
            }
            self.snd_nxt = seq;
            self.rcv_nxt = ack;
            self.transmit(SegmentKind::Ack, seq, ack, &[])?;
            return Ok(segment.payload);
        }
    }

    /// Send FIN+ACK and, unless the peer already closed, wait for its FIN and
    /// answer it with FIN+ACK.
    pub fn close(&mut self) -> Result<(), TransportError> {
        self.require(&[TcpState::Established, TcpState::DataExchange], "ESTABLISHED or DATA_EXCHANGE")?;
        self.transmit(SegmentKind::FinAck, self.snd_nxt, self.rcv_nxt, &[])?;
        if self.peer_fin {
            self.transition(TcpState::Closed);
            return Ok(());
        }
        self.transition(TcpState::Closing);

        let deadline = Instant::now() + self.receive_timeout;
        loop {
            let segment = self.receive_segment(deadline)?;
            if segment.tcp.flags.contains(TcpFlags::RST) {
                break;
            }
            if segment.tcp.flags.contains(TcpFlags::FIN) {
                let seq = segment.tcp.ack_number;
                let ack = segment
                    .tcp
                    .seq_number
                    .wrapping_add(segment.payload.len() as u32)
                    .wrapping_add(1);
                self.transmit(SegmentKind::FinAck, seq, ack, &[])?;
                self.snd_nxt = seq;
                self.rcv_nxt = ack;
                break;
            }
            if !segment.payload.is_empty() {
                let (seq, ack) = acknowledgement_for(&segment);
                self.transmit(SegmentKind::Ack, seq, ack, &[])?;
            }
        }
        self.transition(TcpState::Closed);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::packet::IPV4_HEADER_LEN;
    use std::collections::VecDeque;
    use std::net::Ipv4Addr;

    pub(crate) fn client_addr() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 50_123)
    }

    pub(crate) fn server_addr() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 443)
    }

    pub(crate) fn from_server(kind: SegmentKind, seq: u32, ack: u32, payload: &[u8]) -> Vec<u8> {
        ConnectionIntent {
            destination: client_addr(),
            kind,
            seq_number: seq,
            ack_number: ack,
            payload: payload.to_vec(),
        }
        .build(server_addr(), 9)
        .unwrap()
    }

    /// Peer that answers each client packet through `respond`.
    pub(crate) struct ScriptedPeer<F: FnMut(&InboundSegment) -> Vec<Vec<u8>>> {
        pub sent: Vec<InboundSegment>,
        pub inbox: VecDeque<Vec<u8>>,
        respond: F,
    }

    impl<F: FnMut(&InboundSegment) -> Vec<Vec<u8>>> ScriptedPeer<F> {
        pub(crate) fn new(respond: F) -> Self {
            Self {
                sent: Vec::new(),
                inbox: VecDeque::new(),
                respond,
            }
        }
    }

    impl<F: FnMut(&InboundSegment) -> Vec<Vec<u8>>> PacketLink for ScriptedPeer<F> {
        fn send_packet(&mut self, packet: &[u8], _destination: SocketAddrV4) -> Result<(), TransportError> {
            let segment = InboundSegment::parse(packet).unwrap();
            let replies = (self.respond)(&segment);
            self.inbox.extend(replies);
            self.sent.push(segment);
            Ok(())
        }

        fn recv_packet(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
            match self.inbox.pop_front() {
                Some(packet) => {
                    buf[..packet.len()].copy_from_slice(&packet);
                    Ok(packet.len())
                }
                None => Err(TransportError::Timeout { waited: timeout }),
            }
        }
    }

    /// Scripted packet with arbitrary flags. The TCP checksum is left stale;
    /// inbound checksums are not verified.
    pub(crate) fn with_flags(mut packet: Vec<u8>, flags: TcpFlags) -> Vec<u8> {
        packet[IPV4_HEADER_LEN + 13] = flags.bits();
        packet
    }

    pub(crate) fn syn_ack(seq: u32, ack: u32) -> Vec<u8> {
        with_flags(from_server(SegmentKind::Ack, seq, ack, &[]), TcpFlags::SYN.union(TcpFlags::ACK))
    }

    fn syn_ack_peer() -> ScriptedPeer<impl FnMut(&InboundSegment) -> Vec<Vec<u8>>> {
        ScriptedPeer::new(|segment: &InboundSegment| {
            if segment.tcp.flags == TcpFlags::SYN {
                vec![syn_ack(1000, segment.tcp.seq_number.wrapping_add(1))]
            } else {
                Vec::new()
            }
        })
    }

    #[test]
    fn test_syn_to_simulated_peer_reaches_established() {
        // Arrange
        let mut tcp = TcpSession::new(syn_ack_peer(), client_addr(), server_addr(), Duration::from_millis(200));

        // Act
        let baseline = tcp.connect(0).unwrap();

        // Assert
        assert_eq!(tcp.state(), TcpState::Established);
        assert_eq!(baseline, SequenceBaseline { peer_seq: 1000, peer_ack: 1 });
        assert_eq!(tcp.seq_number(), 1);
        assert_eq!(tcp.ack_number(), 1001);
        let sent = &tcp.link().sent;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].tcp.flags, TcpFlags::ACK);
        assert_eq!((sent[1].tcp.seq_number, sent[1].tcp.ack_number), (1, 1001));
    }

    #[test]
    fn test_acknowledgement_wraps_modulo_2_pow_32() {
        let packet = from_server(SegmentKind::PshAck, u32::MAX - 2, 555, &[0u8; 10]);
        let segment = InboundSegment::parse(&packet).unwrap();

        assert_eq!(acknowledgement_for(&segment), (555, 7));
    }

    #[test]
    fn test_received_payload_is_acknowledged() {
        // Arrange
        let mut tcp = TcpSession::new(syn_ack_peer(), client_addr(), server_addr(), Duration::from_millis(200));
        tcp.connect(0).unwrap();
        tcp.send_data(b"hello").unwrap();
        tcp.link.inbox.push_back(from_server(SegmentKind::PshAck, 1001, 6, b"world!"));

        // Act
        let payload = tcp.receive_data().unwrap();

        // Assert
        assert_eq!(payload, b"world!");
        assert_eq!(tcp.state(), TcpState::DataExchange);
        let ack = tcp.link().sent.last().unwrap();
        assert_eq!(ack.tcp.flags, TcpFlags::ACK);
        assert_eq!((ack.tcp.seq_number, ack.tcp.ack_number), (6, 1007));
    }

    #[test]
    fn test_fin_on_last_data_segment_is_acknowledged_then_reported() {
        // Arrange
        let mut tcp = TcpSession::new(syn_ack_peer(), client_addr(), server_addr(), Duration::from_millis(200));
        tcp.connect(0).unwrap();
        tcp.link.inbox.push_back(with_flags(
            from_server(SegmentKind::PshAck, 1001, 1, b"last words"),
            TcpFlags::FIN.union(TcpFlags::PSH).union(TcpFlags::ACK),
        ));

        // Act
        let payload = tcp.receive_data().unwrap();
        let next = tcp.receive_data();

        // Assert
        assert_eq!(payload, b"last words");
        let ack = tcp.link().sent.last().unwrap();
        assert_eq!(ack.tcp.flags, TcpFlags::ACK);
        assert_eq!((ack.tcp.seq_number, ack.tcp.ack_number), (1, 1012));
        assert!(matches!(next, Err(TransportError::PeerClosed)));
        assert_eq!(tcp.link().sent.len(), 3);
    }

    #[test]
    fn test_close_after_peer_fin_does_not_wait() {
        let mut tcp = TcpSession::new(syn_ack_peer(), client_addr(), server_addr(), Duration::from_millis(50));
        tcp.connect(0).unwrap();
        tcp.link.inbox.push_back(with_flags(
            from_server(SegmentKind::PshAck, 1001, 1, b"x"),
            TcpFlags::FIN.union(TcpFlags::ACK),
        ));
        tcp.receive_data().unwrap();

        tcp.close().unwrap();

        assert_eq!(tcp.state(), TcpState::Closed);
        let fin = tcp.link().sent.last().unwrap();
        assert_eq!(fin.tcp.flags, SegmentKind::FinAck.flags());
        assert_eq!((fin.tcp.seq_number, fin.tcp.ack_number), (1, 1003));
    }

    #[test]
    fn test_foreign_packets_are_filtered() {
        let mut tcp = TcpSession::new(syn_ack_peer(), client_addr(), server_addr(), Duration::from_millis(200));
        tcp.connect(0).unwrap();

        let mut udp = from_server(SegmentKind::PshAck, 1001, 1, b"udp");
        udp[9] = 17;
        let stranger = ConnectionIntent {
            destination: client_addr(),
            kind: SegmentKind::PshAck,
            seq_number: 1001,
            ack_number: 1,
            payload: b"stranger".to_vec(),
        }
        .build(SocketAddrV4::new(Ipv4Addr::new(10, 9, 9, 9), 443), 1)
        .unwrap();
        let wrong_port = ConnectionIntent {
            destination: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 40_000),
            kind: SegmentKind::PshAck,
            seq_number: 1001,
            ack_number: 1,
            payload: b"other flow".to_vec(),
        }
        .build(server_addr(), 1)
        .unwrap();
        tcp.link.inbox.extend([udp, stranger, wrong_port, from_server(SegmentKind::PshAck, 1001, 1, b"mine")]);

        assert_eq!(tcp.receive_data().unwrap(), b"mine");
    }

    #[test]
    fn test_duplicate_segment_is_not_accumulated_twice() {
        let mut tcp = TcpSession::new(syn_ack_peer(), client_addr(), server_addr(), Duration::from_millis(200));
        tcp.connect(0).unwrap();
        tcp.link.inbox.extend([
            from_server(SegmentKind::PshAck, 1001, 1, b"abc"),
            from_server(SegmentKind::PshAck, 1001, 1, b"abc"),
            from_server(SegmentKind::PshAck, 1004, 1, b"def"),
        ]);

        assert_eq!(tcp.receive_data().unwrap(), b"abc");
        assert_eq!(tcp.receive_data().unwrap(), b"def");
        assert_eq!(tcp.ack_number(), 1007);
    }

    #[test]
    fn test_silent_peer_times_out() {
        let peer = ScriptedPeer::new(|_: &InboundSegment| Vec::new());
        let mut tcp = TcpSession::new(peer, client_addr(), server_addr(), Duration::from_millis(50));

        let err = tcp.connect(7).unwrap_err();

        assert!(matches!(err, TransportError::Timeout { waited } if waited == Duration::from_millis(50)));
        assert_eq!(tcp.state(), TcpState::SynSent);
    }

    #[test]
    fn test_reset_during_connect() {
        let peer = ScriptedPeer::new(|segment: &InboundSegment| {
            vec![with_flags(
                from_server(SegmentKind::Ack, 0, segment.tcp.seq_number.wrapping_add(1), &[]),
                TcpFlags::RST.union(TcpFlags::ACK),
            )]
        });
        let mut tcp = TcpSession::new(peer, client_addr(), server_addr(), Duration::from_millis(50));

        assert!(matches!(tcp.connect(0), Err(TransportError::ConnectionReset)));
        assert_eq!(tcp.state(), TcpState::Closed);
    }

    #[test]
    fn test_close_answers_peer_fin() {
        // Arrange
        let mut tcp = TcpSession::new(syn_ack_peer(), client_addr(), server_addr(), Duration::from_millis(200));
        tcp.connect(0).unwrap();
        tcp.send_data(b"bye").unwrap();
        tcp.link.inbox.push_back(from_server(SegmentKind::FinAck, 1001, 5, &[]));

        // Act
        tcp.close().unwrap();

        // Assert
        assert_eq!(tcp.state(), TcpState::Closed);
        let sent = &tcp.link().sent;
        let our_fin = &sent[sent.len() - 2];
        assert_eq!(our_fin.tcp.flags, SegmentKind::FinAck.flags());
        assert_eq!((our_fin.tcp.seq_number, our_fin.tcp.ack_number), (4, 1001));
        let reply = sent.last().unwrap();
        assert_eq!(reply.tcp.flags, SegmentKind::FinAck.flags());
        assert_eq!((reply.tcp.seq_number, reply.tcp.ack_number), (5, 1002));
    }

    #[test]
    fn test_send_before_connect_is_rejected() {
        let peer = ScriptedPeer::new(|_: &InboundSegment| Vec::new());
        let mut tcp = TcpSession::new(peer, client_addr(), server_addr(), Duration::from_millis(50));

        assert!(matches!(
            tcp.send_data(b"x"),
            Err(TransportError::InvalidState { actual: "CLOSED", .. })
        ));
    }
}
