//! IPv4 and TCP header construction and parsing (RFC 791, RFC 793).
//!
//! Outbound packets always carry a 20-byte IPv4 header without options and a
//! 20-byte TCP header without options. Inbound packets may carry options in
//! either header; the payload length is derived from the IPv4 total length
//! minus both header lengths.

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::codec::{read_at, CodecError, Reader, Width, Writer};

pub const IPPROTO_TCP: u8 = 6;
pub const IPV4_HEADER_LEN: usize = 20;
pub const TCP_HEADER_LEN: usize = 20;

const IPV4_VERSION_IHL: u8 = 0x45;
const IPV4_DONT_FRAGMENT: u16 = 0x4000;
const DEFAULT_TTL: u8 = 64;
const DEFAULT_WINDOW: u16 = 64240;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags(u8);

impl TcpFlags {
    pub const FIN: TcpFlags = TcpFlags(0x01);
    pub const SYN: TcpFlags = TcpFlags(0x02);
    pub const RST: TcpFlags = TcpFlags(0x04);
    pub const PSH: TcpFlags = TcpFlags(0x08);
    pub const ACK: TcpFlags = TcpFlags(0x10);

    pub const fn from_bits(bits: u8) -> Self {
        TcpFlags(bits & 0x3f)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn union(self, other: TcpFlags) -> Self {
        TcpFlags(self.0 | other.0)
    }

    pub const fn contains(self, other: TcpFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = [
            (TcpFlags::SYN, "SYN"),
            (TcpFlags::FIN, "FIN"),
            (TcpFlags::RST, "RST"),
            (TcpFlags::PSH, "PSH"),
            (TcpFlags::ACK, "ACK"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            f.write_str("NONE")
        } else {
            f.write_str(&set.join("|"))
        }
    }
}

/// The TCP actions this client ever emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Syn,
    Ack,
    PshAck,
    FinAck,
}

impl SegmentKind {
    pub fn flags(self) -> TcpFlags {
        match self {
            SegmentKind::Syn => TcpFlags::SYN,
            SegmentKind::Ack => TcpFlags::ACK,
            SegmentKind::PshAck => TcpFlags::PSH.union(TcpFlags::ACK),
            SegmentKind::FinAck => TcpFlags::FIN.union(TcpFlags::ACK),
        }
    }
}

/// A requested TCP action, consumed immediately by [`ConnectionIntent::build`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionIntent {
    pub destination: SocketAddrV4,
    pub kind: SegmentKind,
    pub seq_number: u32,
    pub ack_number: u32,
    pub payload: Vec<u8>,
}

impl ConnectionIntent {
    /// Serialize into a complete IPv4 packet with both checksums filled in.
    pub fn build(&self, source: SocketAddrV4, identification: u16) -> Result<Vec<u8>, CodecError> {
        let tcp_len = TCP_HEADER_LEN + self.payload.len();
        let total_len = IPV4_HEADER_LEN + tcp_len;
        if total_len > u16::MAX as usize {
            return Err(CodecError::FieldTooLong {
                field: "ip_total_length",
                length: total_len,
                max: u16::MAX as usize,
            });
        }

        let mut tcp = Writer::with_capacity(tcp_len);
        tcp.put_u16(source.port());
        tcp.put_u16(self.destination.port());
        tcp.put_u32(self.seq_number);
        tcp.put_u32(self.ack_number);
        tcp.put_u8(((TCP_HEADER_LEN / 4) as u8) << 4);
        tcp.put_u8(self.kind.flags().bits());
        tcp.put_u16(DEFAULT_WINDOW);
        tcp.put_u16(0); // checksum
        tcp.put_u16(0); // urgent pointer
        tcp.field("tcp_payload", Width::Fixed(self.payload.len()), &self.payload)?;
        let mut tcp = tcp.into_bytes();
        let checksum = tcp_checksum(*source.ip(), *self.destination.ip(), &tcp);
        tcp[16..18].copy_from_slice(&checksum.to_be_bytes());

        let mut ip = Writer::with_capacity(total_len);
        ip.put_u8(IPV4_VERSION_IHL);
        ip.put_u8(0);
        ip.put_u16(total_len as u16);
        ip.put_u16(identification);
        ip.put_u16(IPV4_DONT_FRAGMENT);
        ip.put_u8(DEFAULT_TTL);
        ip.put_u8(IPPROTO_TCP);
        ip.put_u16(0); // checksum
        ip.field("source_address", Width::Fixed(4), &source.ip().octets())?;
        ip.field("destination_address", Width::Fixed(4), &self.destination.ip().octets())?;
        let mut packet = ip.into_bytes();
        let checksum = internet_checksum(&packet);
        packet[10..12].copy_from_slice(&checksum.to_be_bytes());

        packet.extend_from_slice(&tcp);
        Ok(packet)
    }
}

fn sum_words(mut sum: u64, data: &[u8]) -> u64 {
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u16::from_be_bytes([pair[0], pair[1]]) as u64;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u64) << 8;
    }
    sum
}

fn fold(mut sum: u64) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// 16-bit one's-complement checksum. Over a header that already carries its
/// checksum the result is zero.
pub fn internet_checksum(data: &[u8]) -> u16 {
    fold(sum_words(0, data))
}

/// TCP checksum over the pseudo-header (source, destination, protocol,
/// TCP length) followed by the TCP header and payload.
pub fn tcp_checksum(source: Ipv4Addr, destination: Ipv4Addr, segment: &[u8]) -> u16 {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&source.octets());
    pseudo[4..8].copy_from_slice(&destination.octets());
    pseudo[9] = IPPROTO_TCP;
    pseudo[10..12].copy_from_slice(&(segment.len() as u16).to_be_bytes());
    fold(sum_words(sum_words(0, &pseudo), segment))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    pub header_len: usize,
    pub total_length: u16,
    pub identification: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
}

impl Ipv4Header {
    pub fn parse(packet: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(packet);
        let version_ihl = r.u8("ip_version_ihl")?;
        let header_len = ((version_ihl & 0x0f) as usize) * 4;
        if version_ihl >> 4 != 4 || header_len < IPV4_HEADER_LEN {
            return Err(CodecError::MalformedInput {
                field: "ip_version_ihl",
                needed: IPV4_HEADER_LEN,
                available: header_len,
            });
        }
        r.u8("ip_tos")?;
        let total_length = r.u16("ip_total_length")?;
        let identification = r.u16("ip_identification")?;
        r.u16("ip_flags_fragment")?;
        let ttl = r.u8("ip_ttl")?;
        let protocol = r.u8("ip_protocol")?;
        r.u16("ip_checksum")?;
        let source = Ipv4Addr::from(r.array::<4>("ip_source")?);
        let destination = Ipv4Addr::from(r.array::<4>("ip_destination")?);

        let total = total_length as usize;
        if total < header_len || total > packet.len() {
            return Err(CodecError::MalformedInput {
                field: "ip_total_length",
                needed: total.max(header_len),
                available: packet.len(),
            });
        }

        Ok(Self {
            header_len,
            total_length,
            identification,
            ttl,
            protocol,
            source,
            destination,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpHeader {
    pub source_port: u16,
    pub destination_port: u16,
    pub seq_number: u32,
    pub ack_number: u32,
    pub header_len: usize,
    pub flags: TcpFlags,
    pub window: u16,
}

impl TcpHeader {
    pub fn parse(segment: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(segment);
        let source_port = r.u16("tcp_source_port")?;
        let destination_port = r.u16("tcp_destination_port")?;
        let seq_number = r.u32("tcp_seq_number")?;
        let ack_number = r.u32("tcp_ack_number")?;
        let header_len = ((r.u8("tcp_data_offset")? >> 4) as usize) * 4;
        let flags = TcpFlags::from_bits(r.u8("tcp_flags")?);
        let window = r.u16("tcp_window")?;
        if header_len < TCP_HEADER_LEN || header_len > segment.len() {
            return Err(CodecError::MalformedInput {
                field: "tcp_data_offset",
                needed: header_len.max(TCP_HEADER_LEN),
                available: segment.len(),
            });
        }
        Ok(Self {
            source_port,
            destination_port,
            seq_number,
            ack_number,
            header_len,
            flags,
            window,
        })
    }
}

/// A parsed inbound TCP segment, owned so it can outlive the receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundSegment {
    pub ip: Ipv4Header,
    pub tcp: TcpHeader,
    pub payload: Vec<u8>,
}

impl InboundSegment {
    pub fn parse(packet: &[u8]) -> Result<Self, CodecError> {
        let ip = Ipv4Header::parse(packet)?;
        Self::parse_after(ip, packet)
    }

    /// Parse the TCP part of `packet` whose IPv4 header is already decoded.
    pub(crate) fn parse_after(ip: Ipv4Header, packet: &[u8]) -> Result<Self, CodecError> {
        let datagram = read_at(packet, 0, ip.total_length as usize)?;
        let segment = read_at(datagram, ip.header_len, datagram.len().saturating_sub(ip.header_len))?;
        let tcp = TcpHeader::parse(segment)?;
        let payload_start = ip.header_len + tcp.header_len;
        if payload_start > datagram.len() {
            return Err(CodecError::MalformedInput {
                field: "tcp_payload",
                needed: payload_start,
                available: datagram.len(),
            });
        }
        let payload = datagram[payload_start..].to_vec();
        Ok(Self { ip, tcp, payload })
    }

    pub fn source(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip.source, self.tcp.source_port)
    }

    pub fn destination(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip.destination, self.tcp.destination_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent(kind: SegmentKind, payload: &[u8]) -> ConnectionIntent {
        ConnectionIntent {
            destination: SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 10), 443),
            kind,
            seq_number: 0xfffffff0,
            ack_number: 77,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn test_ipv4_checksum_matches_reference_header() {
        let header = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8, 0x00, 0x01,
            0xc0, 0xa8, 0x00, 0xc7,
        ];
        assert_eq!(internet_checksum(&header), 0xb861);
    }

    #[test]
    fn test_built_packet_checksums_verify_to_zero() {
        // Arrange
        let source = SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 50000);
        let psh = intent(SegmentKind::PshAck, b"odd-length payload!");

        // Act
        let packet = psh.build(source, 0x1234).unwrap();

        // Assert
        assert_eq!(packet.len(), IPV4_HEADER_LEN + TCP_HEADER_LEN + 19);
        assert_eq!(internet_checksum(&packet[..IPV4_HEADER_LEN]), 0);
        assert_eq!(
            tcp_checksum(*source.ip(), Ipv4Addr::new(192, 0, 2, 10), &packet[IPV4_HEADER_LEN..]),
            0
        );
    }

    #[test]
    fn test_build_then_parse_preserves_fields() {
        let source = SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 50000);
        let packet = intent(SegmentKind::FinAck, &[]).build(source, 1).unwrap();

        let segment = InboundSegment::parse(&packet).unwrap();

        assert_eq!(segment.ip.protocol, IPPROTO_TCP);
        assert_eq!(segment.source(), source);
        assert_eq!(segment.destination(), SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 10), 443));
        assert_eq!(segment.tcp.seq_number, 0xfffffff0);
        assert_eq!(segment.tcp.ack_number, 77);
        assert!(segment.tcp.flags.contains(TcpFlags::FIN));
        assert!(segment.tcp.flags.contains(TcpFlags::ACK));
        assert!(!segment.tcp.flags.contains(TcpFlags::SYN));
        assert!(segment.payload.is_empty());
    }

    #[test]
    fn test_payload_length_comes_from_ip_total_length() {
        // Ethernet padding after the datagram must not leak into the payload.
        let source = SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 50000);
        let mut packet = intent(SegmentKind::PshAck, b"abc").build(source, 1).unwrap();
        packet.extend_from_slice(&[0u8; 6]);

        let segment = InboundSegment::parse(&packet).unwrap();

        assert_eq!(segment.payload, b"abc");
    }

    #[test]
    fn test_truncated_packet_is_malformed() {
        let source = SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 50000);
        let packet = intent(SegmentKind::PshAck, b"hello").build(source, 1).unwrap();

        let err = InboundSegment::parse(&packet[..30]).unwrap_err();

        assert!(matches!(err, CodecError::MalformedInput { field: "ip_total_length", .. }));
    }

    #[test]
    fn test_header_from_longer_packet_is_rejected() {
        // Arrange
        let source = SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 50000);
        let long = intent(SegmentKind::PshAck, b"a longer payload").build(source, 1).unwrap();
        let short = intent(SegmentKind::Ack, &[]).build(source, 2).unwrap();
        let ip = Ipv4Header::parse(&long).unwrap();

        // Act
        let result = InboundSegment::parse_after(ip, &short);

        // Assert
        assert!(matches!(
            result,
            Err(CodecError::MalformedInput { needed, available, .. }) if needed == long.len() && available == short.len()
        ));
    }

    #[test]
    fn test_flags_display() {
        assert_eq!(SegmentKind::PshAck.flags().to_string(), "PSH|ACK");
        assert_eq!(TcpFlags::SYN.union(TcpFlags::ACK).to_string(), "SYN|ACK");
    }
}
