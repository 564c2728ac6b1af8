use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use raw_tls_handshake::certificate::TrustAnchors;
use raw_tls_handshake::codec::{CodecError, LengthPrefix, Reader, Width, Writer};
use raw_tls_handshake::config::HandshakeConfig;
use raw_tls_handshake::errors::{CertificateError, ErrorKind, HandshakePhase, ProtocolViolation, TransportError};
use raw_tls_handshake::handshake::{finished, ClientHello};
use raw_tls_handshake::key_schedule::{verify_data, CipherParams, FinishedLabel, KeyMaterial, PremasterSecret};
use raw_tls_handshake::packet::{ConnectionIntent, InboundSegment, SegmentKind, TcpFlags, IPV4_HEADER_LEN};
use raw_tls_handshake::record::{frame_record, RecordReassembler};
use raw_tls_handshake::record_protection::GcmRecordCipher;
use raw_tls_handshake::session::HandshakeSession;
use raw_tls_handshake::transport::PacketLink;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey};
use rustls::{ContentType, HandshakeType};
use x509_parser::pem::Pem;

const ROOT_PEM: &str = include_str!("fixtures/root.pem");
const INTERMEDIATE_PEM: &str = include_str!("fixtures/intermediate.pem");
const LEAF_PEM: &str = include_str!("fixtures/leaf.pem");
const DIRECT_LEAF_PEM: &str = include_str!("fixtures/direct_leaf.pem");
const LEAF_KEY_PEM: &str = include_str!("fixtures/leaf_key.pem");

const SERVER_ISN: u32 = 7000;
const SERVER_RANDOM: [u8; 32] = [0x5a; 32];
const TLS_RSA_WITH_AES_128_GCM_SHA256: u16 = 0x009c;
const FLIGHT_SPLIT_AT: usize = 211;

fn client_addr() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 50_123)
}

fn server_addr() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 443)
}

fn der(pem: &str) -> Vec<u8> {
    Pem::iter_from_buffer(pem.as_bytes()).next().unwrap().unwrap().contents
}

fn handshake_message<F>(msg_type: HandshakeType, body: F) -> Vec<u8>
where
    F: FnOnce(&mut Writer) -> Result<(), CodecError>,
{
    let mut w = Writer::new();
    w.put_u8(msg_type.get_u8());
    w.nested("body", LengthPrefix::U24, body).unwrap();
    w.into_bytes()
}

/// In-memory TLS 1.2 server speaking TLS_RSA_WITH_AES_128_GCM_SHA256 over
/// hand-built IPv4/TCP packets.
struct SimulatedServer {
    key: RsaPrivateKey,
    chain: Vec<Vec<u8>>,
    tamper_finished: bool,
    seq: u32,
    records: RecordReassembler,
    transcript: Vec<u8>,
    client_random: [u8; 32],
    keys: Option<KeyMaterial>,
    client_encrypting: bool,
    inbox: VecDeque<Vec<u8>>,
    identification: u16,
}

impl SimulatedServer {
    fn new(chain: Vec<Vec<u8>>) -> Self {
        Self {
            key: RsaPrivateKey::from_pkcs8_pem(LEAF_KEY_PEM).unwrap(),
            chain,
            tamper_finished: false,
            seq: SERVER_ISN,
            records: RecordReassembler::new(),
            transcript: Vec::new(),
            client_random: [0; 32],
            keys: None,
            client_encrypting: false,
            inbox: VecDeque::new(),
            identification: 1,
        }
    }

    fn reply(&mut self, kind: SegmentKind, seq: u32, ack: u32, payload: &[u8]) -> Vec<u8> {
        self.identification += 1;
        ConnectionIntent {
            destination: client_addr(),
            kind,
            seq_number: seq,
            ack_number: ack,
            payload: payload.to_vec(),
        }
        .build(server_addr(), self.identification)
        .unwrap()
    }

    fn push_data(&mut self, ack: u32, payload: &[u8]) {
        let packet = self.reply(SegmentKind::PshAck, self.seq, ack, payload);
        self.seq = self.seq.wrapping_add(payload.len() as u32);
        self.inbox.push_back(packet);
    }

    fn server_flight(&mut self) -> Vec<u8> {
        let server_hello = handshake_message(HandshakeType::ServerHello, |w| {
            w.put_u16(0x0303);
            w.field("random", Width::Fixed(32), &SERVER_RANDOM)?;
            w.field("session_id", Width::Prefixed(LengthPrefix::U8), &[0x22; 32])?;
            w.put_u16(TLS_RSA_WITH_AES_128_GCM_SHA256);
            w.put_u8(0);
            w.nested("extensions", LengthPrefix::U16, |w| {
                w.put_u16(0xff01);
                w.field("renegotiation_info", Width::Prefixed(LengthPrefix::U16), &[0])
            })
        });
        let chain = self.chain.clone();
        let certificate = handshake_message(HandshakeType::Certificate, |w| {
            w.nested("certificate_list", LengthPrefix::U24, |w| {
                for entry in &chain {
                    w.field("certificate", Width::Prefixed(LengthPrefix::U24), entry)?;
                }
                Ok(())
            })
        });
        let done = handshake_message(HandshakeType::ServerHelloDone, |_| Ok(()));

        let messages = [server_hello, certificate, done].concat();
        self.transcript.extend_from_slice(&messages);
        frame_record(ContentType::Handshake, &messages).unwrap()
    }

    fn client_key_exchange(&mut self, message: &[u8]) {
        let mut r = Reader::new(&message[4..]);
        let encrypted = r.prefixed("encrypted_pre_master_secret", LengthPrefix::U16).unwrap();
        let premaster = self.key.decrypt(Pkcs1v15Encrypt, encrypted).unwrap();
        let premaster = PremasterSecret::from_bytes(premaster.try_into().unwrap());
        self.transcript.extend_from_slice(message);
        self.keys = Some(
            KeyMaterial::derive(
                &premaster,
                self.client_random,
                SERVER_RANDOM,
                CipherParams::AES_128_GCM_SHA256,
            )
            .unwrap(),
        );
    }

    /// Checks the client's Finished and answers with ChangeCipherSpec and our own.
    fn client_finished(&mut self, fragment: &[u8]) -> Vec<u8> {
        let keys = self.keys.as_ref().unwrap();
        let mut opener = GcmRecordCipher::new(&keys.keys.client_write_key, &keys.keys.client_write_iv).unwrap();
        let plaintext = opener.open(ContentType::Handshake, fragment).unwrap();
        let expected = verify_data(&keys.master_secret, FinishedLabel::Client, &self.transcript).unwrap();
        assert_eq!(plaintext[0], HandshakeType::Finished.get_u8());
        assert_eq!(&plaintext[4..], &expected);
        self.transcript.extend_from_slice(&plaintext);

        let mut verify = verify_data(&keys.master_secret, FinishedLabel::Server, &self.transcript).unwrap();
        if self.tamper_finished {
            verify[0] ^= 0xff;
        }
        let mut sealer = GcmRecordCipher::new(&keys.keys.server_write_key, &keys.keys.server_write_iv).unwrap();
        let sealed = sealer
            .seal(ContentType::Handshake, &finished(&verify).unwrap())
            .unwrap();
        [
            frame_record(ContentType::ChangeCipherSpec, &[1]).unwrap(),
            frame_record(ContentType::Handshake, &sealed).unwrap(),
        ]
        .concat()
    }

    fn respond(&mut self, segment: &InboundSegment) {
        let flags = segment.tcp.flags;
        if flags == TcpFlags::SYN {
            let mut packet = self.reply(SegmentKind::Ack, SERVER_ISN, segment.tcp.seq_number.wrapping_add(1), &[]);
            // The client does not verify inbound checksums.
            packet[IPV4_HEADER_LEN + 13] = TcpFlags::SYN.union(TcpFlags::ACK).bits();
            self.seq = SERVER_ISN.wrapping_add(1);
            self.inbox.push_back(packet);
            return;
        }
        if flags.contains(TcpFlags::FIN) {
            let ack = segment.tcp.seq_number.wrapping_add(1);
            let packet = self.reply(SegmentKind::FinAck, segment.tcp.ack_number, ack, &[]);
            self.inbox.push_back(packet);
            return;
        }
        if segment.payload.is_empty() {
            return;
        }

        let ack = segment.tcp.seq_number.wrapping_add(segment.payload.len() as u32);
        self.records.push(&segment.payload);
        while let Some(record) = self.records.next_record().unwrap() {
            match (record.content_type, self.client_encrypting) {
                (ContentType::Handshake, false) if record.payload[0] == HandshakeType::ClientHello.get_u8() => {
                    let hello = ClientHello::decode(&record.payload).unwrap();
                    assert_eq!(hello.cipher_suites, vec![TLS_RSA_WITH_AES_128_GCM_SHA256]);
                    self.client_random = hello.random;
                    self.transcript.extend_from_slice(&record.payload);
                    let flight = self.server_flight();
                    // Split inside the Certificate message.
                    let (head, tail) = flight.split_at(FLIGHT_SPLIT_AT);
                    self.push_data(ack, head);
                    self.push_data(ack, tail);
                }
                (ContentType::Handshake, false) => {
                    assert_eq!(record.payload[0], HandshakeType::ClientKeyExchange.get_u8());
                    self.client_key_exchange(&record.payload);
                }
                (ContentType::ChangeCipherSpec, false) => {
                    assert_eq!(record.payload, vec![1]);
                    self.client_encrypting = true;
                }
                (ContentType::Handshake, true) => {
                    let reply = self.client_finished(&record.payload);
                    self.push_data(ack, &reply);
                }
                (other, _) => panic!("unexpected {:?} record", other),
            }
        }
    }
}

impl PacketLink for SimulatedServer {
    fn send_packet(&mut self, packet: &[u8], _destination: SocketAddrV4) -> Result<(), TransportError> {
        let segment = InboundSegment::parse(packet).unwrap();
        self.respond(&segment);
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

fn config(server_name: &str) -> HandshakeConfig {
    let mut config = HandshakeConfig::rsa_aes128_gcm("10.0.0.1", 443);
    config.target.server_name = Some(server_name.to_string());
    config.receive_timeout_ms = 200;
    config
}

fn intermediate_chain() -> Vec<Vec<u8>> {
    vec![der(LEAF_PEM), der(INTERMEDIATE_PEM)]
}

fn root_anchors() -> TrustAnchors {
    TrustAnchors::from_pem(ROOT_PEM.as_bytes()).unwrap()
}

#[test]
fn test_full_rsa_handshake_against_simulated_server() {
    // Arrange
    let server = SimulatedServer::new(intermediate_chain());
    let session = HandshakeSession::new(server, client_addr(), server_addr(), &config("handshake.test"), root_anchors());

    // Act
    let outcome = session.run().unwrap();

    // Assert
    assert_eq!(outcome.cipher_suite, TLS_RSA_WITH_AES_128_GCM_SHA256);
    assert_eq!(outcome.cipher_suite_name, "TLS_RSA_WITH_AES_128_GCM_SHA256");
    assert_eq!(outcome.server_random, SERVER_RANDOM);
    assert_eq!(outcome.chain_len, 2);
    assert!(outcome.leaf_subject.contains("handshake.test"));
    assert!(outcome.ecdhe_params.is_none());
    let material = outcome.key_material.unwrap();
    assert_eq!(material.server_random, SERVER_RANDOM);
    assert_eq!(material.keys.client_write_key.len(), 16);
    assert_eq!(material.keys.server_write_iv.len(), 4);
}

#[test]
fn test_tampered_server_finished_is_rejected() {
    // Arrange
    let mut server = SimulatedServer::new(intermediate_chain());
    server.tamper_finished = true;
    let session = HandshakeSession::new(server, client_addr(), server_addr(), &config("handshake.test"), root_anchors());

    // Act
    let err = session.run().unwrap_err();

    // Assert
    assert_eq!(err.phase, HandshakePhase::Finished);
    assert!(matches!(err.kind, ErrorKind::Protocol(ProtocolViolation::FinishedMismatch)));
}

#[test]
fn test_chain_to_unknown_root_fails_certificate_validation() {
    let server = SimulatedServer::new(intermediate_chain());
    let anchors = TrustAnchors::from_pem(DIRECT_LEAF_PEM.as_bytes()).unwrap();
    let session = HandshakeSession::new(server, client_addr(), server_addr(), &config("handshake.test"), anchors);

    let err = session.run().unwrap_err();

    assert_eq!(err.phase, HandshakePhase::CertificateValidation);
    assert!(matches!(
        err.kind,
        ErrorKind::Certificate(CertificateError::UntrustedIssuer { index: 1, .. })
    ));
}

#[test]
fn test_wrong_server_name_fails_certificate_validation() {
    let server = SimulatedServer::new(intermediate_chain());
    let session = HandshakeSession::new(server, client_addr(), server_addr(), &config("other.test"), root_anchors());

    let err = session.run().unwrap_err();

    assert_eq!(err.phase, HandshakePhase::CertificateValidation);
    assert!(matches!(
        err.kind,
        ErrorKind::Certificate(CertificateError::NameMismatch { ref expected }) if expected == "other.test"
    ));
}
