//! One TLS 1.2 handshake over one raw TCP connection.
//!
//! TCP establishment, ClientHello, server flight, cipher check, certificate
//! validation, ClientKeyExchange + ChangeCipherSpec + Finished, server
//! Finished, teardown. Each step's failure is tagged with its phase.

use std::net::SocketAddrV4;

use rand::{CryptoRng, Rng, RngCore};
use rustls::{CipherSuite, ContentType, ProtocolVersion};
use x509_parser::time::ASN1Time;

use crate::certificate::{validate_chain, TrustAnchors};
use crate::config::{HandshakeConfig, TrustSource};
use crate::core::observability::{self, HealthState};
use crate::errors::{
    CertificateError, ErrorKind, HandshakeError, HandshakePhase, InPhase, ProtocolViolation, TransportError,
};
use crate::handshake::builder::handshake_record;
use crate::handshake::parser::alert_violation;
use crate::handshake::{
    change_cipher_spec_record, client_key_exchange, decode_handshake, encrypt_premaster, finished, ClientHello,
    EcdheParams, HandshakeMessage, ServerFlight, ServerFlightReader, RANDOM_LEN,
};
use crate::key_schedule::{verify_data, CipherParams, FinishedLabel, KeyMaterial, PremasterSecret};
use crate::logging::LogLevel;
use crate::record::{frame_record, Record, RecordReassembler};
use crate::record_protection::GcmRecordCipher;
use crate::tcp_session::TcpSession;
use crate::transport::{discover_local_address, resolve_ipv4, PacketLink, RawSocketLink};

const EPHEMERAL_PORTS: std::ops::RangeInclusive<u16> = 49152..=65535;
const COMPRESSION_NULL: u8 = 0;

/// What a completed handshake established.
#[derive(Debug)]
pub struct HandshakeOutcome {
    pub cipher_suite: u16,
    pub cipher_suite_name: String,
    pub server_random: [u8; RANDOM_LEN],
    pub chain_len: usize,
    pub leaf_subject: String,
    /// Present when the server chose an ECDHE suite under a relaxed policy.
    pub ecdhe_params: Option<EcdheParams>,
    /// Present for RSA key exchange sessions.
    pub key_material: Option<KeyMaterial>,
}

pub fn load_anchors(trust: &TrustSource) -> Result<TrustAnchors, CertificateError> {
    match trust {
        TrustSource::Native => TrustAnchors::native(),
        TrustSource::PemFile { path } => TrustAnchors::from_pem_file(path),
    }
}

pub struct HandshakeSession<L: PacketLink> {
    tcp: TcpSession<L>,
    config: HandshakeConfig,
    anchors: TrustAnchors,
    transcript: Vec<u8>,
}

impl HandshakeSession<RawSocketLink> {
    /// Resolve the target, open a raw socket and run the whole handshake.
    pub fn connect(config: &HandshakeConfig) -> Result<HandshakeOutcome, HandshakeError> {
        let phase = HandshakePhase::TcpEstablishment;
        let peer = resolve_ipv4(&config.target.host, config.target.port).in_phase(phase)?;
        let local_ip = match config.local.address {
            Some(address) => address,
            None => discover_local_address(peer).in_phase(phase)?,
        };
        let local_port = config
            .local
            .port
            .unwrap_or_else(|| rand::thread_rng().gen_range(EPHEMERAL_PORTS));
        let anchors = load_anchors(&config.trust).in_phase(HandshakePhase::CertificateValidation)?;
        let link = RawSocketLink::open(local_ip).in_phase(phase)?;

        HandshakeSession::new(link, SocketAddrV4::new(local_ip, local_port), peer, config, anchors).run()
    }
}

impl<L: PacketLink> HandshakeSession<L> {
    pub fn new(
        link: L,
        local: SocketAddrV4,
        peer: SocketAddrV4,
        config: &HandshakeConfig,
        anchors: TrustAnchors,
    ) -> Self {
        Self {
            tcp: TcpSession::new(link, local, peer, config.receive_timeout()),
            config: config.clone(),
            anchors,
            transcript: Vec::new(),
        }
    }

    pub fn run(self) -> Result<HandshakeOutcome, HandshakeError> {
        self.run_with(&mut rand::thread_rng(), ASN1Time::now())
    }

    /// Run with an explicit randomness source and validation time.
    pub fn run_with<R: RngCore + CryptoRng>(
        mut self,
        rng: &mut R,
        now: ASN1Time,
    ) -> Result<HandshakeOutcome, HandshakeError> {
        observability::record_connection_opened();
        scopeguard::defer! {
            observability::record_connection_closed();
        }

        crate::log!(LogLevel::Info, "Connecting {} -> {}", self.tcp.local(), self.tcp.peer());
        self.tcp.connect(rng.next_u32()).in_phase(HandshakePhase::TcpEstablishment)?;

        let hello = self.send_client_hello(rng)?;
        let (flight, mut records) = self.read_server_flight()?;
        self.transcript.extend_from_slice(&flight.transcript);

        let params = self.check_server_hello(&flight)?;
        let validated = validate_chain(
            &flight.certificates,
            &self.anchors,
            self.config.expected_server_name().as_deref(),
            now,
        )
        .in_phase(HandshakePhase::CertificateValidation)?;
        crate::log!(
            LogLevel::Info,
            "Certificate chain of {} validated for {}",
            validated.chain_len,
            validated.identity
        );

        let suite = flight.server_hello.cipher_suite;
        let mut outcome = HandshakeOutcome {
            cipher_suite: suite,
            cipher_suite_name: format!("{:?}", CipherSuite::from(suite)),
            server_random: flight.server_hello.random,
            chain_len: validated.chain_len,
            leaf_subject: validated.leaf_subject.clone(),
            ecdhe_params: flight.key_exchange.clone(),
            key_material: None,
        };

        let Some(params) = params else {
            crate::log!(
                LogLevel::Info,
                "Server chose {}; ECDHE key agreement is not performed, closing",
                outcome.cipher_suite_name
            );
            self.tcp.close().in_phase(HandshakePhase::Teardown)?;
            return Ok(outcome);
        };

        let server_key = validated.rsa_public_key().in_phase(HandshakePhase::CertificateValidation)?;
        let premaster = PremasterSecret::generate(rng);
        let encrypted = encrypt_premaster(rng, &server_key, &premaster).in_phase(HandshakePhase::KeyExchange)?;
        let key_exchange = client_key_exchange(&encrypted).in_phase(HandshakePhase::KeyExchange)?;
        self.transcript.extend_from_slice(&key_exchange);
        let material = KeyMaterial::derive(&premaster, hello.random, flight.server_hello.random, params)
            .in_phase(HandshakePhase::KeyExchange)?;
        crate::log!(LogLevel::Info, "Master secret and key block derived");

        self.send_client_finished(&key_exchange, &material)?;
        self.verify_server_finished(&mut records, &material)?;

        self.tcp.close().in_phase(HandshakePhase::Teardown)?;
        observability::record_handshake_completed();
        observability::set_health(HealthState::OK);
        crate::log!(LogLevel::Info, "Handshake complete with {}", outcome.cipher_suite_name);
        outcome.key_material = Some(material);
        Ok(outcome)
    }

    fn send_client_hello<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> Result<ClientHello, HandshakeError> {
        let phase = HandshakePhase::ClientHello;
        let hello = ClientHello::new(rng, &self.config.cipher_policy.offered).in_phase(phase)?;
        let message = hello.encode().in_phase(phase)?;
        let record = handshake_record(&[&message]).in_phase(phase)?;
        self.tcp.send_data(&record).in_phase(phase)?;
        self.transcript.extend_from_slice(&message);
        crate::log!(LogLevel::Info, "ClientHello sent ({} bytes)", record.len());
        Ok(hello)
    }

    fn read_server_flight(&mut self) -> Result<(ServerFlight, RecordReassembler), HandshakeError> {
        let phase = HandshakePhase::ServerFlight;
        let mut reader = ServerFlightReader::new();
        loop {
            let payload = match self.tcp.receive_data() {
                Ok(payload) => payload,
                Err(TransportError::PeerClosed) => {
                    let kind = reader
                        .truncation()
                        .map(ErrorKind::from)
                        .unwrap_or(ErrorKind::Transport(TransportError::PeerClosed));
                    return Err(HandshakeError::new(phase, kind));
                }
                Err(e) => return Err(HandshakeError::new(phase, e)),
            };
            if reader.feed(&payload).in_phase(phase)? {
                break;
            }
        }
        reader.into_flight().in_phase(phase)
    }

    /// Version, compression and suite checks. `None` means the server picked
    /// a suite this client carries no key schedule for, accepted only when
    /// RSA enforcement is off.
    fn check_server_hello(&self, flight: &ServerFlight) -> Result<Option<CipherParams>, HandshakeError> {
        let phase = HandshakePhase::ServerFlight;
        let hello = &flight.server_hello;
        let violation = |v: ProtocolViolation| HandshakeError::new(phase, v);

        if hello.version != ProtocolVersion::TLSv1_2.get_u16() {
            return Err(violation(ProtocolViolation::UnsupportedVersion(hello.version)));
        }
        if hello.compression_method != COMPRESSION_NULL {
            return Err(violation(ProtocolViolation::UnsupportedCompression(hello.compression_method)));
        }
        if !self.config.cipher_policy.offered.contains(&hello.cipher_suite) {
            return Err(violation(ProtocolViolation::UnsupportedCipherSuite(hello.cipher_suite)));
        }
        crate::log!(
            LogLevel::Info,
            "Server selected {:?}",
            CipherSuite::from(hello.cipher_suite)
        );

        match CipherParams::for_suite(hello.cipher_suite) {
            Some(_) if flight.key_exchange.is_some() => Err(violation(ProtocolViolation::UnexpectedMessage {
                expected: "ServerHelloDone",
                found: "ServerKeyExchange",
            })),
            Some(params) => Ok(Some(params)),
            None if self.config.cipher_policy.enforce_rsa_key_exchange => {
                Err(violation(ProtocolViolation::UnsupportedCipherSuite(hello.cipher_suite)))
            }
            None if flight.key_exchange.is_none() => Err(violation(ProtocolViolation::UnexpectedMessage {
                expected: "ServerKeyExchange",
                found: "ServerHelloDone",
            })),
            None => Ok(None),
        }
    }

    /// ClientKeyExchange, ChangeCipherSpec and the sealed Finished, in one segment.
    fn send_client_finished(&mut self, key_exchange: &[u8], material: &KeyMaterial) -> Result<(), HandshakeError> {
        let phase = HandshakePhase::Finished;
        let client_verify = verify_data(&material.master_secret, FinishedLabel::Client, &self.transcript)
            .in_phase(phase)?;
        let finished_message = finished(&client_verify).in_phase(phase)?;

        let mut sealer = GcmRecordCipher::new(&material.keys.client_write_key, &material.keys.client_write_iv)
            .in_phase(phase)?;
        let sealed = sealer.seal(ContentType::Handshake, &finished_message).in_phase(phase)?;

        let mut flight = handshake_record(&[key_exchange]).in_phase(HandshakePhase::KeyExchange)?;
        flight.extend(change_cipher_spec_record().in_phase(phase)?);
        flight.extend(frame_record(ContentType::Handshake, &sealed).in_phase(phase)?);
        self.tcp.send_data(&flight).in_phase(phase)?;
        self.transcript.extend_from_slice(&finished_message);
        crate::log!(
            LogLevel::Info,
            "ClientKeyExchange, ChangeCipherSpec and Finished sent ({} bytes)",
            flight.len()
        );
        Ok(())
    }

    fn verify_server_finished(
        &mut self,
        records: &mut RecordReassembler,
        material: &KeyMaterial,
    ) -> Result<(), HandshakeError> {
        let phase = HandshakePhase::Finished;
        let expected = verify_data(&material.master_secret, FinishedLabel::Server, &self.transcript)
            .in_phase(phase)?;

        let change_cipher_spec = self.next_record(records, phase)?;
        if change_cipher_spec.content_type != ContentType::ChangeCipherSpec || change_cipher_spec.payload != [1] {
            return Err(HandshakeError::new(
                phase,
                ProtocolViolation::UnexpectedMessage {
                    expected: "ChangeCipherSpec",
                    found: "another record",
                },
            ));
        }

        let sealed = self.next_record(records, phase)?;
        if sealed.content_type != ContentType::Handshake {
            return Err(HandshakeError::new(
                phase,
                ProtocolViolation::UnexpectedContentType(sealed.content_type.get_u8()),
            ));
        }
        let mut opener = GcmRecordCipher::new(&material.keys.server_write_key, &material.keys.server_write_iv)
            .in_phase(phase)?;
        let plaintext = opener.open(ContentType::Handshake, &sealed.payload).in_phase(phase)?;
        match decode_handshake(&plaintext).in_phase(phase)? {
            HandshakeMessage::Finished(verify) if verify == expected => {
                crate::log!(LogLevel::Info, "Server Finished verified");
                Ok(())
            }
            HandshakeMessage::Finished(_) => Err(HandshakeError::new(phase, ProtocolViolation::FinishedMismatch)),
            other => Err(HandshakeError::new(
                phase,
                ProtocolViolation::UnexpectedMessage {
                    expected: "Finished",
                    found: other.name(),
                },
            )),
        }
    }

    /// Next non-alert record, reading more segments as needed.
    fn next_record(&mut self, records: &mut RecordReassembler, phase: HandshakePhase) -> Result<Record, HandshakeError> {
        loop {
            if let Some(record) = records.next_record().in_phase(phase)? {
                if record.content_type == ContentType::Alert {
                    return Err(HandshakeError::new(phase, alert_violation(&record.payload)));
                }
                return Ok(record);
            }
            match self.tcp.receive_data() {
                Ok(payload) => records.push(&payload),
                Err(TransportError::PeerClosed) => {
                    let kind = records
                        .truncation()
                        .map(ErrorKind::from)
                        .unwrap_or(ErrorKind::Transport(TransportError::PeerClosed));
                    return Err(HandshakeError::new(phase, kind));
                }
                Err(e) => return Err(HandshakeError::new(phase, e)),
            }
        }
    }
}
