use rustls::{ContentType, HandshakeType};

use super::extensions::decode_extensions;
use super::{
    split_handshake, CertificateChain, ClientHello, EcdheParams, HandshakeMessage, ServerHello, HANDSHAKE_HEADER_LEN,
    RANDOM_LEN,
};
use crate::codec::{decode_u24, LengthPrefix, Reader};
use crate::errors::ProtocolViolation;
use crate::logging::LogLevel;
use crate::record::RecordReassembler;

/// Decode one complete handshake message, header included.
pub fn decode_handshake(message: &[u8]) -> Result<HandshakeMessage, ProtocolViolation> {
    let (msg_type, body) = split_handshake(message)?;
    let mut r = Reader::new(body);
    let decoded = match msg_type {
        HandshakeType::ServerHello => HandshakeMessage::ServerHello(decode_server_hello(&mut r)?),
        HandshakeType::Certificate => HandshakeMessage::Certificate(decode_certificate(&mut r)?),
        HandshakeType::ServerKeyExchange => HandshakeMessage::ServerKeyExchange(decode_server_key_exchange(&mut r)?),
        HandshakeType::ServerHelloDone => HandshakeMessage::ServerHelloDone,
        HandshakeType::Finished => HandshakeMessage::Finished(r.rest().to_vec()),
        other => return Err(ProtocolViolation::UnknownHandshakeType(other.get_u8())),
    };
    r.expect_end("handshake_body")?;
    Ok(decoded)
}

fn decode_server_hello(r: &mut Reader<'_>) -> Result<ServerHello, ProtocolViolation> {
    Ok(ServerHello {
        version: r.u16("server_version")?,
        random: r.array::<RANDOM_LEN>("server_random")?,
        session_id: r.prefixed("session_id", LengthPrefix::U8)?.to_vec(),
        cipher_suite: r.u16("cipher_suite")?,
        compression_method: r.u8("compression_method")?,
        extensions: decode_extensions(r)?,
    })
}

fn decode_certificate(r: &mut Reader<'_>) -> Result<CertificateChain, ProtocolViolation> {
    let mut list = Reader::new(r.prefixed("certificate_list", LengthPrefix::U24)?);
    let mut entries = Vec::new();
    while !list.is_empty() {
        entries.push(list.prefixed("asn1_cert", LengthPrefix::U24)?.to_vec());
    }
    Ok(CertificateChain { entries })
}

fn decode_server_key_exchange(r: &mut Reader<'_>) -> Result<EcdheParams, ProtocolViolation> {
    Ok(EcdheParams {
        curve_type: r.u8("curve_type")?,
        named_curve: r.u16("named_curve")?,
        public_key: r.prefixed("ecdh_public", LengthPrefix::U8)?.to_vec(),
        signature_scheme: r.u16("signature_algorithm")?,
        signature: r.prefixed("signature", LengthPrefix::U16)?.to_vec(),
    })
}

impl ClientHello {
    pub fn decode(message: &[u8]) -> Result<Self, ProtocolViolation> {
        let (msg_type, body) = split_handshake(message)?;
        if msg_type != HandshakeType::ClientHello {
            return Err(ProtocolViolation::UnknownHandshakeType(msg_type.get_u8()));
        }
        let mut r = Reader::new(body);
        let version = r.u16("client_version")?;
        let random = r.array::<RANDOM_LEN>("random")?;
        let session_id = r.prefixed("session_id", LengthPrefix::U8)?.to_vec();
        let mut suites = Reader::new(r.prefixed("cipher_suites", LengthPrefix::U16)?);
        let mut cipher_suites = Vec::new();
        while !suites.is_empty() {
            cipher_suites.push(suites.u16("cipher_suite")?);
        }
        let compression_methods = r.prefixed("compression_methods", LengthPrefix::U8)?.to_vec();
        let extensions = decode_extensions(&mut r)?;
        r.expect_end("client_hello")?;
        Ok(Self {
            version,
            random,
            session_id,
            cipher_suites,
            compression_methods,
            extensions,
        })
    }
}

/// The server's first flight, validated for order and completeness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerFlight {
    pub server_hello: ServerHello,
    pub certificates: CertificateChain,
    pub key_exchange: Option<EcdheParams>,
    /// Raw handshake messages in arrival order, for the Finished transcript.
    pub transcript: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlightStage {
    AwaitServerHello,
    AwaitCertificate,
    AwaitKeyExchangeOrDone,
    AwaitDone,
    Complete,
}

impl FlightStage {
    fn expected(self) -> &'static str {
        match self {
            FlightStage::AwaitServerHello => "ServerHello",
            FlightStage::AwaitCertificate => "Certificate",
            FlightStage::AwaitKeyExchangeOrDone => "ServerKeyExchange or ServerHelloDone",
            FlightStage::AwaitDone => "ServerHelloDone",
            FlightStage::Complete => "nothing",
        }
    }

    fn advance(self, message: &HandshakeMessage) -> Option<FlightStage> {
        match (self, message) {
            (FlightStage::AwaitServerHello, HandshakeMessage::ServerHello(_)) => Some(FlightStage::AwaitCertificate),
            (FlightStage::AwaitCertificate, HandshakeMessage::Certificate(_)) => {
                Some(FlightStage::AwaitKeyExchangeOrDone)
            }
            (FlightStage::AwaitKeyExchangeOrDone, HandshakeMessage::ServerKeyExchange(_)) => {
                Some(FlightStage::AwaitDone)
            }
            (FlightStage::AwaitKeyExchangeOrDone | FlightStage::AwaitDone, HandshakeMessage::ServerHelloDone) => {
                Some(FlightStage::Complete)
            }
            _ => None,
        }
    }
}

/// Reassembles ServerHello, Certificate, optional ServerKeyExchange and
/// ServerHelloDone from TCP payloads of any size. Handshake messages may
/// span records and records may span segments; incomplete input is held.
#[derive(Debug)]
pub struct ServerFlightReader {
    records: RecordReassembler,
    pending: Vec<u8>,
    messages: Vec<HandshakeMessage>,
    transcript: Vec<u8>,
    stage: FlightStage,
}

impl Default for ServerFlightReader {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerFlightReader {
    pub fn new() -> Self {
        Self {
            records: RecordReassembler::new(),
            pending: Vec::new(),
            messages: Vec::new(),
            transcript: Vec::new(),
            stage: FlightStage::AwaitServerHello,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.stage == FlightStage::Complete
    }

    pub fn messages(&self) -> &[HandshakeMessage] {
        &self.messages
    }

    /// Feed one segment's payload. Returns `true` once ServerHelloDone has
    /// been decoded; records after it stay buffered for the caller.
    pub fn feed(&mut self, payload: &[u8]) -> Result<bool, ProtocolViolation> {
        self.records.push(payload);
        while !self.is_complete() {
            let Some(record) = self.records.next_record()? else {
                break;
            };
            match record.content_type {
                ContentType::Handshake => self.pending.extend_from_slice(&record.payload),
                ContentType::Alert => return Err(alert_violation(&record.payload)),
                other => return Err(ProtocolViolation::UnexpectedContentType(other.get_u8())),
            }
            self.drain_messages()?;
        }
        Ok(self.is_complete())
    }

    fn drain_messages(&mut self) -> Result<(), ProtocolViolation> {
        while self.pending.len() >= HANDSHAKE_HEADER_LEN && !self.is_complete() {
            let body_len = decode_u24(&self.pending[1..HANDSHAKE_HEADER_LEN])? as usize;
            let end = HANDSHAKE_HEADER_LEN + body_len;
            if self.pending.len() < end {
                break;
            }
            let raw: Vec<u8> = self.pending.drain(..end).collect();
            let message = decode_handshake(&raw)?;
            self.stage = self
                .stage
                .advance(&message)
                .ok_or(ProtocolViolation::UnexpectedMessage {
                    expected: self.stage.expected(),
                    found: message.name(),
                })?;
            crate::log!(LogLevel::Debug, "Received {} ({} bytes)", message.name(), raw.len());
            self.transcript.extend_from_slice(&raw);
            self.messages.push(message);
        }
        if self.is_complete() && !self.pending.is_empty() {
            return Err(ProtocolViolation::UnexpectedMessage {
                expected: self.stage.expected(),
                found: "trailing handshake bytes",
            });
        }
        Ok(())
    }

    /// The held partial record or message, if the peer stopped mid-flight.
    pub fn truncation(&self) -> Option<ProtocolViolation> {
        self.records.truncation().or_else(|| {
            (!self.pending.is_empty()).then(|| ProtocolViolation::RecordLengthMismatch {
                declared: self
                    .pending
                    .get(1..HANDSHAKE_HEADER_LEN)
                    .and_then(|len| decode_u24(len).ok())
                    .map_or(0, |len| len as usize + HANDSHAKE_HEADER_LEN),
                actual: self.pending.len(),
            })
        })
    }

    /// Consume a complete reader. Records that followed ServerHelloDone are
    /// handed back with the record reassembler.
    pub fn into_flight(self) -> Result<(ServerFlight, RecordReassembler), ProtocolViolation> {
        if !self.is_complete() {
            return Err(ProtocolViolation::UnexpectedMessage {
                expected: self.stage.expected(),
                found: "end of flight",
            });
        }
        let mut server_hello = None;
        let mut certificates = None;
        let mut key_exchange = None;
        for message in self.messages {
            match message {
                HandshakeMessage::ServerHello(hello) => server_hello = Some(hello),
                HandshakeMessage::Certificate(chain) => certificates = Some(chain),
                HandshakeMessage::ServerKeyExchange(params) => key_exchange = Some(params),
                HandshakeMessage::ServerHelloDone | HandshakeMessage::Finished(_) => {}
            }
        }
        match (server_hello, certificates) {
            (Some(server_hello), Some(certificates)) => Ok((
                ServerFlight {
                    server_hello,
                    certificates,
                    key_exchange,
                    transcript: self.transcript,
                },
                self.records,
            )),
            _ => Err(ProtocolViolation::UnexpectedMessage {
                expected: "ServerHello and Certificate",
                found: "ServerHelloDone",
            }),
        }
    }
}

/// Alert records carry a level and a description byte.
pub fn alert_violation(payload: &[u8]) -> ProtocolViolation {
    match payload {
        [level, description] => ProtocolViolation::AlertReceived {
            level: *level,
            description: *description,
        },
        _ => ProtocolViolation::RecordLengthMismatch {
            declared: 2,
            actual: payload.len(),
        },
    }
}
