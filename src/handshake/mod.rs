//! TLS 1.2 handshake messages (RFC 5246 §7.4).
//!
//! Each handshake message is a 1-byte type, a 3-byte big-endian body length,
//! and the body. The length is always computed from the encoded body.

pub mod builder;
pub mod extensions;
pub mod parser;

use rustls::HandshakeType;

use crate::codec::{CodecError, LengthPrefix, Reader, Writer};

pub use builder::{change_cipher_spec_record, client_key_exchange, encrypt_premaster, finished};
pub use extensions::Extension;
pub use parser::{decode_handshake, ServerFlight, ServerFlightReader};

pub const HANDSHAKE_HEADER_LEN: usize = 4;
pub const RANDOM_LEN: usize = 32;
pub const VERIFY_DATA_LEN: usize = 12;

/// Wrap a body in its handshake header.
pub(crate) fn encode_handshake<F>(msg_type: HandshakeType, body: F) -> Result<Vec<u8>, CodecError>
where
    F: FnOnce(&mut Writer) -> Result<(), CodecError>,
{
    let mut w = Writer::new();
    w.put_u8(msg_type.get_u8());
    w.nested("handshake_body", LengthPrefix::U24, body)?;
    Ok(w.into_bytes())
}

/// Split one handshake message into its type and body.
pub(crate) fn split_handshake(message: &[u8]) -> Result<(HandshakeType, &[u8]), CodecError> {
    let mut r = Reader::new(message);
    let msg_type = HandshakeType::from(r.u8("handshake_type")?);
    let body = r.prefixed("handshake_length", LengthPrefix::U24)?;
    r.expect_end("handshake_body")?;
    Ok((msg_type, body))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub version: u16,
    pub random: [u8; RANDOM_LEN],
    pub session_id: Vec<u8>,
    pub cipher_suites: Vec<u16>,
    pub compression_methods: Vec<u8>,
    pub extensions: Vec<Extension>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub version: u16,
    pub random: [u8; RANDOM_LEN],
    pub session_id: Vec<u8>,
    pub cipher_suite: u16,
    pub compression_method: u8,
    pub extensions: Vec<Extension>,
}

/// DER certificates as received, leaf first.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CertificateChain {
    pub entries: Vec<Vec<u8>>,
}

impl CertificateChain {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// ServerECDHParams plus the signature over them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcdheParams {
    pub curve_type: u8,
    pub named_curve: u16,
    pub public_key: Vec<u8>,
    pub signature_scheme: u16,
    pub signature: Vec<u8>,
}

/// Every message the server sends during a full RSA or ECDHE handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeMessage {
    ServerHello(ServerHello),
    Certificate(CertificateChain),
    ServerKeyExchange(EcdheParams),
    ServerHelloDone,
    /// Opaque verify_data; checked by the session against the key schedule.
    Finished(Vec<u8>),
}

impl HandshakeMessage {
    pub fn name(&self) -> &'static str {
        match self {
            HandshakeMessage::ServerHello(_) => "ServerHello",
            HandshakeMessage::Certificate(_) => "Certificate",
            HandshakeMessage::ServerKeyExchange(_) => "ServerKeyExchange",
            HandshakeMessage::ServerHelloDone => "ServerHelloDone",
            HandshakeMessage::Finished(_) => "Finished",
        }
    }
}
