use std::time::Duration;

use rustls::{AlertDescription, CipherSuite};

use crate::codec::CodecError;
use crate::core::observability::{self, ErrorClass};

/// Raw socket and TCP-level failures.
#[derive(Debug)]
pub enum TransportError {
    SocketCreate(std::io::Error),
    Bind(std::io::Error),
    Send(std::io::Error),
    Receive(std::io::Error),
    Resolve { host: String },
    Timeout { waited: Duration },
    ConnectionReset,
    PeerClosed,
    InvalidState { expected: &'static str, actual: &'static str },
    Malformed(CodecError),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::SocketCreate(e) => write!(f, "raw socket creation failed: {}", e),
            TransportError::Bind(e) => write!(f, "raw socket bind failed: {}", e),
            TransportError::Send(e) => write!(f, "packet send failed: {}", e),
            TransportError::Receive(e) => write!(f, "packet receive failed: {}", e),
            TransportError::Resolve { host } => write!(f, "no IPv4 address for host '{}'", host),
            TransportError::Timeout { waited } => {
                write!(f, "no matching segment within {} ms", waited.as_millis())
            }
            TransportError::ConnectionReset => write!(f, "peer reset the connection"),
            TransportError::PeerClosed => write!(f, "peer closed the connection early"),
            TransportError::InvalidState { expected, actual } => {
                write!(f, "TCP session is {} but operation requires {}", actual, expected)
            }
            TransportError::Malformed(e) => write!(f, "undecodable packet: {}", e),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<CodecError> for TransportError {
    fn from(e: CodecError) -> Self {
        TransportError::Malformed(e)
    }
}

/// The peer sent bytes that do not follow TLS 1.2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    Malformed(CodecError),
    RecordLengthMismatch { declared: usize, actual: usize },
    OversizedRecord { length: usize },
    UnexpectedContentType(u8),
    UnsupportedVersion(u16),
    UnknownHandshakeType(u8),
    UnexpectedMessage { expected: &'static str, found: &'static str },
    UnsupportedCipherSuite(u16),
    UnsupportedCompression(u8),
    AlertReceived { level: u8, description: u8 },
    FinishedMismatch,
}

impl std::fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolViolation::Malformed(e) => write!(f, "{}", e),
            ProtocolViolation::RecordLengthMismatch { declared, actual } => write!(
                f,
                "record declares {} bytes but carries {}",
                declared, actual
            ),
            ProtocolViolation::OversizedRecord { length } => {
                write!(f, "record length {} exceeds the TLS limit", length)
            }
            ProtocolViolation::UnexpectedContentType(t) => write!(f, "unexpected content type 0x{:02x}", t),
            ProtocolViolation::UnsupportedVersion(v) => write!(f, "unsupported protocol version 0x{:04x}", v),
            ProtocolViolation::UnknownHandshakeType(t) => write!(f, "unknown handshake type 0x{:02x}", t),
            ProtocolViolation::UnexpectedMessage { expected, found } => {
                write!(f, "expected {} but received {}", expected, found)
            }
            ProtocolViolation::UnsupportedCipherSuite(code) => {
                write!(f, "cipher suite {:?} is not supported", CipherSuite::from(*code))
            }
            ProtocolViolation::UnsupportedCompression(m) => write!(f, "compression method {} is not supported", m),
            ProtocolViolation::AlertReceived { level, description } => write!(
                f,
                "peer sent alert {:?} (level {})",
                AlertDescription::from(*description),
                level
            ),
            ProtocolViolation::FinishedMismatch => write!(f, "server Finished verify_data does not match"),
        }
    }
}

impl std::error::Error for ProtocolViolation {}

impl From<CodecError> for ProtocolViolation {
    fn from(e: CodecError) -> Self {
        ProtocolViolation::Malformed(e)
    }
}

/// Certificate parsing or chain verification failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateError {
    EmptyChain,
    Parse { index: usize, reason: String },
    NotYetValidOrExpired { index: usize },
    UntrustedIssuer { index: usize, issuer: String },
    BadSignature { index: usize, reason: String },
    NotCertificateAuthority { index: usize },
    NameMismatch { expected: String },
    UnsupportedPublicKey,
    TrustStore(String),
}

impl std::fmt::Display for CertificateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CertificateError::EmptyChain => write!(f, "server sent an empty certificate chain"),
            CertificateError::Parse { index, reason } => {
                write!(f, "certificate {} is not valid DER: {}", index, reason)
            }
            CertificateError::NotYetValidOrExpired { index } => {
                write!(f, "certificate {} is outside its validity period", index)
            }
            CertificateError::UntrustedIssuer { index, issuer } => {
                write!(f, "certificate {} chains to unknown issuer '{}'", index, issuer)
            }
            CertificateError::BadSignature { index, reason } => {
                write!(f, "certificate {} signature check failed: {}", index, reason)
            }
            CertificateError::NotCertificateAuthority { index } => {
                write!(f, "certificate {} is used as an issuer but is not a CA", index)
            }
            CertificateError::NameMismatch { expected } => {
                write!(f, "leaf certificate is not valid for '{}'", expected)
            }
            CertificateError::UnsupportedPublicKey => write!(f, "leaf certificate does not carry an RSA public key"),
            CertificateError::TrustStore(reason) => write!(f, "trust store unavailable: {}", reason),
        }
    }
}

impl std::error::Error for CertificateError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    Rsa(String),
    Prf(String),
    Aead,
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoError::Rsa(reason) => write!(f, "RSA encryption failed: {}", reason),
            CryptoError::Prf(reason) => write!(f, "PRF computation failed: {}", reason),
            CryptoError::Aead => write!(f, "AES-GCM record protection failed"),
        }
    }
}

impl std::error::Error for CryptoError {}

/// Step of the handshake at which a failure surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    TcpEstablishment,
    ClientHello,
    ServerFlight,
    CertificateValidation,
    KeyExchange,
    Finished,
    Teardown,
}

impl std::fmt::Display for HandshakePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HandshakePhase::TcpEstablishment => "TCP establishment",
            HandshakePhase::ClientHello => "ClientHello",
            HandshakePhase::ServerFlight => "server flight parsing",
            HandshakePhase::CertificateValidation => "certificate validation",
            HandshakePhase::KeyExchange => "key exchange",
            HandshakePhase::Finished => "Finished exchange",
            HandshakePhase::Teardown => "TCP teardown",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub enum ErrorKind {
    Transport(TransportError),
    Protocol(ProtocolViolation),
    Certificate(CertificateError),
    Crypto(CryptoError),
}

impl ErrorKind {
    fn class(&self) -> ErrorClass {
        match self {
            ErrorKind::Transport(_) => ErrorClass::TRANSPORT_IO,
            ErrorKind::Protocol(_) => ErrorClass::PROTOCOL_VIOLATION,
            ErrorKind::Certificate(_) => ErrorClass::CERTIFICATE_REJECTED,
            ErrorKind::Crypto(_) => ErrorClass::CRYPTO_FAILURE,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Transport(e) => write!(f, "transport error: {}", e),
            ErrorKind::Protocol(e) => write!(f, "protocol violation: {}", e),
            ErrorKind::Certificate(e) => write!(f, "certificate error: {}", e),
            ErrorKind::Crypto(e) => write!(f, "crypto error: {}", e),
        }
    }
}

impl From<TransportError> for ErrorKind {
    fn from(e: TransportError) -> Self {
        ErrorKind::Transport(e)
    }
}

impl From<ProtocolViolation> for ErrorKind {
    fn from(e: ProtocolViolation) -> Self {
        ErrorKind::Protocol(e)
    }
}

impl From<CertificateError> for ErrorKind {
    fn from(e: CertificateError) -> Self {
        ErrorKind::Certificate(e)
    }
}

impl From<CryptoError> for ErrorKind {
    fn from(e: CryptoError) -> Self {
        ErrorKind::Crypto(e)
    }
}

impl From<CodecError> for ErrorKind {
    fn from(e: CodecError) -> Self {
        ErrorKind::Protocol(ProtocolViolation::Malformed(e))
    }
}

/// Error returned to the caller of a handshake attempt.
#[derive(Debug)]
pub struct HandshakeError {
    pub phase: HandshakePhase,
    pub kind: ErrorKind,
}

impl HandshakeError {
    pub fn new(phase: HandshakePhase, kind: impl Into<ErrorKind>) -> Self {
        let kind = kind.into();
        observability::record_error(kind.class());
        Self { phase, kind }
    }
}

impl std::fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "handshake failed during {}: {}", self.phase, self.kind)
    }
}

impl std::error::Error for HandshakeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ErrorKind::Transport(e) => Some(e),
            ErrorKind::Protocol(e) => Some(e),
            ErrorKind::Certificate(e) => Some(e),
            ErrorKind::Crypto(e) => Some(e),
        }
    }
}

/// Tags a fallible step with the handshake phase it belongs to.
pub trait InPhase<T> {
    fn in_phase(self, phase: HandshakePhase) -> Result<T, HandshakeError>;
}

impl<T, E: Into<ErrorKind>> InPhase<T> for Result<T, E> {
    fn in_phase(self, phase: HandshakePhase) -> Result<T, HandshakeError> {
        self.map_err(|e| HandshakeError::new(phase, e))
    }
}
