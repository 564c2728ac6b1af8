//! TLS 1.2 client handshake over a user-space TCP stack on a raw IPv4 socket.

pub mod logging;

pub mod certificate;
pub mod codec;
pub mod config;
pub mod core;
pub mod errors;
pub mod handshake;
pub mod key_schedule;
pub mod packet;
pub mod record;
pub mod record_protection;
pub mod session;
pub mod tcp_session;
pub mod transport;

pub use config::HandshakeConfig;
pub use errors::{HandshakeError, HandshakePhase};
pub use session::{HandshakeOutcome, HandshakeSession};
