use rand::{CryptoRng, RngCore};
use rsa::{Pkcs1v15Encrypt, RsaPublicKey};
use rustls::{ContentType, HandshakeType, ProtocolVersion};

use super::extensions::{client_hello_extensions, encode_extensions};
use super::{encode_handshake, ClientHello, RANDOM_LEN, VERIFY_DATA_LEN};
use crate::codec::{CodecError, LengthPrefix, Width, Writer};
use crate::errors::CryptoError;
use crate::key_schedule::PremasterSecret;
use crate::record::frame_record;

const SESSION_ID_LEN: usize = 32;
const COMPRESSION_NULL: u8 = 0;
const CHANGE_CIPHER_SPEC_MESSAGE: u8 = 1;

impl ClientHello {
    /// TLS 1.2 hello with a fresh random, a random 32-byte session id, null
    /// compression and the fixed extension block.
    pub fn new<R: RngCore + CryptoRng>(rng: &mut R, cipher_suites: &[u16]) -> Result<Self, CodecError> {
        let mut random = [0u8; RANDOM_LEN];
        rng.fill_bytes(&mut random);
        let mut session_id = vec![0u8; SESSION_ID_LEN];
        rng.fill_bytes(&mut session_id);
        Ok(Self {
            version: ProtocolVersion::TLSv1_2.get_u16(),
            random,
            session_id,
            cipher_suites: cipher_suites.to_vec(),
            compression_methods: vec![COMPRESSION_NULL],
            extensions: client_hello_extensions()?,
        })
    }

    /// Handshake message bytes, header included.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        encode_handshake(HandshakeType::ClientHello, |w| {
            w.put_u16(self.version);
            w.field("random", Width::Fixed(RANDOM_LEN), &self.random)?;
            w.field("session_id", Width::Prefixed(LengthPrefix::U8), &self.session_id)?;
            w.nested("cipher_suites", LengthPrefix::U16, |w| {
                self.cipher_suites.iter().for_each(|suite| w.put_u16(*suite));
                Ok(())
            })?;
            w.field(
                "compression_methods",
                Width::Prefixed(LengthPrefix::U8),
                &self.compression_methods,
            )?;
            encode_extensions(w, &self.extensions)
        })
    }
}

/// RSAES-PKCS1-v1_5 encryption of the premaster secret under the leaf key.
pub fn encrypt_premaster<R: RngCore + CryptoRng>(
    rng: &mut R,
    server_key: &RsaPublicKey,
    premaster: &PremasterSecret,
) -> Result<Vec<u8>, CryptoError> {
    server_key
        .encrypt(rng, Pkcs1v15Encrypt, premaster.as_bytes())
        .map_err(|e| CryptoError::Rsa(e.to_string()))
}

pub fn client_key_exchange(encrypted_premaster: &[u8]) -> Result<Vec<u8>, CodecError> {
    encode_handshake(HandshakeType::ClientKeyExchange, |w| {
        w.field(
            "encrypted_pre_master_secret",
            Width::Prefixed(LengthPrefix::U16),
            encrypted_premaster,
        )
    })
}

/// The single-byte ChangeCipherSpec message in its own record.
pub fn change_cipher_spec_record() -> Result<Vec<u8>, CodecError> {
    frame_record(ContentType::ChangeCipherSpec, &[CHANGE_CIPHER_SPEC_MESSAGE])
}

pub fn finished(verify_data: &[u8; VERIFY_DATA_LEN]) -> Result<Vec<u8>, CodecError> {
    encode_handshake(HandshakeType::Finished, |w| {
        w.field("verify_data", Width::Fixed(VERIFY_DATA_LEN), verify_data)
    })
}

/// Concatenate handshake messages into one Handshake record.
pub fn handshake_record(messages: &[&[u8]]) -> Result<Vec<u8>, CodecError> {
    let mut body = Writer::new();
    for message in messages {
        body.field("handshake_message", Width::Fixed(message.len()), message)?;
    }
    frame_record(ContentType::Handshake, body.as_slice())
}
