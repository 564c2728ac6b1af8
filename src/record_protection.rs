//! AES-128-GCM record protection for TLS 1.2 (RFC 5288).
//!
//! GenericAEADCipher layout: 8-byte explicit nonce, ciphertext, 16-byte tag.
//! The nonce is the 4-byte fixed IV from the key block followed by the
//! explicit part, which is the record sequence number.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Nonce};
use rustls::{ContentType, ProtocolVersion};

use crate::errors::CryptoError;

pub const EXPLICIT_NONCE_LEN: usize = 8;
pub const TAG_LEN: usize = 16;
const FIXED_IV_LEN: usize = 4;

/// One direction of a GCM-protected connection with its own sequence counter.
pub struct GcmRecordCipher {
    cipher: Aes128Gcm,
    fixed_iv: [u8; FIXED_IV_LEN],
    sequence: u64,
}

impl GcmRecordCipher {
    pub fn new(key: &[u8], fixed_iv: &[u8]) -> Result<Self, CryptoError> {
        let cipher = Aes128Gcm::new_from_slice(key).map_err(|_| CryptoError::Aead)?;
        let fixed_iv: [u8; FIXED_IV_LEN] = fixed_iv.try_into().map_err(|_| CryptoError::Aead)?;
        Ok(Self {
            cipher,
            fixed_iv,
            sequence: 0,
        })
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    fn nonce(&self, explicit: &[u8; EXPLICIT_NONCE_LEN]) -> [u8; FIXED_IV_LEN + EXPLICIT_NONCE_LEN] {
        let mut nonce = [0u8; FIXED_IV_LEN + EXPLICIT_NONCE_LEN];
        nonce[..FIXED_IV_LEN].copy_from_slice(&self.fixed_iv);
        nonce[FIXED_IV_LEN..].copy_from_slice(explicit);
        nonce
    }

    /// seq_num || type || version || length
    fn additional_data(&self, content_type: ContentType, plaintext_len: usize) -> [u8; 13] {
        let mut aad = [0u8; 13];
        aad[..8].copy_from_slice(&self.sequence.to_be_bytes());
        aad[8] = content_type.get_u8();
        aad[9..11].copy_from_slice(&ProtocolVersion::TLSv1_2.get_u16().to_be_bytes());
        aad[11..].copy_from_slice(&(plaintext_len as u16).to_be_bytes());
        aad
    }

    /// Encrypt `plaintext` into a record fragment and advance the sequence.
    pub fn seal(&mut self, content_type: ContentType, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let explicit = self.sequence.to_be_bytes();
        let nonce = self.nonce(&explicit);
        let aad = self.additional_data(content_type, plaintext.len());
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad: &aad })
            .map_err(|_| CryptoError::Aead)?;

        let mut fragment = Vec::with_capacity(EXPLICIT_NONCE_LEN + sealed.len());
        fragment.extend_from_slice(&explicit);
        fragment.extend_from_slice(&sealed);
        self.sequence += 1;
        Ok(fragment)
    }

    /// Authenticate and decrypt a record fragment and advance the sequence.
    pub fn open(&mut self, content_type: ContentType, fragment: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if fragment.len() < EXPLICIT_NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Aead);
        }
        let (explicit, sealed) = fragment.split_at(EXPLICIT_NONCE_LEN);
        let explicit: [u8; EXPLICIT_NONCE_LEN] = explicit.try_into().map_err(|_| CryptoError::Aead)?;
        let nonce = self.nonce(&explicit);
        let aad = self.additional_data(content_type, sealed.len() - TAG_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), Payload { msg: sealed, aad: &aad })
            .map_err(|_| CryptoError::Aead)?;
        self.sequence += 1;
        Ok(plaintext)
    }
}
