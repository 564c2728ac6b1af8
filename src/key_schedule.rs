//! TLS 1.2 key schedule (RFC 5246 §5, §6.3, §8.1).
//!
//! Every secret buffer here is zeroed when dropped.

use hmac::{Hmac, Mac};
use rand::{CryptoRng, RngCore};
use rustls::{CipherSuite, ProtocolVersion};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::errors::CryptoError;
use crate::handshake::{RANDOM_LEN, VERIFY_DATA_LEN};

type HmacSha256 = Hmac<Sha256>;

pub const PREMASTER_LEN: usize = 48;
pub const MASTER_SECRET_LEN: usize = 48;

const MASTER_SECRET_LABEL: &[u8] = b"master secret";
const KEY_EXPANSION_LABEL: &[u8] = b"key expansion";

/// P_SHA256 expansion of `secret` over `label || seed`, filling `out`.
pub fn prf(secret: &[u8], label: &[u8], seed: &[u8], out: &mut [u8]) -> Result<(), CryptoError> {
    let keyed = HmacSha256::new_from_slice(secret).map_err(|e| CryptoError::Prf(e.to_string()))?;

    let mut a = keyed.clone().chain_update(label).chain_update(seed).finalize().into_bytes();
    for chunk in out.chunks_mut(32) {
        let block = keyed
            .clone()
            .chain_update(&a)
            .chain_update(label)
            .chain_update(seed)
            .finalize()
            .into_bytes();
        chunk.copy_from_slice(&block[..chunk.len()]);
        a = keyed.clone().chain_update(&a).finalize().into_bytes();
    }
    Ok(())
}

pub struct PremasterSecret([u8; PREMASTER_LEN]);

impl PremasterSecret {
    /// Client version followed by 46 random bytes.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; PREMASTER_LEN];
        bytes[..2].copy_from_slice(&ProtocolVersion::TLSv1_2.get_u16().to_be_bytes());
        rng.fill_bytes(&mut bytes[2..]);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; PREMASTER_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PREMASTER_LEN] {
        &self.0
    }
}

impl Drop for PremasterSecret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

pub struct MasterSecret([u8; MASTER_SECRET_LEN]);

impl MasterSecret {
    pub fn derive(
        premaster: &PremasterSecret,
        client_random: &[u8; RANDOM_LEN],
        server_random: &[u8; RANDOM_LEN],
    ) -> Result<Self, CryptoError> {
        let seed = [client_random.as_slice(), server_random.as_slice()].concat();
        let mut out = [0u8; MASTER_SECRET_LEN];
        prf(premaster.as_bytes(), MASTER_SECRET_LABEL, &seed, &mut out)?;
        Ok(Self(out))
    }

    pub fn as_bytes(&self) -> &[u8; MASTER_SECRET_LEN] {
        &self.0
    }
}

impl Drop for MasterSecret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Key block sizes for one cipher suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherParams {
    pub mac_key_len: usize,
    pub enc_key_len: usize,
    pub fixed_iv_len: usize,
}

impl CipherParams {
    pub const AES_128_GCM_SHA256: CipherParams = CipherParams {
        mac_key_len: 0,
        enc_key_len: 16,
        fixed_iv_len: 4,
    };

    pub fn for_suite(suite: u16) -> Option<CipherParams> {
        match CipherSuite::from(suite) {
            CipherSuite::TLS_RSA_WITH_AES_128_GCM_SHA256 => Some(Self::AES_128_GCM_SHA256),
            _ => None,
        }
    }

    pub fn key_block_len(&self) -> usize {
        2 * (self.mac_key_len + self.enc_key_len + self.fixed_iv_len)
    }
}

/// The key block split into its six fields, in RFC 5246 order.
pub struct KeyBlock {
    pub client_write_mac_key: Vec<u8>,
    pub server_write_mac_key: Vec<u8>,
    pub client_write_key: Vec<u8>,
    pub server_write_key: Vec<u8>,
    pub client_write_iv: Vec<u8>,
    pub server_write_iv: Vec<u8>,
}

impl KeyBlock {
    pub fn derive(
        master: &MasterSecret,
        client_random: &[u8; RANDOM_LEN],
        server_random: &[u8; RANDOM_LEN],
        params: CipherParams,
    ) -> Result<Self, CryptoError> {
        let seed = [server_random.as_slice(), client_random.as_slice()].concat();
        let mut block = vec![0u8; params.key_block_len()];
        prf(master.as_bytes(), KEY_EXPANSION_LABEL, &seed, &mut block)?;

        let mut rest = block.as_slice();
        let mut take = |n: usize| {
            let (head, tail) = rest.split_at(n);
            rest = tail;
            head.to_vec()
        };
        let keys = Self {
            client_write_mac_key: take(params.mac_key_len),
            server_write_mac_key: take(params.mac_key_len),
            client_write_key: take(params.enc_key_len),
            server_write_key: take(params.enc_key_len),
            client_write_iv: take(params.fixed_iv_len),
            server_write_iv: take(params.fixed_iv_len),
        };
        block.zeroize();
        Ok(keys)
    }
}

impl Drop for KeyBlock {
    fn drop(&mut self) {
        self.client_write_mac_key.zeroize();
        self.server_write_mac_key.zeroize();
        self.client_write_key.zeroize();
        self.server_write_key.zeroize();
        self.client_write_iv.zeroize();
        self.server_write_iv.zeroize();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishedLabel {
    Client,
    Server,
}

impl FinishedLabel {
    fn label(self) -> &'static [u8] {
        match self {
            FinishedLabel::Client => b"client finished",
            FinishedLabel::Server => b"server finished",
        }
    }
}

/// `PRF(master_secret, finished_label, SHA-256(handshake_messages))[0..12]`.
pub fn verify_data(
    master: &MasterSecret,
    label: FinishedLabel,
    transcript: &[u8],
) -> Result<[u8; VERIFY_DATA_LEN], CryptoError> {
    let digest = Sha256::digest(transcript);
    let mut out = [0u8; VERIFY_DATA_LEN];
    prf(master.as_bytes(), label.label(), &digest, &mut out)?;
    Ok(out)
}

/// All secrets of one RSA handshake, held for the handshake's duration.
pub struct KeyMaterial {
    pub client_random: [u8; RANDOM_LEN],
    pub server_random: [u8; RANDOM_LEN],
    pub master_secret: MasterSecret,
    pub keys: KeyBlock,
}

impl KeyMaterial {
    pub fn derive(
        premaster: &PremasterSecret,
        client_random: [u8; RANDOM_LEN],
        server_random: [u8; RANDOM_LEN],
        params: CipherParams,
    ) -> Result<Self, CryptoError> {
        let master_secret = MasterSecret::derive(premaster, &client_random, &server_random)?;
        let keys = KeyBlock::derive(&master_secret, &client_random, &server_random, params)?;
        Ok(Self {
            client_random,
            server_random,
            master_secret,
            keys,
        })
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("client_random", &self.client_random)
            .field("server_random", &self.server_random)
            .field("master_secret", &"<redacted>")
            .field("keys", &"<redacted>")
            .finish()
    }
}
