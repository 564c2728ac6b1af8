//! X.509 chain validation against a per-session trust snapshot.
//!
//! The chain is walked from the root-most entry to the leaf. Each entry must
//! either be a trust anchor itself or be signed by something already trusted;
//! once validated it joins the local trust set for the next, more leaf-ward,
//! step. The anchor snapshot is never modified.

use std::path::Path;

use rsa::pkcs8::DecodePublicKey;
use rsa::RsaPublicKey;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::pem::Pem;
use x509_parser::prelude::FromDer;
use x509_parser::time::ASN1Time;

use crate::errors::CertificateError;
use crate::handshake::CertificateChain;
use crate::logging::LogLevel;

/// Immutable set of DER-encoded root certificates.
#[derive(Debug, Clone, Default)]
pub struct TrustAnchors {
    roots: Vec<Vec<u8>>,
}

impl TrustAnchors {
    pub fn from_der(roots: Vec<Vec<u8>>) -> Self {
        Self { roots }
    }

    /// Snapshot of the operating system's root store.
    pub fn native() -> Result<Self, CertificateError> {
        let roots = rustls_native_certs::load_native_certs()
            .map_err(|e| CertificateError::TrustStore(e.to_string()))?
            .into_iter()
            .map(|cert| cert.0)
            .collect::<Vec<_>>();
        crate::log!(LogLevel::Debug, "Loaded {} native trust anchors", roots.len());
        Ok(Self { roots })
    }

    /// Every `CERTIFICATE` block of a PEM bundle.
    pub fn from_pem(pem: &[u8]) -> Result<Self, CertificateError> {
        let mut roots = Vec::new();
        for block in Pem::iter_from_buffer(pem) {
            let block = block.map_err(|e| CertificateError::TrustStore(e.to_string()))?;
            if block.label == "CERTIFICATE" {
                roots.push(block.contents);
            }
        }
        if roots.is_empty() {
            return Err(CertificateError::TrustStore("no CERTIFICATE blocks in PEM input".to_string()));
        }
        Ok(Self { roots })
    }

    pub fn from_pem_file(path: &Path) -> Result<Self, CertificateError> {
        let pem = std::fs::read(path)
            .map_err(|e| CertificateError::TrustStore(format!("{}: {}", path.display(), e)))?;
        Self::from_pem(&pem)
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    fn contains(&self, der: &[u8]) -> bool {
        self.roots.iter().any(|root| root.as_slice() == der)
    }
}

/// A chain that validated to a trust anchor.
#[derive(Debug, Clone)]
pub struct ValidatedChain {
    pub chain_len: usize,
    pub leaf_subject: String,
    /// DNS identity the leaf was checked against.
    pub identity: String,
    leaf_spki: Vec<u8>,
}

impl ValidatedChain {
    pub fn leaf_public_key_der(&self) -> &[u8] {
        &self.leaf_spki
    }

    pub fn rsa_public_key(&self) -> Result<RsaPublicKey, CertificateError> {
        RsaPublicKey::from_public_key_der(&self.leaf_spki).map_err(|_| CertificateError::UnsupportedPublicKey)
    }
}

fn parse_entry(index: usize, der: &[u8]) -> Result<X509Certificate<'_>, CertificateError> {
    match X509Certificate::from_der(der) {
        Ok((rest, cert)) if rest.is_empty() => Ok(cert),
        Ok((rest, _)) => Err(CertificateError::Parse {
            index,
            reason: format!("{} trailing bytes", rest.len()),
        }),
        Err(e) => Err(CertificateError::Parse {
            index,
            reason: e.to_string(),
        }),
    }
}

fn dns_names(cert: &X509Certificate<'_>) -> Vec<String> {
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        let names: Vec<String> = san
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(dns.to_string()),
                _ => None,
            })
            .collect();
        if !names.is_empty() {
            return names;
        }
    }
    cert.subject()
        .iter_common_name()
        .filter_map(|cn| cn.as_str().ok().map(str::to_string))
        .collect()
}

/// RFC 6125 matching with a single left-most wildcard label.
pub fn dns_name_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim_end_matches('.').to_ascii_lowercase();
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    match pattern.strip_prefix("*.") {
        Some(suffix) => match host.split_once('.') {
            Some((label, rest)) => !label.is_empty() && rest == suffix,
            None => false,
        },
        None => pattern == host,
    }
}

/// Validate `chain` (leaf first) against `anchors` at time `now`.
///
/// `expected_name` is the identity the leaf must carry; without one the
/// leaf's own first DNS name is used.
pub fn validate_chain(
    chain: &CertificateChain,
    anchors: &TrustAnchors,
    expected_name: Option<&str>,
    now: ASN1Time,
) -> Result<ValidatedChain, CertificateError> {
    if chain.is_empty() {
        return Err(CertificateError::EmptyChain);
    }
    let parsed = chain
        .entries
        .iter()
        .enumerate()
        .map(|(index, der)| parse_entry(index, der))
        .collect::<Result<Vec<_>, _>>()?;

    let mut trusted: Vec<X509Certificate<'_>> = anchors
        .roots
        .iter()
        .filter_map(|der| X509Certificate::from_der(der).ok().map(|(_, cert)| cert))
        .collect();

    for index in (0..parsed.len()).rev() {
        let cert = &parsed[index];
        if !cert.validity().is_valid_at(now) {
            return Err(CertificateError::NotYetValidOrExpired { index });
        }
        if index > 0 && !cert.is_ca() {
            return Err(CertificateError::NotCertificateAuthority { index });
        }

        if anchors.contains(&chain.entries[index]) {
            crate::log!(LogLevel::Debug, "Certificate {} is a trust anchor: {}", index, cert.subject());
        } else {
            verify_issued_by_trusted(index, cert, &trusted)?;
            crate::log!(LogLevel::Debug, "Certificate {} verified: {}", index, cert.subject());
        }
        trusted.push(cert.clone());
    }

    let leaf = &parsed[0];
    let names = dns_names(leaf);
    let identity = match expected_name {
        Some(name) => name.to_string(),
        None => names.first().cloned().ok_or_else(|| CertificateError::NameMismatch {
            expected: "<any DNS name>".to_string(),
        })?,
    };
    if !names.iter().any(|pattern| dns_name_matches(pattern, &identity)) {
        return Err(CertificateError::NameMismatch { expected: identity });
    }

    Ok(ValidatedChain {
        chain_len: parsed.len(),
        leaf_subject: leaf.subject().to_string(),
        identity,
        leaf_spki: leaf.public_key().raw.to_vec(),
    })
}

fn verify_issued_by_trusted(
    index: usize,
    cert: &X509Certificate<'_>,
    trusted: &[X509Certificate<'_>],
) -> Result<(), CertificateError> {
    let mut last_failure = None;
    for issuer in trusted.iter().filter(|t| t.subject().as_raw() == cert.issuer().as_raw()) {
        match cert.verify_signature(Some(issuer.public_key())) {
            Ok(()) => return Ok(()),
            Err(e) => last_failure = Some(e.to_string()),
        }
    }
    match last_failure {
        Some(reason) => Err(CertificateError::BadSignature { index, reason }),
        None => Err(CertificateError::UntrustedIssuer {
            index,
            issuer: cert.issuer().to_string(),
        }),
    }
}
