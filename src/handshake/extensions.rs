//! The fixed ClientHello extension block.
//!
//! Servers fingerprint and sometimes reject unusual extension sets, so the
//! block is emitted in the same order with the same contents on every
//! handshake. Each extension body is still encoded through the length-prefixed
//! writer; no length in here is a literal.

use rustls::{ProtocolVersion, SignatureScheme};

use crate::codec::{CodecError, LengthPrefix, Reader, Width, Writer};

pub const STATUS_REQUEST: u16 = 0x0005;
pub const SUPPORTED_GROUPS: u16 = 0x000a;
pub const EC_POINT_FORMATS: u16 = 0x000b;
pub const SIGNATURE_ALGORITHMS: u16 = 0x000d;
pub const SIGNED_CERTIFICATE_TIMESTAMP: u16 = 0x0012;
pub const SUPPORTED_VERSIONS: u16 = 0x002b;
pub const RENEGOTIATION_INFO: u16 = 0xff01;

pub const SECP256R1: u16 = 0x0017;
pub const SECP384R1: u16 = 0x0018;
pub const SECP521R1: u16 = 0x0019;

const STATUS_TYPE_OCSP: u8 = 1;
const POINT_FORMAT_UNCOMPRESSED: u8 = 0;

pub const NAMED_GROUPS: [u16; 3] = [SECP256R1, SECP384R1, SECP521R1];

pub const SIGNATURE_PREFERENCE: [SignatureScheme; 12] = [
    SignatureScheme::RSA_PSS_SHA256,
    SignatureScheme::ECDSA_NISTP256_SHA256,
    SignatureScheme::ED25519,
    SignatureScheme::RSA_PSS_SHA384,
    SignatureScheme::RSA_PSS_SHA512,
    SignatureScheme::RSA_PKCS1_SHA256,
    SignatureScheme::RSA_PKCS1_SHA384,
    SignatureScheme::RSA_PKCS1_SHA512,
    SignatureScheme::ECDSA_NISTP384_SHA384,
    SignatureScheme::ECDSA_NISTP521_SHA512,
    SignatureScheme::RSA_PKCS1_SHA1,
    SignatureScheme::ECDSA_SHA1_Legacy,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    pub extension_type: u16,
    pub data: Vec<u8>,
}

impl Extension {
    fn build<F>(extension_type: u16, body: F) -> Result<Self, CodecError>
    where
        F: FnOnce(&mut Writer) -> Result<(), CodecError>,
    {
        let mut w = Writer::new();
        body(&mut w)?;
        Ok(Self {
            extension_type,
            data: w.into_bytes(),
        })
    }
}

/// status_request, supported_groups, ec_point_formats, signature_algorithms,
/// renegotiation_info, signed_certificate_timestamp, supported_versions.
pub fn client_hello_extensions() -> Result<Vec<Extension>, CodecError> {
    Ok(vec![
        Extension::build(STATUS_REQUEST, |w| {
            w.put_u8(STATUS_TYPE_OCSP);
            w.field("responder_id_list", Width::Prefixed(LengthPrefix::U16), &[])?;
            w.field("request_extensions", Width::Prefixed(LengthPrefix::U16), &[])
        })?,
        Extension::build(SUPPORTED_GROUPS, |w| {
            w.nested("named_group_list", LengthPrefix::U16, |w| {
                NAMED_GROUPS.iter().for_each(|group| w.put_u16(*group));
                Ok(())
            })
        })?,
        Extension::build(EC_POINT_FORMATS, |w| {
            w.field("ec_point_format_list", Width::Prefixed(LengthPrefix::U8), &[POINT_FORMAT_UNCOMPRESSED])
        })?,
        Extension::build(SIGNATURE_ALGORITHMS, |w| {
            w.nested("supported_signature_algorithms", LengthPrefix::U16, |w| {
                SIGNATURE_PREFERENCE.iter().for_each(|scheme| w.put_u16(scheme.get_u16()));
                Ok(())
            })
        })?,
        Extension::build(RENEGOTIATION_INFO, |w| {
            w.field("renegotiated_connection", Width::Prefixed(LengthPrefix::U8), &[])
        })?,
        Extension::build(SIGNED_CERTIFICATE_TIMESTAMP, |_| Ok(()))?,
        Extension::build(SUPPORTED_VERSIONS, |w| {
            w.nested("supported_versions", LengthPrefix::U8, |w| {
                w.put_u16(ProtocolVersion::TLSv1_2.get_u16());
                Ok(())
            })
        })?,
    ])
}

pub fn encode_extensions(w: &mut Writer, extensions: &[Extension]) -> Result<(), CodecError> {
    w.nested("extensions", LengthPrefix::U16, |w| {
        for extension in extensions {
            w.put_u16(extension.extension_type);
            w.field("extension_data", Width::Prefixed(LengthPrefix::U16), &extension.data)?;
        }
        Ok(())
    })
}

/// Decode an optional extension block; an absent block is an empty list.
pub fn decode_extensions(r: &mut Reader<'_>) -> Result<Vec<Extension>, CodecError> {
    if r.is_empty() {
        return Ok(Vec::new());
    }
    let mut block = Reader::new(r.prefixed("extensions", LengthPrefix::U16)?);
    let mut extensions = Vec::new();
    while !block.is_empty() {
        let extension_type = block.u16("extension_type")?;
        let data = block.prefixed("extension_data", LengthPrefix::U16)?.to_vec();
        extensions.push(Extension { extension_type, data });
    }
    Ok(extensions)
}
