//! TLS record layer framing (RFC 5246 §6.2.1).

use rustls::{ContentType, ProtocolVersion};

use crate::codec::{CodecError, LengthPrefix, Reader, Width, Writer};
use crate::errors::ProtocolViolation;

pub const RECORD_HEADER_LEN: usize = 5;

/// Upper bound on a TLSCiphertext fragment: 2^14 plus expansion allowance.
pub const MAX_RECORD_PAYLOAD: usize = (1 << 14) + 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub content_type: ContentType,
    pub version: ProtocolVersion,
    pub length: u16,
}

impl RecordHeader {
    /// TLS 1.2 envelope for a payload of `length` bytes.
    pub fn new(content_type: ContentType, length: usize) -> Result<Self, CodecError> {
        if length > MAX_RECORD_PAYLOAD {
            return Err(CodecError::FieldTooLong {
                field: "record_length",
                length,
                max: MAX_RECORD_PAYLOAD,
            });
        }
        Ok(Self {
            content_type,
            version: ProtocolVersion::TLSv1_2,
            length: length as u16,
        })
    }

    pub fn encode(&self) -> [u8; RECORD_HEADER_LEN] {
        let [v0, v1] = self.version.get_u16().to_be_bytes();
        let [l0, l1] = self.length.to_be_bytes();
        [self.content_type.get_u8(), v0, v1, l0, l1]
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolViolation> {
        let mut r = Reader::new(bytes);
        let content_type = ContentType::from(r.u8("record_content_type")?);
        let version = r.u16("record_version")?;
        let length = r.u16("record_length")?;

        if let ContentType::Unknown(t) = content_type {
            return Err(ProtocolViolation::UnexpectedContentType(t));
        }
        if version != ProtocolVersion::TLSv1_2.get_u16() {
            return Err(ProtocolViolation::UnsupportedVersion(version));
        }
        if length as usize > MAX_RECORD_PAYLOAD {
            return Err(ProtocolViolation::OversizedRecord { length: length as usize });
        }
        Ok(Self {
            content_type,
            version: ProtocolVersion::TLSv1_2,
            length,
        })
    }
}

/// Wrap `payload` in a record whose length field is computed from the payload.
pub fn frame_record(content_type: ContentType, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    RecordHeader::new(content_type, payload.len())?;
    let mut w = Writer::with_capacity(RECORD_HEADER_LEN + payload.len());
    w.put_u8(content_type.get_u8());
    w.put_u16(ProtocolVersion::TLSv1_2.get_u16());
    w.nested("record_payload", LengthPrefix::U16, |w| {
        w.field("record_fragment", Width::Fixed(payload.len()), payload)
    })?;
    Ok(w.into_bytes())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub content_type: ContentType,
    pub payload: Vec<u8>,
}

/// Decode exactly one record. The declared length must account for every
/// byte after the header.
pub fn parse_record(bytes: &[u8]) -> Result<Record, ProtocolViolation> {
    let header = RecordHeader::decode(bytes)?;
    let actual = bytes.len().saturating_sub(RECORD_HEADER_LEN);
    if actual != header.length as usize {
        return Err(ProtocolViolation::RecordLengthMismatch {
            declared: header.length as usize,
            actual,
        });
    }
    Ok(Record {
        content_type: header.content_type,
        payload: bytes[RECORD_HEADER_LEN..].to_vec(),
    })
}

/// Accumulates TCP payloads and yields whole records. A record may span
/// several segments and one segment may hold several records; the stream is
/// walked by declared lengths, so record marker bytes appearing inside
/// certificate DER are never mistaken for a boundary.
#[derive(Debug, Default)]
pub struct RecordReassembler {
    buffer: Vec<u8>,
}

impl RecordReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes held that do not yet form a complete record.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Next complete record, or `None` while the head record is incomplete.
    pub fn next_record(&mut self) -> Result<Option<Record>, ProtocolViolation> {
        if self.buffer.len() < RECORD_HEADER_LEN {
            return Ok(None);
        }
        let header = RecordHeader::decode(&self.buffer[..RECORD_HEADER_LEN])?;
        let end = RECORD_HEADER_LEN + header.length as usize;
        if self.buffer.len() < end {
            return Ok(None);
        }
        let payload = self.buffer[RECORD_HEADER_LEN..end].to_vec();
        self.buffer.drain(..end);
        Ok(Some(Record {
            content_type: header.content_type,
            payload,
        }))
    }

    /// The stream ended with a partial record buffered.
    pub fn truncation(&self) -> Option<ProtocolViolation> {
        if self.buffer.is_empty() {
            return None;
        }
        let declared = match RecordHeader::decode(&self.buffer) {
            Ok(header) => header.length as usize,
            Err(e) => return Some(e),
        };
        Some(ProtocolViolation::RecordLengthMismatch {
            declared,
            actual: self.buffer.len().saturating_sub(RECORD_HEADER_LEN),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_length_equals_payload_length() {
        for len in [0usize, 1, 255, 256, 4096, 1 << 14, MAX_RECORD_PAYLOAD] {
            let payload = vec![0xab; len];

            let record = frame_record(ContentType::Handshake, &payload).unwrap();

            assert_eq!(record.len(), RECORD_HEADER_LEN + len);
            assert_eq!(u16::from_be_bytes([record[3], record[4]]) as usize, len);
            assert_eq!(&record[..3], &[0x16, 0x03, 0x03]);
        }
    }

    #[test]
    fn test_oversized_payload_is_refused() {
        let payload = vec![0u8; MAX_RECORD_PAYLOAD + 1];
        assert!(matches!(
            frame_record(ContentType::ApplicationData, &payload),
            Err(CodecError::FieldTooLong { field: "record_length", .. })
        ));
    }

    #[test]
    fn test_change_cipher_spec_envelope() {
        let header = RecordHeader::new(ContentType::ChangeCipherSpec, 1).unwrap();
        assert_eq!(header.encode(), [0x14, 0x03, 0x03, 0x00, 0x01]);
    }

    #[test]
    fn test_declared_length_must_match_payload() {
        let mut record = frame_record(ContentType::Handshake, &[1, 2, 3, 4]).unwrap();
        record.pop();

        let err = parse_record(&record).unwrap_err();

        assert_eq!(err, ProtocolViolation::RecordLengthMismatch { declared: 4, actual: 3 });
    }

    #[test]
    fn test_reassembler_holds_partial_records() {
        // Arrange
        let mut stream = frame_record(ContentType::Handshake, b"first").unwrap();
        stream.extend(frame_record(ContentType::Alert, &[2, 40]).unwrap());
        let mut reassembler = RecordReassembler::new();

        // Act / Assert
        reassembler.push(&stream[..7]);
        assert_eq!(reassembler.next_record().unwrap(), None);
        reassembler.push(&stream[7..12]);
        let first = reassembler.next_record().unwrap().unwrap();
        assert_eq!(first.content_type, ContentType::Handshake);
        assert_eq!(first.payload, b"first");
        assert_eq!(reassembler.next_record().unwrap(), None);
        assert!(reassembler.truncation().is_some());
        reassembler.push(&stream[12..]);
        let second = reassembler.next_record().unwrap().unwrap();
        assert_eq!(second.content_type, ContentType::Alert);
        assert_eq!(reassembler.buffered(), 0);
        assert_eq!(reassembler.truncation(), None);
    }

    #[test]
    fn test_marker_bytes_inside_payload_do_not_split() {
        let payload = [0x16, 0x03, 0x03, 0x00, 0x02, 0xff, 0xff];
        let mut reassembler = RecordReassembler::new();
        reassembler.push(&frame_record(ContentType::Handshake, &payload).unwrap());

        let record = reassembler.next_record().unwrap().unwrap();

        assert_eq!(record.payload, payload);
        assert_eq!(reassembler.next_record().unwrap(), None);
    }

    #[test]
    fn test_declared_length_beyond_limit_is_rejected() {
        let mut reassembler = RecordReassembler::new();
        reassembler.push(&[0x17, 0x03, 0x03, 0xff, 0xff]);

        assert_eq!(
            reassembler.next_record().unwrap_err(),
            ProtocolViolation::OversizedRecord { length: 0xffff }
        );
    }

    #[test]
    fn test_wrong_version_is_rejected() {
        let mut reassembler = RecordReassembler::new();
        reassembler.push(&[0x16, 0x03, 0x01, 0x00, 0x00]);

        assert_eq!(
            reassembler.next_record().unwrap_err(),
            ProtocolViolation::UnsupportedVersion(0x0301)
        );
    }

    #[test]
    fn test_unknown_content_type_is_rejected() {
        assert_eq!(
            RecordHeader::decode(&[0x42, 0x03, 0x03, 0x00, 0x00]).unwrap_err(),
            ProtocolViolation::UnexpectedContentType(0x42)
        );
    }
}
