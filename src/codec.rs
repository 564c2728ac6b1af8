//! Big-endian wire primitives shared by the IPv4, TCP and TLS layers.
//!
//! Messages are serialized through [`Writer`] one named field at a time, in the
//! order the wire format declares them. Nothing here flattens a struct by its
//! memory layout; every width is stated at the call site.

/// Failure to encode or decode a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    MalformedInput {
        field: &'static str,
        needed: usize,
        available: usize,
    },
    FieldTooLong {
        field: &'static str,
        length: usize,
        max: usize,
    },
    TrailingBytes {
        field: &'static str,
        count: usize,
    },
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::MalformedInput { field, needed, available } => write!(
                f,
                "malformed input in `{}`: needed {} bytes, {} available",
                field, needed, available
            ),
            CodecError::FieldTooLong { field, length, max } => {
                write!(f, "field `{}` is {} bytes, limit is {}", field, length, max)
            }
            CodecError::TrailingBytes { field, count } => {
                write!(f, "{} unexpected trailing bytes after `{}`", count, field)
            }
        }
    }
}

impl std::error::Error for CodecError {}

/// Width of a length prefix in front of a variable-size field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthPrefix {
    U8,
    U16,
    U24,
}

impl LengthPrefix {
    pub fn width(self) -> usize {
        match self {
            LengthPrefix::U8 => 1,
            LengthPrefix::U16 => 2,
            LengthPrefix::U24 => 3,
        }
    }

    pub fn max(self) -> usize {
        match self {
            LengthPrefix::U8 => 0xff,
            LengthPrefix::U16 => 0xffff,
            LengthPrefix::U24 => 0xff_ffff,
        }
    }
}

/// Declared shape of a byte field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Fixed(usize),
    Prefixed(LengthPrefix),
}

pub fn encode_u16(value: u16) -> [u8; 2] {
    value.to_be_bytes()
}

pub fn encode_u24(value: u32) -> Result<[u8; 3], CodecError> {
    if value > 0xff_ffff {
        return Err(CodecError::FieldTooLong {
            field: "u24",
            length: value as usize,
            max: LengthPrefix::U24.max(),
        });
    }
    let b = value.to_be_bytes();
    Ok([b[1], b[2], b[3]])
}

pub fn decode_u24(bytes: &[u8]) -> Result<u32, CodecError> {
    let b = read_at(bytes, 0, 3)?;
    Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
}

/// Borrow `len` bytes at `offset`, failing instead of reading past the end.
pub fn read_at(buf: &[u8], offset: usize, len: usize) -> Result<&[u8], CodecError> {
    let end = offset.checked_add(len).ok_or(CodecError::MalformedInput {
        field: "offset",
        needed: usize::MAX,
        available: buf.len(),
    })?;
    buf.get(offset..end).ok_or(CodecError::MalformedInput {
        field: "offset",
        needed: end,
        available: buf.len(),
    })
}

#[derive(Debug, Default, Clone)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&encode_u16(value));
    }

    pub fn put_u24(&mut self, field: &'static str, value: u32) -> Result<(), CodecError> {
        let bytes = encode_u24(value).map_err(|_| CodecError::FieldTooLong {
            field,
            length: value as usize,
            max: LengthPrefix::U24.max(),
        })?;
        self.buf.extend_from_slice(&bytes);
        Ok(())
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Append a named field, checking it against its declared width.
    pub fn field(&mut self, name: &'static str, width: Width, bytes: &[u8]) -> Result<(), CodecError> {
        match width {
            Width::Fixed(n) if bytes.len() != n => Err(CodecError::MalformedInput {
                field: name,
                needed: n,
                available: bytes.len(),
            }),
            Width::Fixed(_) => {
                self.buf.extend_from_slice(bytes);
                Ok(())
            }
            Width::Prefixed(prefix) => {
                self.put_length(name, prefix, bytes.len())?;
                self.buf.extend_from_slice(bytes);
                Ok(())
            }
        }
    }

    /// Write a length-prefixed block whose length is known only after `body`
    /// has written it. The prefix is back-patched.
    pub fn nested<F>(&mut self, name: &'static str, prefix: LengthPrefix, body: F) -> Result<(), CodecError>
    where
        F: FnOnce(&mut Writer) -> Result<(), CodecError>,
    {
        let start = self.buf.len();
        self.buf.resize(start + prefix.width(), 0);
        body(self)?;
        let length = self.buf.len() - start - prefix.width();
        if length > prefix.max() {
            return Err(CodecError::FieldTooLong {
                field: name,
                length,
                max: prefix.max(),
            });
        }
        let be = (length as u32).to_be_bytes();
        let patch = &be[4 - prefix.width()..];
        self.buf[start..start + prefix.width()].copy_from_slice(patch);
        Ok(())
    }

    fn put_length(&mut self, name: &'static str, prefix: LengthPrefix, length: usize) -> Result<(), CodecError> {
        if length > prefix.max() {
            return Err(CodecError::FieldTooLong {
                field: name,
                length,
                max: prefix.max(),
            });
        }
        match prefix {
            LengthPrefix::U8 => self.put_u8(length as u8),
            LengthPrefix::U16 => self.put_u16(length as u16),
            LengthPrefix::U24 => self.put_u24(name, length as u32)?,
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Bounds-checked cursor over untrusted input.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn bytes(&mut self, field: &'static str, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::MalformedInput {
                field,
                needed: n,
                available: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn array<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(field, N)?);
        Ok(out)
    }

    pub fn u8(&mut self, field: &'static str) -> Result<u8, CodecError> {
        Ok(self.bytes(field, 1)?[0])
    }

    pub fn u16(&mut self, field: &'static str) -> Result<u16, CodecError> {
        Ok(u16::from_be_bytes(self.array(field)?))
    }

    pub fn u24(&mut self, field: &'static str) -> Result<u32, CodecError> {
        decode_u24(self.bytes(field, 3)?)
    }

    pub fn u32(&mut self, field: &'static str) -> Result<u32, CodecError> {
        Ok(u32::from_be_bytes(self.array(field)?))
    }

    /// Read a length prefix and the bytes it announces.
    pub fn prefixed(&mut self, field: &'static str, prefix: LengthPrefix) -> Result<&'a [u8], CodecError> {
        let length = match prefix {
            LengthPrefix::U8 => self.u8(field)? as usize,
            LengthPrefix::U16 => self.u16(field)? as usize,
            LengthPrefix::U24 => self.u24(field)? as usize,
        };
        self.bytes(field, length)
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    pub fn expect_end(&self, field: &'static str) -> Result<(), CodecError> {
        match self.remaining() {
            0 => Ok(()),
            count => Err(CodecError::TrailingBytes { field, count }),
        }
    }
}
