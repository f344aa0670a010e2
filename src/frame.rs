// https://github.com/memcached/memcached/blob/master/doc/protocol-binary.txt

use std::io::Cursor;

use bytes::{Buf, BufMut, Bytes};
use thiserror::Error as ThisError;

/// Magic byte for request packets.
pub const REQUEST_MAGIC: u8 = 0x80;

/// Magic byte for response packets.
pub const RESPONSE_MAGIC: u8 = 0x81;

/// Fixed header size, requests and responses alike.
pub const HEADER_SIZE: usize = 24;

/// Width of the cas field.
pub const CAS_SIZE: usize = 8;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("not enough data is available to parse an entire frame")]
    Incomplete,
    #[error("invalid magic byte: 0x{0:02x}")]
    InvalidMagic(u8),
    #[error("invalid opcode: 0x{0:02x}")]
    InvalidOpcode(u8),
    /// The total body length is smaller than the extras and key it claims to
    /// contain.
    #[error("invalid total body length: {total} (extras {extras}, key {key})")]
    InvalidBodyLength { total: u32, extras: u8, key: u16 },
    /// A fixed-width buffer field was given with the wrong byte length.
    #[error("{field}'s byte length is not equal to {expected}")]
    FixedLengthMismatch { field: &'static str, expected: usize },
}

/// Binary protocol opcodes (the subset this client speaks).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Quit = 0x07,
    Flush = 0x08,
    Noop = 0x0a,
    Version = 0x0b,
    Append = 0x0e,
    Prepend = 0x0f,
    Touch = 0x1c,
    Gat = 0x1d,
    SaslListMechs = 0x20,
    SaslAuth = 0x21,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Opcode::Get),
            0x01 => Some(Opcode::Set),
            0x02 => Some(Opcode::Add),
            0x03 => Some(Opcode::Replace),
            0x04 => Some(Opcode::Delete),
            0x05 => Some(Opcode::Increment),
            0x06 => Some(Opcode::Decrement),
            0x07 => Some(Opcode::Quit),
            0x08 => Some(Opcode::Flush),
            0x0a => Some(Opcode::Noop),
            0x0b => Some(Opcode::Version),
            0x0e => Some(Opcode::Append),
            0x0f => Some(Opcode::Prepend),
            0x1c => Some(Opcode::Touch),
            0x1d => Some(Opcode::Gat),
            0x20 => Some(Opcode::SaslListMechs),
            0x21 => Some(Opcode::SaslAuth),
            _ => None,
        }
    }

    /// True for the mutation opcodes whose value goes through the transcoder.
    pub fn is_storage(&self) -> bool {
        matches!(self, Opcode::Set | Opcode::Add | Opcode::Replace)
    }
}

/// Response status codes.
pub mod status {
    pub const NO_ERROR: u16 = 0x0000;
    pub const KEY_NOT_FOUND: u16 = 0x0001;
    pub const KEY_EXISTS: u16 = 0x0002;
    pub const VALUE_TOO_LARGE: u16 = 0x0003;
    pub const INVALID_ARGUMENTS: u16 = 0x0004;
    pub const ITEM_NOT_STORED: u16 = 0x0005;
    pub const NON_NUMERIC_VALUE: u16 = 0x0006;
    pub const AUTH_ERROR: u16 = 0x0008;
    pub const UNKNOWN_COMMAND: u16 = 0x0081;
    pub const OUT_OF_MEMORY: u16 = 0x0082;
    pub const INTERNAL_ERROR: u16 = 0x0084;
    pub const BUSY: u16 = 0x0085;
    pub const TEMPORARY_FAILURE: u16 = 0x0086;

    pub fn message(code: u16) -> &'static str {
        match code {
            NO_ERROR => "No error",
            KEY_NOT_FOUND => "Key not found",
            KEY_EXISTS => "Key exists",
            VALUE_TOO_LARGE => "Value too large",
            INVALID_ARGUMENTS => "Invalid arguments",
            ITEM_NOT_STORED => "Item not stored",
            NON_NUMERIC_VALUE => "Incr/Decr on non-numeric value",
            AUTH_ERROR => "Authentication error",
            UNKNOWN_COMMAND => "Unknown command",
            OUT_OF_MEMORY => "Out of memory",
            INTERNAL_ERROR => "Internal error",
            BUSY => "Busy",
            TEMPORARY_FAILURE => "Temporary failure",
            _ => "Unknown status",
        }
    }
}

/// One binary protocol message, request or response.
///
/// The 24-byte header is followed by extras, key and value in that order.
/// The three length fields in the header are derived from the actual byte
/// lengths of those fields on encode; the u16 at offset 6 is the vbucket id
/// on requests and the status code on responses.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub magic: u8,
    pub opcode: Opcode,
    pub data_type: u8,
    /// Vbucket id (request) or status code (response).
    pub vbucket_or_status: u16,
    pub opaque: u32,
    /// Opaque to the client, passed through verbatim. Must be 8 bytes.
    pub cas: Bytes,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl Frame {
    pub fn request(opcode: Opcode) -> Frame {
        Frame {
            magic: REQUEST_MAGIC,
            opcode,
            data_type: 0,
            vbucket_or_status: 0,
            opaque: 0,
            cas: Bytes::from_static(&[0u8; CAS_SIZE]),
            extras: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::new(),
        }
    }

    pub fn is_response(&self) -> bool {
        self.magic == RESPONSE_MAGIC
    }

    /// Status code carried by a response frame.
    pub fn status(&self) -> u16 {
        self.vbucket_or_status
    }

    pub fn total_body_length(&self) -> u32 {
        (self.extras.len() + self.key.len() + self.value.len()) as u32
    }

    pub fn cas_u64(&self) -> u64 {
        let mut buf = &self.cas[..];
        buf.get_u64()
    }

    pub fn set_cas_u64(&mut self, cas: u64) {
        let mut buf = Vec::with_capacity(CAS_SIZE);
        buf.put_u64(cas);
        self.cas = Bytes::from(buf);
    }

    /// Attempts to parse a whole frame from `src`. Returns `Error::Incomplete`
    /// when not enough bytes are buffered yet; the caller is expected to retry
    /// once more data arrives. On success the cursor sits one past the frame.
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Frame, Error> {
        if src.remaining() < HEADER_SIZE {
            return Err(Error::Incomplete);
        }

        let magic = src.get_u8();
        if magic != REQUEST_MAGIC && magic != RESPONSE_MAGIC {
            return Err(Error::InvalidMagic(magic));
        }
        let opcode_byte = src.get_u8();
        let opcode = Opcode::from_u8(opcode_byte).ok_or(Error::InvalidOpcode(opcode_byte))?;
        let key_length = src.get_u16();
        let extras_length = src.get_u8();
        let data_type = src.get_u8();
        let vbucket_or_status = src.get_u16();
        let total_body_length = src.get_u32();
        let opaque = src.get_u32();

        let value_length = total_body_length
            .checked_sub(extras_length as u32 + key_length as u32)
            .ok_or(Error::InvalidBodyLength {
                total: total_body_length,
                extras: extras_length,
                key: key_length,
            })?;

        if src.remaining() < CAS_SIZE + total_body_length as usize {
            return Err(Error::Incomplete);
        }

        let cas = copy_bytes(src, CAS_SIZE);
        // Zero-length extras, key and value are all legitimate.
        let extras = copy_bytes(src, extras_length as usize);
        let key = copy_bytes(src, key_length as usize);
        let value = copy_bytes(src, value_length as usize);

        Ok(Frame {
            magic,
            opcode,
            data_type,
            vbucket_or_status,
            opaque,
            cas,
            extras,
            key,
            value,
        })
    }

    /// Serializes the frame, deriving the three length fields from the actual
    /// byte lengths of extras, key and value.
    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        if self.cas.len() != CAS_SIZE {
            return Err(Error::FixedLengthMismatch {
                field: "cas",
                expected: CAS_SIZE,
            });
        }

        let mut bytes = Vec::with_capacity(HEADER_SIZE + self.total_body_length() as usize);
        bytes.put_u8(self.magic);
        bytes.put_u8(self.opcode as u8);
        bytes.put_u16(self.key.len() as u16);
        bytes.put_u8(self.extras.len() as u8);
        bytes.put_u8(self.data_type);
        bytes.put_u16(self.vbucket_or_status);
        bytes.put_u32(self.total_body_length());
        bytes.put_u32(self.opaque);
        bytes.extend_from_slice(&self.cas);
        bytes.extend_from_slice(&self.extras);
        bytes.extend_from_slice(&self.key);
        bytes.extend_from_slice(&self.value);
        Ok(bytes)
    }
}

fn copy_bytes(src: &mut Cursor<&[u8]>, len: usize) -> Bytes {
    let start = src.position() as usize;
    let bytes = Bytes::copy_from_slice(&src.get_ref()[start..start + len]);
    src.advance(len);
    bytes
}
