//! Value <-> bytes codec for stored payloads.
//!
//! Every stored value travels with a 16-bit flags word: the low byte holds
//! general flags (serialized, compressed), the high byte a type tag. Numeric
//! encodings are big-endian with leading zero bytes stripped on the wire and
//! re-padded on decode. Payloads above [`COMPRESSION_THRESHOLD`] are gzipped,
//! but only kept compressed when that actually made them smaller.

use std::io::{Read, Write};

use bytes::{Buf, Bytes};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};

pub const COMPRESSION_THRESHOLD: usize = 16384;

// General flags (low byte).
pub const SERIALIZED: u16 = 1;
pub const COMPRESSED: u16 = 2;

// Type tags (high byte).
const SPECIAL_MASK: u16 = 0xff00;
const SPECIAL_STRING: u16 = 0;
const SPECIAL_BOOLEAN: u16 = 1 << 8;
const SPECIAL_INT: u16 = 2 << 8;
const SPECIAL_LONG: u16 = 3 << 8;
const SPECIAL_DATE: u16 = 4 << 8;
const SPECIAL_DOUBLE: u16 = 7 << 8;
const SPECIAL_BYTEARRAY: u16 = 8 << 8;

/// A typed value as stored in the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Boolean(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    /// Epoch milliseconds, stored with the `Long` byte layout.
    Date(i64),
    Bytes(Bytes),
    /// Pre-serialized payload for values outside the tagged set. The byte
    /// format is whatever serializer both ends of the cache agree on; see
    /// [`Value::from_serialize`] for the bincode default.
    Serialized(Bytes),
}

impl Value {
    /// Serializes an arbitrary value into the fallback representation using
    /// bincode. Callers with a different wire agreement can construct
    /// `Value::Serialized` from their own bytes instead.
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Value> {
        let bytes = bincode::serialize(value).map_err(|e| Error::Transcode(e.to_string()))?;
        Ok(Value::Serialized(Bytes::from(bytes)))
    }

    pub fn deserialize_into<T: DeserializeOwned>(&self) -> Result<T> {
        match self {
            Value::Serialized(bytes) => {
                bincode::deserialize(bytes).map_err(|e| Error::Transcode(e.to_string()))
            }
            other => Err(Error::Transcode(format!(
                "value is not in serialized form: {:?}",
                other
            ))),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Boolean(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Value {
        Value::Int(i)
    }
}

// An integer inside the signed 32-bit range is tagged INT, outside it LONG.
impl From<i64> for Value {
    fn from(i: i64) -> Value {
        match i32::try_from(i) {
            Ok(small) => Value::Int(small),
            Err(_) => Value::Long(i),
        }
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Value {
        Value::Double(f)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Value {
        Value::Bytes(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Value {
        Value::Bytes(Bytes::from(b))
    }
}

impl From<std::time::SystemTime> for Value {
    fn from(t: std::time::SystemTime) -> Value {
        let millis = t
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as i64);
        Value::Date(millis)
    }
}

/// Encodes a value into its flags word and wire bytes.
pub fn encode(value: &Value) -> Result<(u16, Bytes)> {
    let mut flags;
    let buf: Vec<u8> = match value {
        Value::String(s) => {
            flags = SPECIAL_STRING;
            s.as_bytes().to_vec()
        }
        Value::Boolean(b) => {
            flags = SPECIAL_BOOLEAN;
            vec![if *b { 1 } else { 0 }]
        }
        Value::Int(i) => {
            flags = SPECIAL_INT;
            pack(&i.to_be_bytes())
        }
        Value::Long(l) => {
            flags = SPECIAL_LONG;
            pack(&l.to_be_bytes())
        }
        Value::Double(d) => {
            flags = SPECIAL_DOUBLE;
            d.to_be_bytes().to_vec()
        }
        Value::Date(millis) => {
            flags = SPECIAL_DATE;
            pack(&millis.to_be_bytes())
        }
        Value::Bytes(b) => {
            flags = SPECIAL_BYTEARRAY;
            b.to_vec()
        }
        Value::Serialized(b) => {
            flags = SERIALIZED;
            b.to_vec()
        }
    };

    if buf.len() > COMPRESSION_THRESHOLD {
        let compressed = gzip(&buf)?;
        // Compression is not assumed to always shrink the payload.
        if compressed.len() < buf.len() {
            flags |= COMPRESSED;
            return Ok((flags, Bytes::from(compressed)));
        }
        debug!(
            original = buf.len(),
            compressed = compressed.len(),
            "compression increased the size, sending uncompressed"
        );
    }

    Ok((flags, Bytes::from(buf)))
}

/// Decodes wire bytes back into a value using their flags word.
pub fn decode(flags: u16, bytes: Bytes) -> Result<Value> {
    let bytes = if flags & COMPRESSED != 0 {
        Bytes::from(gunzip(&bytes)?)
    } else {
        bytes
    };

    if flags & SERIALIZED != 0 {
        return Ok(Value::Serialized(bytes));
    }

    match flags & SPECIAL_MASK {
        SPECIAL_STRING => {
            let s = String::from_utf8(bytes.to_vec())
                .map_err(|e| Error::Transcode(e.to_string()))?;
            Ok(Value::String(s))
        }
        SPECIAL_BOOLEAN => Ok(Value::Boolean(bytes.first() == Some(&1))),
        SPECIAL_INT => {
            let buf = unpack(&bytes, 4)?;
            Ok(Value::Int(i32::from_be_bytes(buf.try_into().unwrap())))
        }
        SPECIAL_LONG => {
            let buf = unpack(&bytes, 8)?;
            Ok(Value::Long(i64::from_be_bytes(buf.try_into().unwrap())))
        }
        SPECIAL_DATE => {
            let buf = unpack(&bytes, 8)?;
            Ok(Value::Date(i64::from_be_bytes(buf.try_into().unwrap())))
        }
        SPECIAL_DOUBLE => {
            if bytes.len() != 8 {
                return Err(Error::Transcode(format!(
                    "expected 8 bytes for a double, got {}",
                    bytes.len()
                )));
            }
            let mut buf = &bytes[..];
            Ok(Value::Double(f64::from_bits(buf.get_u64())))
        }
        SPECIAL_BYTEARRAY => Ok(Value::Bytes(bytes)),
        _ => Err(Error::UnknownFlags(flags as u32)),
    }
}

/// Strips leading zero bytes: `[0, 0, 1, 2]` becomes `[1, 2]`.
fn pack(buf: &[u8]) -> Vec<u8> {
    let zeros = buf.iter().take_while(|b| **b == 0).count();
    buf[zeros..].to_vec()
}

/// Re-pads to `len` bytes with leading zeros: `unpack([1, 2], 4)` gives
/// `[0, 0, 1, 2]`.
fn unpack(buf: &[u8], len: usize) -> Result<Vec<u8>> {
    if buf.len() > len {
        return Err(Error::Transcode(format!(
            "numeric payload is {} bytes, expected at most {}",
            buf.len(),
            len
        )));
    }
    let mut out = vec![0u8; len - buf.len()];
    out.extend_from_slice(buf);
    Ok(out)
}

fn gzip(buf: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(buf)
        .and_then(|_| encoder.finish())
        .map_err(|e| Error::Transcode(e.to_string()))
}

fn gunzip(buf: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(buf);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map(|_| out)
        .map_err(|e| Error::Transcode(e.to_string()))
}
