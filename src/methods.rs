//! High-level verbs, each a thin shaping layer over [`Client::send`]: build
//! the opcode-specific extras, hand the fields to the connection driver.

use bytes::{BufMut, Bytes, BytesMut};

use crate::client::{Client, SendArgs, SendValue};
use crate::error::Result;
use crate::frame::Opcode;
use crate::transcoder::Value;

/// Options for increment/decrement. `initial` seeds the counter when the key
/// does not exist yet.
#[derive(Debug, Clone, Copy)]
pub struct CounterOptions {
    pub step: u64,
    pub initial: u64,
    pub expiry: u32,
}

impl Default for CounterOptions {
    fn default() -> CounterOptions {
        CounterOptions {
            step: 1,
            initial: 1,
            expiry: 0,
        }
    }
}

impl From<u64> for CounterOptions {
    fn from(step: u64) -> CounterOptions {
        CounterOptions {
            step,
            ..CounterOptions::default()
        }
    }
}

impl Client {
    pub async fn get(&self, key: impl AsRef<[u8]>) -> Result<Value> {
        self.send(Opcode::Get, key_only(key)).await?.into_value()
    }

    /// Like [`Client::get`], additionally returning the item's cas token.
    pub async fn get_with_cas(&self, key: impl AsRef<[u8]>) -> Result<(Value, u64)> {
        let reply = self.send(Opcode::Get, key_only(key)).await?;
        let cas = reply.cas;
        Ok((reply.into_value()?, cas))
    }

    pub async fn set(
        &self,
        key: impl AsRef<[u8]>,
        value: impl Into<Value>,
        expiry: u32,
    ) -> Result<()> {
        self.store(Opcode::Set, key, value.into(), expiry).await
    }

    /// Stores only when the key does not exist; otherwise the server answers
    /// with status 0x0002 (key exists).
    pub async fn add(
        &self,
        key: impl AsRef<[u8]>,
        value: impl Into<Value>,
        expiry: u32,
    ) -> Result<()> {
        self.store(Opcode::Add, key, value.into(), expiry).await
    }

    /// Stores only when the key already exists.
    pub async fn replace(
        &self,
        key: impl AsRef<[u8]>,
        value: impl Into<Value>,
        expiry: u32,
    ) -> Result<()> {
        self.store(Opcode::Replace, key, value.into(), expiry).await
    }

    async fn store(
        &self,
        opcode: Opcode,
        key: impl AsRef<[u8]>,
        value: Value,
        expiry: u32,
    ) -> Result<()> {
        let args = SendArgs {
            key: Some(key_bytes(key)),
            value: Some(SendValue::Typed(value)),
            extras: Some(flags_exp(expiry)),
            cas: None,
        };
        self.send(opcode, args).await.map(|_| ())
    }

    pub async fn delete(&self, key: impl AsRef<[u8]>) -> Result<()> {
        self.send(Opcode::Delete, key_only(key)).await.map(|_| ())
    }

    pub async fn increment(
        &self,
        key: impl AsRef<[u8]>,
        options: impl Into<CounterOptions>,
    ) -> Result<u64> {
        self.counter(Opcode::Increment, key, options.into()).await
    }

    pub async fn decrement(
        &self,
        key: impl AsRef<[u8]>,
        options: impl Into<CounterOptions>,
    ) -> Result<u64> {
        self.counter(Opcode::Decrement, key, options.into()).await
    }

    async fn counter(
        &self,
        opcode: Opcode,
        key: impl AsRef<[u8]>,
        options: CounterOptions,
    ) -> Result<u64> {
        let args = SendArgs {
            key: Some(key_bytes(key)),
            extras: Some(xcre(options.step, options.initial, options.expiry)),
            ..SendArgs::default()
        };
        self.send(opcode, args).await?.into_counter()
    }

    pub async fn append(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        self.concat(Opcode::Append, key, value).await
    }

    pub async fn prepend(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        self.concat(Opcode::Prepend, key, value).await
    }

    async fn concat(
        &self,
        opcode: Opcode,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
    ) -> Result<()> {
        let args = SendArgs {
            key: Some(key_bytes(key)),
            value: Some(SendValue::Raw(Bytes::copy_from_slice(value.as_ref()))),
            ..SendArgs::default()
        };
        self.send(opcode, args).await.map(|_| ())
    }

    pub async fn touch(&self, key: impl AsRef<[u8]>, expiry: u32) -> Result<()> {
        let args = SendArgs {
            key: Some(key_bytes(key)),
            extras: Some(exp(expiry)),
            ..SendArgs::default()
        };
        self.send(Opcode::Touch, args).await.map(|_| ())
    }

    /// Get-and-touch: fetches the value and refreshes its expiry in one trip.
    pub async fn gat(&self, key: impl AsRef<[u8]>, expiry: u32) -> Result<Value> {
        let args = SendArgs {
            key: Some(key_bytes(key)),
            extras: Some(exp(expiry)),
            ..SendArgs::default()
        };
        self.send(Opcode::Gat, args).await?.into_value()
    }

    // After flush the server may briefly keep answering from flushed state;
    // callers issuing an immediate follow-up store should expect that.
    pub async fn flush(&self, expiry: u32) -> Result<()> {
        let args = SendArgs {
            extras: Some(exp(expiry)),
            ..SendArgs::default()
        };
        self.send(Opcode::Flush, args).await.map(|_| ())
    }

    pub async fn version(&self) -> Result<String> {
        self.send(Opcode::Version, SendArgs::default())
            .await?
            .into_text()
    }

    pub async fn noop(&self) -> Result<()> {
        self.send(Opcode::Noop, SendArgs::default()).await.map(|_| ())
    }
}

fn key_bytes(key: impl AsRef<[u8]>) -> Bytes {
    Bytes::copy_from_slice(key.as_ref())
}

fn key_only(key: impl AsRef<[u8]>) -> SendArgs {
    SendArgs {
        key: Some(key_bytes(key)),
        ..SendArgs::default()
    }
}

/// 4-byte extras: expiry only (flush/touch/gat).
fn exp(expiry: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u32(expiry);
    buf.freeze()
}

/// 8-byte extras for set/add/replace: a 4-byte flags slot (filled in by the
/// driver from the transcoder's output) followed by the expiry.
fn flags_exp(expiry: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u32(0);
    buf.put_u32(expiry);
    buf.freeze()
}

/// 20-byte extras for increment/decrement: step, initial value, expiry.
fn xcre(step: u64, initial: u64, expiry: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(20);
    buf.put_u64(step);
    buf.put_u64(initial);
    buf.put_u32(expiry);
    buf.freeze()
}
