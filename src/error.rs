use thiserror::Error as ThisError;

use crate::frame;

pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for client operations.
#[derive(Debug, ThisError)]
pub enum Error {
    /// The server answered the request with a non-zero status code.
    #[error("the server returned an error: {message} (status 0x{status:04x})")]
    Protocol { status: u16, message: String },

    /// No response matched the request's opaque id within the deadline.
    #[error("response timeout")]
    ResponseTimeout,

    /// A request was attempted while disconnected and the queue policy rejects.
    #[error("the server is not available")]
    Unavailable,

    /// The bounded send queue overflowed while disconnected.
    #[error("send queue is full")]
    QueueFull,

    /// The connection dropped while the request was in flight, or the socket
    /// could not be established. Carries the last observed transport error.
    #[error("connection error: {0}")]
    Connection(String),

    /// The client was closed (explicitly or after exhausting reconnects).
    #[error("client is closed")]
    Closed,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The stored value's flags carry a type tag we cannot decode.
    #[error("cannot decode value with flags 0x{0:x}")]
    UnknownFlags(u32),

    /// The transcoder could not encode or decode a value.
    #[error("transcoder error: {0}")]
    Transcode(String),

    #[error("frame error: {0}")]
    Frame(#[from] frame::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
