pub mod client;
pub mod codec;
pub mod error;
pub mod frame;
pub mod methods;
pub mod transcoder;

pub use client::{Client, ClientConfig, Event, QueuePolicy, Reply, ReplyBody, SendArgs, SendValue};
pub use error::{Error, Result};
pub use frame::{Frame, Opcode};
pub use methods::CounterOptions;
pub use transcoder::Value;
