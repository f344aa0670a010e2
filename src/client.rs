use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::codec::Framed;
use tokio_util::time::delay_queue::{self, DelayQueue};
use tracing::{debug, error, info, warn};

use crate::codec::FrameCodec;
use crate::error::{Error, Result};
use crate::frame::{status, Frame, Opcode};
use crate::transcoder::{self, Value};

/// Opaque ids live in [0, 2^30) and wrap back to zero.
const OPAQUE_MAX: u32 = 1 << 30;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Setting both username and password enables the SASL PLAIN handshake.
    pub username: Option<String>,
    pub password: Option<String>,
    /// Deadline for each request; also the heartbeat interval.
    pub response_timeout: Duration,
    /// Consecutive failed connection attempts before giving up for good.
    pub max_retries: u32,
    /// The Nth reconnect is scheduled after `N * backoff_unit`.
    pub backoff_unit: Duration,
    pub queue_policy: QueuePolicy,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> ClientConfig {
        ClientConfig {
            host: host.into(),
            port,
            username: None,
            password: None,
            response_timeout: Duration::from_millis(1000),
            max_retries: 9999,
            backoff_unit: Duration::from_secs(2),
            queue_policy: QueuePolicy::default(),
        }
    }
}

/// What to do with requests issued while the connection is not ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePolicy {
    /// Buffer up to `max_depth` requests in order and replay them once the
    /// connection becomes ready again; past the bound, fail with `QueueFull`.
    Queue { max_depth: usize },
    /// Fail immediately with `Unavailable`.
    Reject,
}

impl Default for QueuePolicy {
    fn default() -> QueuePolicy {
        QueuePolicy::Queue { max_depth: 128 }
    }
}

/// Connection lifecycle notifications.
///
/// `Ready` fires after every successful (re)connect and handshake. `Error`
/// fires on every transport error, including each failed reconnect attempt.
/// `Closed` fires exactly once, when the user closes the client or the retry
/// budget is exhausted.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Ready,
    Closed,
    Error(String),
}

/// Raw payload for a request.
#[derive(Debug, Clone)]
pub enum SendValue {
    /// Routed through the transcoder; only valid for set/add/replace, whose
    /// extras reserve a 4-byte flags slot.
    Typed(Value),
    /// Written to the wire verbatim (append/prepend, SASL blobs).
    Raw(Bytes),
}

#[derive(Debug, Clone, Default)]
pub struct SendArgs {
    pub key: Option<Bytes>,
    pub value: Option<SendValue>,
    pub extras: Option<Bytes>,
    pub cas: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub cas: u64,
    pub body: ReplyBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplyBody {
    /// Decoded stored value (get/gat).
    Value(Value),
    /// Counter state after increment/decrement.
    Counter(u64),
    /// Server version string.
    Text(String),
    /// Anything else: raw value bytes, possibly empty.
    Raw(Bytes),
}

impl Reply {
    pub fn into_value(self) -> Result<Value> {
        match self.body {
            ReplyBody::Value(value) => Ok(value),
            other => Err(Error::Transcode(format!("unexpected reply body: {:?}", other))),
        }
    }

    pub fn into_counter(self) -> Result<u64> {
        match self.body {
            ReplyBody::Counter(count) => Ok(count),
            other => Err(Error::Transcode(format!("unexpected reply body: {:?}", other))),
        }
    }

    pub fn into_text(self) -> Result<String> {
        match self.body {
            ReplyBody::Text(text) => Ok(text),
            other => Err(Error::Transcode(format!("unexpected reply body: {:?}", other))),
        }
    }
}

enum Op {
    Send {
        opcode: Opcode,
        args: SendArgs,
        reply: oneshot::Sender<Result<Reply>>,
    },
    Close,
}

/// Handle to one client instance. Cloning shares the same connection; all
/// socket and bookkeeping state lives in a driver task, so no locks are
/// involved.
#[derive(Clone)]
pub struct Client {
    ops: mpsc::UnboundedSender<Op>,
    events: broadcast::Sender<Event>,
}

impl Client {
    /// Spawns the driver task and returns immediately; the TCP connection is
    /// established (and retried) in the background. Subscribe to [`Event`]s
    /// to observe readiness.
    pub fn new(config: ClientConfig) -> Client {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(32);

        let driver = Driver {
            config,
            ops: ops_rx,
            events: events_tx.clone(),
            pending: HashMap::new(),
            timeouts: DelayQueue::new(),
            backlog: VecDeque::new(),
            opaque: 0,
        };
        tokio::spawn(driver.run());

        Client {
            ops: ops_tx,
            events: events_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Core send primitive: every verb goes through here. Returns once the
    /// matching response arrives, the response timeout fires, or the
    /// connection is torn down.
    pub async fn send(&self, opcode: Opcode, args: SendArgs) -> Result<Reply> {
        let (tx, rx) = oneshot::channel();
        self.ops
            .send(Op::Send {
                opcode,
                args,
                reply: tx,
            })
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Sends QUIT and shuts the client down; no reconnection follows.
    pub fn close(&self) {
        let _ = self.ops.send(Op::Close);
    }
}

struct Pending {
    reply: oneshot::Sender<Result<Reply>>,
    timeout: delay_queue::Key,
}

struct QueuedSend {
    opcode: Opcode,
    args: SendArgs,
    reply: oneshot::Sender<Result<Reply>>,
}

enum Exit {
    ClosedByUser,
    ConnectionLost(String),
}

struct Driver {
    config: ClientConfig,
    ops: mpsc::UnboundedReceiver<Op>,
    events: broadcast::Sender<Event>,
    pending: HashMap<u32, Pending>,
    timeouts: DelayQueue<u32>,
    backlog: VecDeque<QueuedSend>,
    opaque: u32,
}

impl Driver {
    async fn run(mut self) {
        let addr = (self.config.host.clone(), self.config.port);
        let mut retries: u32 = 0;
        let mut last_error = String::from("the connection was never established");

        loop {
            match TcpStream::connect(addr.clone()).await {
                Ok(stream) => {
                    let mut framed = Framed::new(stream, FrameCodec);
                    match self.handshake(&mut framed).await {
                        Ok(()) => {
                            retries = 0;
                            info!("client is ready");
                            let _ = self.events.send(Event::Ready);

                            match self.drive(&mut framed).await {
                                Exit::ClosedByUser => {
                                    info!("connection closed by user");
                                    self.fail_pending("client is closed");
                                    self.drain_backlog();
                                    let _ = self.events.send(Event::Closed);
                                    return;
                                }
                                Exit::ConnectionLost(err) => {
                                    warn!(error = %err, "connection lost");
                                    last_error = err;
                                    let _ = self.events.send(Event::Error(last_error.clone()));
                                    self.fail_pending(&last_error);
                                }
                            }
                        }
                        Err(err) => {
                            warn!(error = %err, "handshake failed");
                            last_error = err.to_string();
                            let _ = self.events.send(Event::Error(last_error.clone()));
                        }
                    }
                }
                Err(err) => {
                    last_error = err.to_string();
                    let _ = self.events.send(Event::Error(last_error.clone()));
                }
            }

            retries += 1;
            if retries > self.config.max_retries {
                error!(
                    "failed to reconnect for {} times, stop trying to reconnect",
                    retries - 1
                );
                self.fail_pending(&last_error);
                self.drain_backlog();
                let _ = self.events.send(Event::Error(last_error.clone()));
                let _ = self.events.send(Event::Closed);
                return;
            }

            let backoff = self.config.backoff_unit * retries;
            warn!(attempt = retries, ?backoff, "scheduling reconnect");
            if self.wait_backoff(backoff).await {
                self.drain_backlog();
                let _ = self.events.send(Event::Closed);
                return;
            }
        }
    }

    /// SASL PLAIN: list mechanisms, then send the "\0user\0pass" blob. Runs
    /// before the connection is declared ready, so the socket carries no
    /// other traffic yet.
    async fn handshake(&mut self, framed: &mut Framed<TcpStream, FrameCodec>) -> Result<()> {
        let (username, password) = match (&self.config.username, &self.config.password) {
            (Some(username), Some(password)) => (username.clone(), password.clone()),
            _ => return Ok(()),
        };

        let mechs = self
            .roundtrip(framed, Frame::request(Opcode::SaslListMechs))
            .await?;
        if mechs.status() != status::NO_ERROR {
            return Err(protocol_error(mechs.status()));
        }
        debug!(mechanisms = %String::from_utf8_lossy(&mechs.value), "sasl mechanisms");

        let mut auth = Frame::request(Opcode::SaslAuth);
        auth.key = Bytes::from_static(b"PLAIN");
        let mut blob = BytesMut::new();
        blob.put_u8(0);
        blob.extend_from_slice(username.as_bytes());
        blob.put_u8(0);
        blob.extend_from_slice(password.as_bytes());
        auth.value = blob.freeze();

        let response = self.roundtrip(framed, auth).await?;
        if response.status() != status::NO_ERROR {
            return Err(protocol_error(response.status()));
        }
        Ok(())
    }

    async fn roundtrip(
        &mut self,
        framed: &mut Framed<TcpStream, FrameCodec>,
        mut frame: Frame,
    ) -> Result<Frame> {
        frame.opaque = self.next_opaque();
        let opaque = frame.opaque;
        framed.send(frame).await?;

        let response = tokio::time::timeout(self.config.response_timeout, async {
            while let Some(result) = framed.next().await {
                let frame = result?;
                if frame.opaque == opaque {
                    return Ok(frame);
                }
                debug!(opaque = frame.opaque, "dropping unexpected handshake frame");
            }
            Err(Error::Connection(
                "connection closed by server".to_string(),
            ))
        })
        .await;

        match response {
            Ok(result) => result,
            Err(_) => Err(Error::ResponseTimeout),
        }
    }

    async fn drive(&mut self, framed: &mut Framed<TcpStream, FrameCodec>) -> Exit {
        // Replay requests queued while disconnected, in submission order.
        while let Some(queued) = self.backlog.pop_front() {
            if let Err(err) = self
                .dispatch(framed, queued.opcode, queued.args, queued.reply)
                .await
            {
                return Exit::ConnectionLost(err.to_string());
            }
        }

        let mut heartbeat = interval_at(
            Instant::now() + self.config.response_timeout,
            self.config.response_timeout,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                op = self.ops.recv() => match op {
                    // All client handles were dropped.
                    None => return Exit::ClosedByUser,
                    Some(Op::Close) => {
                        let mut quit = Frame::request(Opcode::Quit);
                        quit.opaque = self.next_opaque();
                        let _ = framed.send(quit).await;
                        return Exit::ClosedByUser;
                    }
                    Some(Op::Send { opcode, args, reply }) => {
                        if let Err(err) = self.dispatch(framed, opcode, args, reply).await {
                            return Exit::ConnectionLost(err.to_string());
                        }
                    }
                },
                frame = framed.next() => match frame {
                    Some(Ok(frame)) => self.handle_frame(frame),
                    Some(Err(err)) => return Exit::ConnectionLost(err.to_string()),
                    None => return Exit::ConnectionLost("connection closed by server".to_string()),
                },
                Some(expired) = futures::future::poll_fn(|cx| self.timeouts.poll_expired(cx)) => {
                    let opaque = expired.into_inner();
                    if let Some(pending) = self.pending.remove(&opaque) {
                        debug!(opaque, "response timeout");
                        let _ = pending.reply.send(Err(Error::ResponseTimeout));
                    }
                },
                _ = heartbeat.tick() => {
                    // No pending entry: the reply (or its absence) is the probe.
                    let mut noop = Frame::request(Opcode::Noop);
                    noop.opaque = self.next_opaque();
                    if let Err(err) = framed.send(noop).await {
                        return Exit::ConnectionLost(err.to_string());
                    }
                }
            }
        }
    }

    /// Writes one request. Per-request failures (validation, transcoding) are
    /// delivered to the caller's reply channel; only socket write failures
    /// bubble up as `Err`, tearing the connection down.
    async fn dispatch(
        &mut self,
        framed: &mut Framed<TcpStream, FrameCodec>,
        opcode: Opcode,
        args: SendArgs,
        reply: oneshot::Sender<Result<Reply>>,
    ) -> Result<()> {
        let frame = match self.build_frame(opcode, args) {
            Ok(frame) => frame,
            Err(err) => {
                let _ = reply.send(Err(err));
                return Ok(());
            }
        };

        let opaque = frame.opaque;
        let timeout = self.timeouts.insert(opaque, self.config.response_timeout);
        self.pending.insert(opaque, Pending { reply, timeout });

        if let Err(err) = framed.send(frame).await {
            let message = err.to_string();
            if let Some(pending) = self.pending.remove(&opaque) {
                self.timeouts.remove(&pending.timeout);
                let _ = pending.reply.send(Err(Error::Connection(message.clone())));
            }
            return Err(Error::Connection(message));
        }
        Ok(())
    }

    fn build_frame(&mut self, opcode: Opcode, args: SendArgs) -> Result<Frame> {
        if let Some(key) = &args.key {
            if key.is_empty() {
                return Err(Error::InvalidArgument(
                    "key must be a non-empty string or buffer".to_string(),
                ));
            }
        }

        let mut frame = Frame::request(opcode);
        frame.opaque = self.next_opaque();
        if let Some(key) = args.key {
            frame.key = key;
        }
        if let Some(extras) = args.extras {
            frame.extras = extras;
        }
        if let Some(cas) = args.cas {
            frame.set_cas_u64(cas);
        }

        match args.value {
            Some(SendValue::Typed(value)) => {
                if !opcode.is_storage() {
                    return Err(Error::InvalidArgument(
                        "typed values are only valid for set/add/replace".to_string(),
                    ));
                }
                if frame.extras.len() < 4 {
                    return Err(Error::InvalidArgument(
                        "storage extras must reserve 4 bytes for flags".to_string(),
                    ));
                }
                let (flags, bytes) = transcoder::encode(&value)?;
                let mut extras = BytesMut::from(&frame.extras[..]);
                extras[0..4].copy_from_slice(&u32::from(flags).to_be_bytes());
                frame.extras = extras.freeze();
                frame.value = bytes;
            }
            Some(SendValue::Raw(bytes)) => frame.value = bytes,
            None => {}
        }

        Ok(frame)
    }

    fn handle_frame(&mut self, frame: Frame) {
        let opaque = frame.opaque;
        let Some(pending) = self.pending.remove(&opaque) else {
            // Late response after its entry timed out, or a heartbeat noop.
            debug!(opaque, opcode = ?frame.opcode, "no pending request for response, dropping");
            return;
        };
        self.timeouts.remove(&pending.timeout);
        let _ = pending.reply.send(decode_response(frame));
    }

    /// Sleeps out the backoff while still answering incoming operations per
    /// the queue policy. Returns true when the user closed the client.
    async fn wait_backoff(&mut self, backoff: Duration) -> bool {
        let sleep = sleep(backoff);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return false,
                op = self.ops.recv() => match op {
                    None | Some(Op::Close) => return true,
                    Some(Op::Send { opcode, args, reply }) => {
                        self.enqueue(opcode, args, reply);
                    }
                }
            }
        }
    }

    fn enqueue(
        &mut self,
        opcode: Opcode,
        args: SendArgs,
        reply: oneshot::Sender<Result<Reply>>,
    ) {
        match self.config.queue_policy {
            QueuePolicy::Reject => {
                let _ = reply.send(Err(Error::Unavailable));
            }
            QueuePolicy::Queue { max_depth } => {
                if self.backlog.len() >= max_depth {
                    let _ = reply.send(Err(Error::QueueFull));
                } else {
                    self.backlog.push_back(QueuedSend {
                        opcode,
                        args,
                        reply,
                    });
                }
            }
        }
    }

    /// Fails every in-flight request; entries are removed exactly once, so a
    /// response arriving later finds nothing and is dropped.
    fn fail_pending(&mut self, reason: &str) {
        self.timeouts.clear();
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(Error::Connection(reason.to_string())));
        }
    }

    fn drain_backlog(&mut self) {
        for queued in self.backlog.drain(..) {
            let _ = queued.reply.send(Err(Error::Closed));
        }
    }

    fn next_opaque(&mut self) -> u32 {
        let opaque = self.opaque;
        self.opaque += 1;
        if self.opaque >= OPAQUE_MAX {
            self.opaque = 0;
        }
        opaque
    }
}

fn protocol_error(status_code: u16) -> Error {
    Error::Protocol {
        status: status_code,
        message: status::message(status_code).to_string(),
    }
}

fn decode_response(frame: Frame) -> Result<Reply> {
    let status_code = frame.status();
    if status_code != status::NO_ERROR {
        return Err(protocol_error(status_code));
    }

    let cas = frame.cas_u64();
    let body = match frame.opcode {
        Opcode::Get | Opcode::Gat => {
            if frame.extras.len() < 4 {
                return Err(Error::Transcode(
                    "get response is missing its flags extras".to_string(),
                ));
            }
            let flags = u32::from_be_bytes(frame.extras[0..4].try_into().unwrap());
            let flags = u16::try_from(flags).map_err(|_| Error::UnknownFlags(flags))?;
            ReplyBody::Value(transcoder::decode(flags, frame.value)?)
        }
        Opcode::Increment | Opcode::Decrement => {
            if frame.value.len() != 8 {
                return Err(Error::Transcode(
                    "counter response must be 8 bytes".to_string(),
                ));
            }
            let mut buf = &frame.value[..];
            ReplyBody::Counter(buf.get_u64())
        }
        Opcode::Version => ReplyBody::Text(String::from_utf8_lossy(&frame.value).into_owned()),
        _ => ReplyBody::Raw(frame.value),
    };

    Ok(Reply { cas, body })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::RESPONSE_MAGIC;

    fn response(opcode: Opcode, status_code: u16) -> Frame {
        let mut frame = Frame::request(opcode);
        frame.magic = RESPONSE_MAGIC;
        frame.vbucket_or_status = status_code;
        frame
    }

    #[test]
    fn decode_error_status_carries_code() {
        let frame = response(Opcode::Get, status::KEY_NOT_FOUND);

        let err = decode_response(frame).unwrap_err();

        assert!(matches!(err, Error::Protocol { status: 0x0001, .. }));
    }

    #[test]
    fn decode_get_response_value() {
        let (flags, bytes) = transcoder::encode(&Value::String("v".to_string())).unwrap();
        let mut frame = response(Opcode::Get, status::NO_ERROR);
        frame.extras = Bytes::from(u32::from(flags).to_be_bytes().to_vec());
        frame.value = bytes;

        let reply = decode_response(frame).unwrap();

        assert_eq!(reply.body, ReplyBody::Value(Value::String("v".to_string())));
    }

    #[test]
    fn decode_counter_response() {
        let mut frame = response(Opcode::Increment, status::NO_ERROR);
        frame.value = Bytes::from(11u64.to_be_bytes().to_vec());

        let reply = decode_response(frame).unwrap();

        assert_eq!(reply.body, ReplyBody::Counter(11));
    }

    #[test]
    fn decode_version_response() {
        let mut frame = response(Opcode::Version, status::NO_ERROR);
        frame.value = Bytes::from_static(b"1.6.2");

        let reply = decode_response(frame).unwrap();

        assert_eq!(reply.body, ReplyBody::Text("1.6.2".to_string()));
    }

    #[test]
    fn decode_raw_response() {
        let frame = response(Opcode::Set, status::NO_ERROR);

        let reply = decode_response(frame).unwrap();

        assert_eq!(reply.body, ReplyBody::Raw(Bytes::new()));
    }

    #[test]
    fn opaque_wraps_at_two_pow_thirty() {
        let (events, _) = broadcast::channel(1);
        let (_ops_tx, ops_rx) = mpsc::unbounded_channel();
        let mut driver = Driver {
            config: ClientConfig::new("localhost", 11211),
            ops: ops_rx,
            events,
            pending: HashMap::new(),
            timeouts: DelayQueue::new(),
            backlog: VecDeque::new(),
            opaque: OPAQUE_MAX - 1,
        };

        assert_eq!(driver.next_opaque(), OPAQUE_MAX - 1);
        assert_eq!(driver.next_opaque(), 0);
        assert_eq!(driver.next_opaque(), 1);
    }
}
