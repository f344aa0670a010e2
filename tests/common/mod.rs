#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use rustmc::codec::FrameCodec;
use rustmc::frame::{status, Frame, Opcode, RESPONSE_MAGIC};
use rustmc::ClientConfig;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().try_init();
}

/// Client config with test-friendly timings.
pub fn test_config(addr: SocketAddr) -> ClientConfig {
    let mut config = ClientConfig::new(addr.ip().to_string(), addr.port());
    config.response_timeout = Duration::from_millis(500);
    config.backoff_unit = Duration::from_millis(100);
    config
}

pub struct ServerHandle {
    pub addr: SocketAddr,
    pub noops: Arc<AtomicUsize>,
}

/// A scripted in-process memcached speaking just enough of the binary
/// protocol for the client to exercise every verb. Connections are served
/// one at a time over a shared store, so a reconnecting client sees the
/// same data.
pub async fn start_server() -> ServerHandle {
    start_server_inner(None, 0).await
}

pub async fn start_server_with_auth(auth: (String, String)) -> ServerHandle {
    start_server_inner(Some(auth), 0).await
}

/// Drops the first `drop_first` accepted connections on the floor to force
/// the client through its reconnect path.
pub async fn start_server_dropping_first(drop_first: usize) -> ServerHandle {
    start_server_inner(None, drop_first).await
}

async fn start_server_inner(auth: Option<(String, String)>, drop_first: usize) -> ServerHandle {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let noops = Arc::new(AtomicUsize::new(0));

    let counter = noops.clone();
    tokio::spawn(async move {
        let mut store = Store {
            auth,
            noops: counter,
            ..Store::default()
        };
        let mut dropped = 0;
        while let Ok((socket, _)) = listener.accept().await {
            if dropped < drop_first {
                dropped += 1;
                drop(socket);
                continue;
            }
            let _ = serve_connection(socket, &mut store).await;
        }
    });

    ServerHandle { addr, noops }
}

/// Waits for the first lifecycle event matching `want`, with a hang guard.
pub async fn wait_for_event(
    rx: &mut tokio::sync::broadcast::Receiver<rustmc::Event>,
    want: impl Fn(&rustmc::Event) -> bool,
) -> rustmc::Event {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.unwrap();
            if want(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for a lifecycle event")
}

async fn serve_connection(socket: TcpStream, store: &mut Store) -> Result<(), rustmc::Error> {
    let mut framed = Framed::new(socket, FrameCodec);
    store.authed = store.auth.is_none();

    while let Some(request) = framed.next().await {
        match store.respond(request?) {
            Some(response) => framed.send(response).await?,
            // Quit: close the connection.
            None => return Ok(()),
        }
    }
    Ok(())
}

#[derive(Default)]
struct Store {
    items: HashMap<Vec<u8>, (u32, Vec<u8>, u64)>,
    counters: HashMap<Vec<u8>, u64>,
    cas_counter: u64,
    auth: Option<(String, String)>,
    authed: bool,
    noops: Arc<AtomicUsize>,
}

impl Store {
    fn respond(&mut self, request: Frame) -> Option<Frame> {
        let mut response = Frame::request(request.opcode);
        response.magic = RESPONSE_MAGIC;
        response.opaque = request.opaque;

        if !self.authed {
            match request.opcode {
                Opcode::SaslListMechs => {
                    response.value = Bytes::from_static(b"PLAIN");
                    return Some(response);
                }
                Opcode::SaslAuth => {
                    let (username, password) = self.auth.clone().unwrap();
                    let expected = format!("\0{}\0{}", username, password);
                    if request.key == Bytes::from_static(b"PLAIN")
                        && request.value == Bytes::from(expected.into_bytes())
                    {
                        self.authed = true;
                        response.value = Bytes::from_static(b"Authenticated");
                    } else {
                        response.vbucket_or_status = status::AUTH_ERROR;
                    }
                    return Some(response);
                }
                _ => {
                    response.vbucket_or_status = status::AUTH_ERROR;
                    return Some(response);
                }
            }
        }

        let key = request.key.to_vec();
        match request.opcode {
            Opcode::Get | Opcode::Gat => match self.items.get(&key) {
                Some((flags, value, cas)) => {
                    response.extras = Bytes::from(flags.to_be_bytes().to_vec());
                    response.value = Bytes::from(value.clone());
                    response.set_cas_u64(*cas);
                }
                None => response.vbucket_or_status = status::KEY_NOT_FOUND,
            },
            Opcode::Set => self.insert(key, &request),
            Opcode::Add => {
                if self.items.contains_key(&key) {
                    response.vbucket_or_status = status::KEY_EXISTS;
                } else {
                    self.insert(key, &request);
                }
            }
            Opcode::Replace => {
                if self.items.contains_key(&key) {
                    self.insert(key, &request);
                } else {
                    response.vbucket_or_status = status::KEY_NOT_FOUND;
                }
            }
            Opcode::Delete => {
                let removed =
                    self.items.remove(&key).is_some() | self.counters.remove(&key).is_some();
                if !removed {
                    response.vbucket_or_status = status::KEY_NOT_FOUND;
                }
            }
            Opcode::Increment | Opcode::Decrement => {
                let mut extras = &request.extras[..];
                let step = extras.get_u64();
                let initial = extras.get_u64();
                let _expiry = extras.get_u32();

                let increment = request.opcode == Opcode::Increment;
                let counter = self
                    .counters
                    .entry(key)
                    .and_modify(|counter| {
                        *counter = if increment {
                            // wraps at u64::MAX
                            counter.wrapping_add(step)
                        } else {
                            // clamps at zero, never wraps negative
                            counter.saturating_sub(step)
                        };
                    })
                    .or_insert(initial);
                response.value = Bytes::from(counter.to_be_bytes().to_vec());
            }
            Opcode::Append | Opcode::Prepend => match self.items.get_mut(&key) {
                Some((_, value, _)) => {
                    if request.opcode == Opcode::Append {
                        value.extend_from_slice(&request.value);
                    } else {
                        let mut prepended = request.value.to_vec();
                        prepended.extend_from_slice(value);
                        *value = prepended;
                    }
                }
                None => response.vbucket_or_status = status::ITEM_NOT_STORED,
            },
            Opcode::Touch => {
                if !self.items.contains_key(&key) {
                    response.vbucket_or_status = status::KEY_NOT_FOUND;
                }
            }
            Opcode::Flush => {
                self.items.clear();
                self.counters.clear();
            }
            Opcode::Version => response.value = Bytes::from_static(b"1.6.2"),
            Opcode::Noop => {
                self.noops
                    .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
            Opcode::Quit => return None,
            Opcode::SaslListMechs => response.value = Bytes::from_static(b"PLAIN"),
            Opcode::SaslAuth => response.value = Bytes::from_static(b"Authenticated"),
        }

        Some(response)
    }

    fn insert(&mut self, key: Vec<u8>, request: &Frame) {
        let flags = u32::from_be_bytes(request.extras[0..4].try_into().unwrap());
        self.cas_counter += 1;
        self.items
            .insert(key, (flags, request.value.to_vec(), self.cas_counter));
    }
}
