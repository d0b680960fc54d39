//! # UDP RPC Transport
//!
//! This module implements the datagram wire protocol on a single UDP socket:
//! packet framing, token-correlated request/response, dispatch of `Data`
//! payloads to logical consumers, and the discovery (address → identifier)
//! exchange. There is no reliable-delivery layer underneath - a lost
//! datagram is simply a timeout.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   recv_from    ┌────────────────┐
//! │ listener task│ ─────────────► │ worker per     │
//! │ (one socket) │                │ datagram       │
//! └──────────────┘                └───────┬────────┘
//!                                         │ dispatch by packet kind
//!              ┌───────────────┬──────────┴─────┬────────────────┐
//!              ▼               ▼                ▼                ▼
//!        ping ack         token table     consumer map     discovery
//!        (callback)       signal          deliver()        waits
//! ```
//!
//! The listener reads one datagram at a time and hands each to a spawned
//! worker, so a slow consumer never blocks reception of the next datagram.
//! Workers complete unordered. Shutdown is cooperative: a stop signal plus
//! awaiting the listener task; in-flight workers are not awaited.
//!
//! ## Correlation
//!
//! Replies ride `Data` packets addressed to the reserved
//! [`CALLBACK_CONSUMER`], framed as (token, body). The receive path feeds
//! them straight into the [`TokenTable`], which wakes whichever RPC is
//! parked on that token. Both the token table and the discovery-wait table
//! are owned by the transport instance - multiple nodes in one process do
//! not share state.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::identity::{Contact, Identifier};
use crate::messages::{
    encode_callback, split_callback, ConsumerId, Packet, MAX_DATAGRAM_SIZE, MAX_PAYLOAD_SIZE,
    PING_ACK,
};
use crate::tokens::{TokenCollision, TokenTable};

/// Reserved consumer id for the transport's own response path.
///
/// Ping acknowledgements and fetch replies arrive here as (token, body)
/// frames and are routed into the token table.
pub const CALLBACK_CONSUMER: ConsumerId = ConsumerId(*b"fidium.callback!");

// ============================================================================
// Error taxonomy
// ============================================================================

/// Errors surfaced by transport operations.
///
/// `Timeout` is the recoverable "no answer" outcome. The collision variants
/// are protocol invariant breaches - they indicate token-space exhaustion or
/// a bug and are raised to the caller, never swallowed.
#[derive(Debug)]
pub enum TransportError {
    /// No reply arrived within the caller's budget.
    Timeout,
    /// Fatal: a freshly issued correlation token collided with an
    /// outstanding one.
    TokenCollision(i64),
    /// Fatal: a discovery request's random unique number collided with an
    /// outstanding one.
    DiscoveryCollision(i64),
    /// Outgoing packet would exceed a single datagram.
    Oversized(usize),
    /// Socket-level failure.
    Io(std::io::Error),
    /// A payload failed to encode or a reply failed to decode.
    Codec(bincode::Error),
}

impl TransportError {
    /// Whether this is the recoverable no-answer outcome.
    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout)
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Timeout => write!(f, "no reply within budget"),
            TransportError::TokenCollision(id) => {
                write!(f, "correlation token id {} already outstanding", id)
            }
            TransportError::DiscoveryCollision(n) => {
                write!(f, "discovery unique number {} already outstanding", n)
            }
            TransportError::Oversized(len) => {
                write!(f, "packet of {} bytes exceeds one datagram", len)
            }
            TransportError::Io(e) => write!(f, "socket error: {}", e),
            TransportError::Codec(e) => write!(f, "payload codec error: {}", e),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io(e) => Some(e),
            TransportError::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e)
    }
}

impl From<TokenCollision> for TransportError {
    fn from(e: TokenCollision) -> Self {
        TransportError::TokenCollision(e.id)
    }
}

impl From<bincode::Error> for TransportError {
    fn from(e: bincode::Error) -> Self {
        TransportError::Codec(e)
    }
}

// ============================================================================
// Consumer dispatch
// ============================================================================

/// A logical consumer of `Data` payloads.
///
/// Consumers are registered under a [`ConsumerId`] and invoked from the
/// per-datagram worker. A consumer error is logged and isolated: it never
/// affects the receive loop or other consumers. The transport handle is
/// passed in so a consumer can send replies without holding a reference back
/// into the transport (no ownership cycle).
#[async_trait]
pub trait DataConsumer: Send + Sync {
    async fn deliver(
        &self,
        transport: &UdpTransport,
        source: Contact,
        payload: Vec<u8>,
    ) -> Result<()>;
}

// ============================================================================
// Discovery waits
// ============================================================================

/// Outstanding WhoAreYou exchanges, keyed by the requester's random number.
///
/// A 64-bit random key makes collisions unreachable in practice, but a
/// collision is still detected and surfaced rather than silently
/// overwriting the first waiter.
struct DiscoveryTable {
    waits: Mutex<HashMap<i64, oneshot::Sender<Identifier>>>,
}

impl DiscoveryTable {
    fn new() -> Self {
        Self {
            waits: Mutex::new(HashMap::new()),
        }
    }

    fn register(&self, unique: i64) -> Result<oneshot::Receiver<Identifier>, TransportError> {
        let (tx, rx) = oneshot::channel();
        let mut waits = self.waits.lock().expect("discovery table lock poisoned");
        if waits.contains_key(&unique) {
            return Err(TransportError::DiscoveryCollision(unique));
        }
        waits.insert(unique, tx);
        Ok(rx)
    }

    fn signal(&self, unique: i64, identifier: Identifier) {
        let waiter = self
            .waits
            .lock()
            .expect("discovery table lock poisoned")
            .remove(&unique);
        match waiter {
            Some(tx) => {
                let _ = tx.send(identifier);
            }
            None => debug!(unique, "discovery reply for unknown number dropped"),
        }
    }

    fn remove(&self, unique: i64) {
        self.waits
            .lock()
            .expect("discovery table lock poisoned")
            .remove(&unique);
    }
}

// ============================================================================
// Transport
// ============================================================================

struct TransportInner {
    socket: Arc<UdpSocket>,
    self_contact: Contact,
    tokens: TokenTable,
    discovery: DiscoveryTable,
    consumers: RwLock<HashMap<ConsumerId, Arc<dyn DataConsumer>>>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a bound UDP transport. Cheap to clone.
#[derive(Clone)]
pub struct UdpTransport {
    inner: Arc<TransportInner>,
}

impl UdpTransport {
    /// Bind a socket and start the listener loop.
    pub async fn bind(identifier: Identifier, addr: &str) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("failed to bind UDP socket on {}", addr))?;
        let local = socket
            .local_addr()
            .context("bound socket has no local address")?;

        let transport = Self {
            inner: Arc::new(TransportInner {
                socket: Arc::new(socket),
                self_contact: Contact::new(identifier, local),
                tokens: TokenTable::new(),
                discovery: DiscoveryTable::new(),
                consumers: RwLock::new(HashMap::new()),
                stop_tx: Mutex::new(None),
                listener: Mutex::new(None),
            }),
        };

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let listener = {
            let transport = transport.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
                loop {
                    tokio::select! {
                        _ = &mut stop_rx => {
                            debug!("listener stopping");
                            break;
                        }
                        received = transport.inner.socket.recv_from(&mut buf) => {
                            match received {
                                Ok((len, from)) => {
                                    let datagram = buf[..len].to_vec();
                                    let worker = transport.clone();
                                    tokio::spawn(async move {
                                        worker.handle_datagram(datagram, from).await;
                                    });
                                }
                                Err(e) => {
                                    warn!(error = %e, "socket receive failed");
                                }
                            }
                        }
                    }
                }
            })
        };

        *transport
            .inner
            .stop_tx
            .lock()
            .expect("stop signal lock poisoned") = Some(stop_tx);
        *transport
            .inner
            .listener
            .lock()
            .expect("listener handle lock poisoned") = Some(listener);

        info!(
            addr = %local,
            identifier = transport.inner.self_contact.identifier.log_prefix(),
            "transport listening"
        );
        Ok(transport)
    }

    /// This node's own contact record (identifier + bound endpoint).
    pub fn self_contact(&self) -> &Contact {
        &self.inner.self_contact
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.self_contact.addr
    }

    pub fn identifier(&self) -> Identifier {
        self.inner.self_contact.identifier
    }

    /// Register a consumer for `Data` payloads addressed to `id`.
    pub fn register_consumer(&self, id: ConsumerId, consumer: Arc<dyn DataConsumer>) {
        let replaced = self
            .inner
            .consumers
            .write()
            .expect("consumer map lock poisoned")
            .insert(id, consumer);
        if replaced.is_some() {
            warn!(consumer = ?id, "replaced an already-registered consumer");
        }
    }

    /// Stop the listener loop and wait for it to exit.
    ///
    /// In-flight datagram workers are not awaited; they finish (or die with
    /// the runtime) on their own.
    pub async fn shutdown(&self) {
        let stop = self
            .inner
            .stop_tx
            .lock()
            .expect("stop signal lock poisoned")
            .take();
        if let Some(tx) = stop {
            let _ = tx.send(());
        }

        let listener = self
            .inner
            .listener
            .lock()
            .expect("listener handle lock poisoned")
            .take();
        if let Some(handle) = listener {
            let _ = handle.await;
        }
        debug!(addr = %self.local_addr(), "transport shut down");
    }

    /// Probe a peer for liveness.
    ///
    /// Returns `Ok(Some(rtt))` when the peer acknowledged within the budget
    /// and `Ok(None)` when it did not - an unreachable peer is an answer,
    /// not an error.
    pub async fn ping(
        &self,
        to: &Contact,
        timeout: Duration,
    ) -> Result<Option<Duration>, TransportError> {
        let mut token = self.inner.tokens.allocate()?;
        let packet = Packet::Ping {
            source: self.inner.self_contact.clone(),
            token: token.id(),
        };

        let started = Instant::now();
        if let Err(e) = self.send_packet(&packet, to.addr).await {
            self.inner.tokens.free(&token);
            return Err(e);
        }
        let outcome = self.inner.tokens.wait(&mut token, timeout).await;
        self.inner.tokens.free(&token);

        match outcome {
            Some(ack) => {
                if ack != PING_ACK {
                    debug!(peer = %to, "ping acknowledged with unexpected payload");
                }
                let rtt = started.elapsed();
                debug!(peer = %to, rtt_ms = rtt.as_millis() as u64, "ping reply");
                Ok(Some(rtt))
            }
            None => {
                debug!(peer = %to, "no ping reply within budget");
                Ok(None)
            }
        }
    }

    /// Fire-and-forget delivery to a named consumer on the remote node.
    pub async fn send(
        &self,
        to: &Contact,
        consumer: ConsumerId,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(TransportError::Oversized(payload.len()));
        }
        let packet = Packet::Data {
            source: self.inner.self_contact.clone(),
            consumer,
            payload,
        };
        self.send_packet(&packet, to.addr).await
    }

    /// Learn the identifier of the node listening at `target`.
    ///
    /// The wait is registered under a random 64-bit number before the
    /// request is sent; a collision with an outstanding number is a fatal
    /// protocol error, and silence past the timeout is `Timeout`.
    pub async fn discover(
        &self,
        target: SocketAddr,
        timeout: Duration,
    ) -> Result<Identifier, TransportError> {
        let unique: i64 = rand::random();
        let mut rx = self.inner.discovery.register(unique)?;

        let reply_to = self.local_addr();
        let packet = Packet::WhoAreYou {
            reply_addr: reply_to.ip(),
            reply_port: reply_to.port(),
            unique,
        };

        let outcome = match self.send_packet(&packet, target).await {
            Ok(()) => tokio::time::timeout(timeout, &mut rx).await,
            Err(e) => {
                self.inner.discovery.remove(unique);
                return Err(e);
            }
        };
        self.inner.discovery.remove(unique);

        match outcome {
            Ok(Ok(identifier)) => {
                debug!(target = %target, identifier = identifier.log_prefix(), "discovered peer");
                Ok(identifier)
            }
            _ => Err(TransportError::Timeout),
        }
    }

    /// Single funnel for outbound datagrams; one send completes at a time
    /// per caller and the kernel delivers each datagram atomically, so
    /// packets never interleave.
    async fn send_packet(&self, packet: &Packet, to: SocketAddr) -> Result<(), TransportError> {
        let bytes = packet.encode();
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(TransportError::Oversized(bytes.len()));
        }
        self.inner.socket.send_to(&bytes, to).await?;
        Ok(())
    }

    async fn handle_datagram(&self, data: Vec<u8>, from: SocketAddr) {
        let packet = match Packet::decode(&data) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(from = %from, len = data.len(), error = %e, "dropping malformed datagram");
                return;
            }
        };

        match packet {
            Packet::Ping { source, token } => {
                trace!(from = %source, token, "handling ping");
                let ack = Packet::Data {
                    source: self.inner.self_contact.clone(),
                    consumer: CALLBACK_CONSUMER,
                    payload: encode_callback(token, &PING_ACK),
                };
                if let Err(e) = self.send_packet(&ack, source.addr).await {
                    debug!(peer = %source, error = %e, "failed to acknowledge ping");
                }
            }
            Packet::Data {
                source,
                consumer,
                payload,
            } => {
                if consumer == CALLBACK_CONSUMER {
                    match split_callback(&payload) {
                        Ok((token, body)) => self.inner.tokens.signal(token, body.to_vec()),
                        Err(e) => warn!(from = %from, error = %e, "dropping malformed callback"),
                    }
                    return;
                }
                self.dispatch_to_consumer(consumer, source, payload).await;
            }
            Packet::WhoAreYou {
                reply_addr,
                reply_port,
                unique,
            } => {
                trace!(from = %from, unique, "handling discovery request");
                let reply = Packet::WhoAreYouReply {
                    unique,
                    identifier: self.inner.self_contact.identifier,
                };
                let to = SocketAddr::new(reply_addr, reply_port);
                if let Err(e) = self.send_packet(&reply, to).await {
                    debug!(to = %to, error = %e, "failed to answer discovery request");
                }
            }
            Packet::WhoAreYouReply { unique, identifier } => {
                self.inner.discovery.signal(unique, identifier);
            }
        }
    }

    async fn dispatch_to_consumer(&self, id: ConsumerId, source: Contact, payload: Vec<u8>) {
        let consumer = self
            .inner
            .consumers
            .read()
            .expect("consumer map lock poisoned")
            .get(&id)
            .cloned();

        match consumer {
            Some(consumer) => {
                // A failing consumer affects this packet only.
                if let Err(e) = consumer.deliver(self, source, payload).await {
                    warn!(consumer = ?id, error = %e, "consumer failed to process payload");
                }
            }
            None => {
                debug!(consumer = ?id, from = %source, "no consumer registered, dropping payload");
            }
        }
    }
}

// ============================================================================
// PeerRpc over UDP
// ============================================================================

#[async_trait]
impl crate::protocols::PeerRpc for UdpTransport {
    async fn ping(
        &self,
        to: &Contact,
        timeout: Duration,
    ) -> Result<Option<Duration>, TransportError> {
        UdpTransport::ping(self, to, timeout).await
    }

    async fn send(
        &self,
        to: &Contact,
        consumer: ConsumerId,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        UdpTransport::send(self, to, consumer, payload).await
    }

    /// One fetch RPC: a `Data` request to the peer's fetch consumer, then a
    /// wait on the embedded correlation token for the entry list.
    async fn fetch(
        &self,
        to: &Contact,
        key: Identifier,
        wait: Duration,
    ) -> Result<Vec<crate::dht::Entry>, TransportError> {
        let mut token = self.inner.tokens.allocate()?;
        let request = crate::messages::FetchRequest {
            reply_token: token.id(),
            key,
        };
        let payload = crate::messages::serialize_payload(&request)?;
        let packet = Packet::Data {
            source: self.inner.self_contact.clone(),
            consumer: crate::dht::FETCH_CONSUMER,
            payload,
        };

        if let Err(e) = self.send_packet(&packet, to.addr).await {
            self.inner.tokens.free(&token);
            return Err(e);
        }
        let outcome = self.inner.tokens.wait(&mut token, wait).await;
        self.inner.tokens.free(&token);

        match outcome {
            Some(body) => Ok(crate::messages::deserialize_bounded(&body)?),
            None => Err(TransportError::Timeout),
        }
    }
}
