//! # Node
//!
//! The high-level facade combining the UDP transport and the DHT engine.
//! One `Node` is one participant: it binds a socket, serves fetch requests
//! from peers, and exposes the store/query operations.
//!
//! Record authentication and trust resolution deliberately stay outside
//! this type: [`crate::dht::Dht::get`] returns raw entries, and the caller
//! hands them to [`crate::resolver::resolve_trusted`] with the publisher
//! hash pinned by the query. The node moves bytes; believing them is the
//! consumer's decision.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use crate::dht::{Dht, Entry, FetchHandler, StoreStats, FETCH_CONSUMER};
use crate::identity::{Contact, Identifier};
use crate::transport::{TransportError, UdpTransport};

/// One peer-to-peer name resolution node.
pub struct Node {
    transport: UdpTransport,
    dht: Dht<UdpTransport>,
}

impl Node {
    /// Bind a node with a fresh random identifier.
    pub async fn bind(addr: &str) -> Result<Self> {
        let identifier = Identifier::random().context("failed to generate a node identifier")?;
        Self::bind_with_identifier(addr, identifier).await
    }

    /// Bind a node under a fixed identifier (e.g. one persisted across
    /// restarts so peers can keep their bootstrap lists).
    pub async fn bind_with_identifier(addr: &str, identifier: Identifier) -> Result<Self> {
        let transport = UdpTransport::bind(identifier, addr).await?;
        let dht = Dht::new(transport.self_contact().clone(), transport.clone());
        transport.register_consumer(FETCH_CONSUMER, Arc::new(FetchHandler::new(dht.clone())));

        info!(
            addr = %transport.local_addr(),
            identifier = %transport.identifier(),
            "node online"
        );
        Ok(Self { transport, dht })
    }

    pub fn identifier(&self) -> Identifier {
        self.transport.identifier()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// This node's own contact record.
    pub fn contact(&self) -> Contact {
        self.transport.self_contact().clone()
    }

    /// Add a peer to the contact list. Use [`Contact::trusted`] to attach
    /// an operator-assigned trust weight.
    pub fn add_peer(&self, contact: Contact) {
        self.dht.add_contact(contact);
    }

    pub fn remove_peer(&self, contact: &Contact) {
        self.dht.remove_contact(contact);
    }

    pub fn peers(&self) -> Vec<Contact> {
        self.dht.contacts()
    }

    /// Store a key/value pair on this node.
    pub fn put(&self, key: Identifier, value: Vec<u8>) {
        self.dht.put(key, value);
    }

    /// Drop every owned value under `key`.
    pub fn remove(&self, key: Identifier) {
        self.dht.remove(key);
    }

    /// Resolve `key` locally and across all known peers.
    pub async fn get(&self, key: Identifier) -> Vec<Entry> {
        self.dht.get(key).await
    }

    /// Entries answerable without touching the network.
    pub fn local_entries(&self, key: Identifier) -> Vec<Entry> {
        self.dht.local_entries(key)
    }

    /// Probe a peer for liveness; `Ok(None)` means unreachable.
    pub async fn ping(
        &self,
        peer: &Contact,
        timeout: Duration,
    ) -> Result<Option<Duration>, TransportError> {
        self.transport.ping(peer, timeout).await
    }

    /// Learn the identifier of whatever node listens at `addr`.
    pub async fn discover(
        &self,
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<Identifier, TransportError> {
        self.transport.discover(addr, timeout).await
    }

    pub fn stats(&self) -> StoreStats {
        self.dht.stats()
    }

    /// Stop the listener loop. Detached late-reply continuations are
    /// abandoned, not awaited.
    pub async fn shutdown(&self) {
        self.transport.shutdown().await;
        info!(identifier = self.identifier().log_prefix(), "node offline");
    }
}
