//! # DHT Store and Query Engine
//!
//! The distributed hash table here is deliberately flat: a node stores its
//! own entries, caches what it learns from peers, and answers a query by
//! broadcasting a fetch to every known contact at once. There is no routing
//! metric and no multi-hop forwarding - a peer asked for a key returns what
//! it holds, verbatim, and never re-queries its own contacts.
//!
//! ## Query Budgets
//!
//! `get` fans out one fetch per contact and waits two windows per peer:
//!
//! - **primary budget** - replies inside it land in both the cache and the
//!   synchronous result set
//! - **grace window** - a peer that missed the primary budget is marked
//!   late; a detached continuation keeps listening and feeds late entries
//!   into the cache only
//!
//! `get` returns as soon as every contact has answered or been marked late.
//! It never blocks on the grace window, and a peer that stays silent costs
//! nothing beyond the window itself.
//!
//! ## Cache Policy
//!
//! Learned entries outlive the query that fetched them so later lookups can
//! be answered locally. The cache is bounded - an LRU over keys
//! ([`CACHE_MAX_KEYS`]) with a per-key entry cap
//! ([`CACHE_MAX_ENTRIES_PER_KEY`]) - so a chatty or malicious peer cannot
//! grow it without limit.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::identity::{Contact, Identifier};
use crate::messages::{deserialize_bounded, encode_callback, serialize_payload, ConsumerId, FetchRequest};
use crate::protocols::PeerRpc;
use crate::transport::{DataConsumer, UdpTransport, CALLBACK_CONSUMER};

/// Consumer id the fetch exchange is addressed to.
pub const FETCH_CONSUMER: ConsumerId = ConsumerId(*b"fidium.dhtfetch!");

/// How long a peer has to answer before its reply stops counting toward the
/// synchronous result set.
pub const PRIMARY_FETCH_BUDGET: Duration = Duration::from_millis(1500);

/// How much longer a late peer's reply is still absorbed into the cache.
pub const LATE_FETCH_GRACE: Duration = Duration::from_secs(15);

/// Maximum keys the learned-entry cache tracks (LRU beyond this).
pub const CACHE_MAX_KEYS: usize = 4096;

/// Maximum cached entries per key; further entries for the key are dropped.
pub const CACHE_MAX_ENTRIES_PER_KEY: usize = 64;

/// Maximum entries returned for one fetch request.
/// Keeps the reply inside a single datagram.
const MAX_ENTRIES_PER_FETCH: usize = 64;

/// One key/value pair as stored or retrieved, tagged with the contact that
/// supplied it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub owner: Contact,
    pub key: Identifier,
    pub value: Vec<u8>,
}

/// Counters exposed for operator logging.
#[derive(Debug, Clone, Copy)]
pub struct StoreStats {
    pub contacts: usize,
    pub owned_entries: usize,
    pub cached_entries: usize,
}

// ============================================================================
// Peer list
// ============================================================================

/// The node's known peers. Membership is mutable; individual contacts are
/// immutable once added.
struct ContactList {
    contacts: RwLock<Vec<Contact>>,
}

impl ContactList {
    fn new() -> Self {
        Self {
            contacts: RwLock::new(Vec::new()),
        }
    }

    fn add(&self, contact: Contact) {
        let mut contacts = self.contacts.write().expect("contact list lock poisoned");
        if contacts.contains(&contact) {
            return;
        }
        contacts.push(contact);
    }

    fn remove(&self, contact: &Contact) {
        self.contacts
            .write()
            .expect("contact list lock poisoned")
            .retain(|c| c != contact);
    }

    fn snapshot(&self) -> Vec<Contact> {
        self.contacts
            .read()
            .expect("contact list lock poisoned")
            .clone()
    }

    fn find(&self, identifier: &Identifier) -> Option<Contact> {
        self.contacts
            .read()
            .expect("contact list lock poisoned")
            .iter()
            .find(|c| c.identifier == *identifier)
            .cloned()
    }

    fn len(&self) -> usize {
        self.contacts
            .read()
            .expect("contact list lock poisoned")
            .len()
    }
}

// ============================================================================
// Local store
// ============================================================================

/// Owned entries plus the bounded cache of entries learned from peers.
///
/// Owned entries are authoritative and live until explicitly removed;
/// several values may coexist under one key. Both sides tolerate concurrent
/// read/insert from arbitrarily many workers.
struct LocalStore {
    owned: RwLock<Vec<Entry>>,
    cached: Mutex<LruCache<Identifier, Vec<Entry>>>,
}

impl LocalStore {
    fn new() -> Self {
        let cap = NonZeroUsize::new(CACHE_MAX_KEYS).expect("cache capacity must be non-zero");
        Self {
            owned: RwLock::new(Vec::new()),
            cached: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Append an owned entry. Re-inserting an identical entry is a no-op;
    /// a new value under an existing key coexists with the old one.
    fn insert_owned(&self, entry: Entry) {
        let mut owned = self.owned.write().expect("owned store lock poisoned");
        if owned.contains(&entry) {
            return;
        }
        owned.push(entry);
    }

    /// Drop every owned entry under `key`. No-op if none exist; cached
    /// entries are untouched.
    fn remove_owned(&self, key: &Identifier) {
        self.owned
            .write()
            .expect("owned store lock poisoned")
            .retain(|e| e.key != *key);
    }

    fn owned_for(&self, key: &Identifier) -> Vec<Entry> {
        self.owned
            .read()
            .expect("owned store lock poisoned")
            .iter()
            .filter(|e| e.key == *key)
            .cloned()
            .collect()
    }

    fn cached_for(&self, key: &Identifier) -> Vec<Entry> {
        self.cached
            .lock()
            .expect("entry cache lock poisoned")
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    fn cache_insert(&self, entry: &Entry) {
        let mut cached = self.cached.lock().expect("entry cache lock poisoned");
        let bucket = cached.get_or_insert_mut(entry.key, Vec::new);
        if bucket.iter().any(|e| e == entry) {
            return;
        }
        if bucket.len() >= CACHE_MAX_ENTRIES_PER_KEY {
            debug!(
                key = entry.key.log_prefix(),
                "per-key cache bucket full, dropping entry"
            );
            return;
        }
        bucket.push(entry.clone());
    }

    fn owned_len(&self) -> usize {
        self.owned.read().expect("owned store lock poisoned").len()
    }

    fn cached_len(&self) -> usize {
        self.cached
            .lock()
            .expect("entry cache lock poisoned")
            .iter()
            .map(|(_, bucket)| bucket.len())
            .sum()
    }
}

// ============================================================================
// Engine
// ============================================================================

struct DhtInner<N> {
    self_contact: Contact,
    network: N,
    store: LocalStore,
    contacts: ContactList,
    primary_budget: Duration,
    grace_budget: Duration,
}

/// Handle to the DHT engine. Cheap to clone.
pub struct Dht<N: PeerRpc> {
    inner: Arc<DhtInner<N>>,
}

impl<N: PeerRpc> Clone for Dht<N> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<N: PeerRpc + Clone> Dht<N> {
    pub fn new(self_contact: Contact, network: N) -> Self {
        Self::with_budgets(self_contact, network, PRIMARY_FETCH_BUDGET, LATE_FETCH_GRACE)
    }

    /// Build an engine with explicit query budgets. Production uses the
    /// defaults; tests shrink them.
    pub fn with_budgets(
        self_contact: Contact,
        network: N,
        primary_budget: Duration,
        grace_budget: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(DhtInner {
                self_contact,
                network,
                store: LocalStore::new(),
                contacts: ContactList::new(),
                primary_budget,
                grace_budget,
            }),
        }
    }

    pub fn self_contact(&self) -> &Contact {
        &self.inner.self_contact
    }

    pub fn add_contact(&self, contact: Contact) {
        debug!(peer = %contact, weight = contact.weight(), "adding contact");
        self.inner.contacts.add(contact);
    }

    pub fn remove_contact(&self, contact: &Contact) {
        self.inner.contacts.remove(contact);
    }

    pub fn contacts(&self) -> Vec<Contact> {
        self.inner.contacts.snapshot()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            contacts: self.inner.contacts.len(),
            owned_entries: self.inner.store.owned_len(),
            cached_entries: self.inner.store.cached_len(),
        }
    }

    /// Store a key/value pair on this node.
    pub fn put(&self, key: Identifier, value: Vec<u8>) {
        trace!(key = key.log_prefix(), len = value.len(), "put");
        self.inner.store.insert_owned(Entry {
            owner: self.inner.self_contact.clone(),
            key,
            value,
        });
    }

    /// Drop every owned value under `key`.
    pub fn remove(&self, key: Identifier) {
        trace!(key = key.log_prefix(), "remove");
        self.inner.store.remove_owned(&key);
    }

    /// Entries this node can answer with locally: owned plus cached.
    pub fn local_entries(&self, key: Identifier) -> Vec<Entry> {
        let mut entries = self.inner.store.owned_for(&key);
        entries.extend(self.inner.store.cached_for(&key));
        entries
    }

    /// Resolve `key` across the network.
    ///
    /// Collects local matches, then broadcasts a fetch to every known
    /// contact concurrently. Replies inside the primary budget join the
    /// result set and the cache; a peer that misses the budget is marked
    /// late and its eventual reply (within the grace window) feeds the
    /// cache only. Returns once every peer has answered or been marked
    /// late - the grace window never delays the caller.
    pub async fn get(&self, key: Identifier) -> Vec<Entry> {
        let mut results = self.local_entries(key);
        let contacts = self.inner.contacts.snapshot();
        if contacts.is_empty() {
            return results;
        }

        debug!(
            key = key.log_prefix(),
            local = results.len(),
            peers = contacts.len(),
            "querying peers"
        );

        let gathered: Arc<Mutex<Vec<Entry>>> = Arc::new(Mutex::new(Vec::new()));
        let total_wait = self.inner.primary_budget + self.inner.grace_budget;
        let mut workers = JoinSet::new();

        for contact in contacts {
            let engine = self.clone();
            let gathered = gathered.clone();
            workers.spawn(async move {
                let network = engine.inner.network.clone();
                let target = contact.clone();
                let mut fetch =
                    Box::pin(async move { network.fetch(&target, key, total_wait).await });

                match tokio::time::timeout(engine.inner.primary_budget, fetch.as_mut()).await {
                    Ok(Ok(entries)) => {
                        let absorbed = engine.absorb_remote(entries);
                        trace!(peer = %contact, count = absorbed.len(), "peer answered in time");
                        gathered
                            .lock()
                            .expect("result collection lock poisoned")
                            .extend(absorbed);
                    }
                    Ok(Err(e)) if e.is_timeout() => {
                        debug!(peer = %contact, "peer never answered");
                    }
                    Ok(Err(e)) => {
                        debug!(peer = %contact, error = %e, "fetch failed");
                    }
                    Err(_) => {
                        debug!(peer = %contact, "peer missed the primary budget, listening in background");
                        let engine = engine.clone();
                        let peer = contact.clone();
                        tokio::spawn(async move {
                            match fetch.await {
                                Ok(entries) => {
                                    let absorbed = engine.absorb_remote(entries);
                                    debug!(peer = %peer, count = absorbed.len(), "late reply cached");
                                }
                                Err(e) if e.is_timeout() => {
                                    debug!(peer = %peer, "peer silent past the grace window");
                                }
                                Err(e) => {
                                    debug!(peer = %peer, error = %e, "late fetch failed");
                                }
                            }
                        });
                    }
                }
            });
        }

        while workers.join_next().await.is_some() {}

        results.extend(
            gathered
                .lock()
                .expect("result collection lock poisoned")
                .drain(..),
        );
        results
    }

    /// Serve a fetch request from a peer: local owned + cached entries,
    /// verbatim. This node never recurses the query to its own peers.
    pub fn handle_fetch(&self, key: Identifier) -> Vec<Entry> {
        let mut entries = self.local_entries(key);
        if entries.len() > MAX_ENTRIES_PER_FETCH {
            warn!(
                key = key.log_prefix(),
                count = entries.len(),
                max = MAX_ENTRIES_PER_FETCH,
                "truncating fetch response"
            );
            entries.truncate(MAX_ENTRIES_PER_FETCH);
        }
        entries
    }

    /// Take entries received from a peer into the cache.
    ///
    /// Trust weights never cross the wire, so each entry's owner weight is
    /// rewritten from this node's own peer list: a known contact gets the
    /// operator-assigned weight, an unknown one gets none.
    fn absorb_remote(&self, entries: Vec<Entry>) -> Vec<Entry> {
        let mut absorbed = Vec::with_capacity(entries.len());
        for mut entry in entries {
            entry.owner.trust_weight = self
                .inner
                .contacts
                .find(&entry.owner.identifier)
                .and_then(|known| known.trust_weight);
            self.inner.store.cache_insert(&entry);
            absorbed.push(entry);
        }
        absorbed
    }
}

// ============================================================================
// Fetch request handling (transport consumer)
// ============================================================================

/// Serves incoming fetch requests for a DHT engine.
///
/// Registered with the transport under [`FETCH_CONSUMER`]; replies go back
/// through the callback consumer tagged with the requester's token. Holds a
/// plain engine handle - the transport passes itself into `deliver`, so no
/// reference cycle forms between transport and engine.
pub struct FetchHandler<N: PeerRpc> {
    dht: Dht<N>,
}

impl<N: PeerRpc + Clone> FetchHandler<N> {
    pub fn new(dht: Dht<N>) -> Self {
        Self { dht }
    }
}

#[async_trait]
impl<N: PeerRpc + Clone> DataConsumer for FetchHandler<N> {
    async fn deliver(
        &self,
        transport: &UdpTransport,
        source: Contact,
        payload: Vec<u8>,
    ) -> Result<()> {
        let request: FetchRequest =
            deserialize_bounded(&payload).context("malformed fetch request")?;

        let entries = self.dht.handle_fetch(request.key);
        trace!(
            from = %source,
            key = request.key.log_prefix(),
            count = entries.len(),
            "serving fetch request"
        );

        let body = serialize_payload(&entries).context("failed to serialize fetch response")?;
        transport
            .send(
                &source,
                CALLBACK_CONSUMER,
                encode_callback(request.reply_token, &body),
            )
            .await
            .context("failed to send fetch response")?;
        Ok(())
    }
}
