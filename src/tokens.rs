//! # Correlation Token Table
//!
//! Outbound RPCs over a datagram socket need a way to match an asynchronous
//! reply to the request that triggered it. The [`TokenTable`] hands out
//! unique `i64` tokens; the sender embeds the token in its packet and waits
//! on it, and the receive path signals the token when the correlated reply
//! arrives.
//!
//! The table is explicit state owned by the transport - never a process-wide
//! registry - so multiple nodes in one process stay independently testable.
//!
//! ## Lifecycle
//!
//! One token spans exactly one outstanding RPC:
//!
//! 1. [`TokenTable::allocate`] registers a waiter under a fresh id
//! 2. [`TokenTable::wait`] parks the caller until signalled or timed out
//! 3. [`TokenTable::signal`] is invoked by the receive path; signalling an
//!    unknown id is a no-op (the requester already gave up)
//! 4. [`TokenTable::free`] removes the entry regardless of outcome and runs
//!    exactly once per allocated token
//!
//! Ids come from a monotonic counter, so a collision among outstanding RPCs
//! indicates token-space exhaustion or a bug; it is detected and surfaced as
//! a fatal [`TokenCollision`] rather than silently overwriting the first
//! waiter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Fatal protocol error: a freshly issued token id collided with one that is
/// still outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenCollision {
    pub id: i64,
}

impl std::fmt::Display for TokenCollision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "correlation token id {} is already outstanding", self.id)
    }
}

impl std::error::Error for TokenCollision {}

/// One outstanding RPC's correlation handle.
///
/// Holds the receiving half of the waiter; dropped (or freed) exactly once
/// when the RPC completes or the caller gives up.
pub struct Token {
    id: i64,
    rx: oneshot::Receiver<Vec<u8>>,
}

impl Token {
    #[inline]
    pub fn id(&self) -> i64 {
        self.id
    }
}

/// Registry mapping correlation tokens to parked waiters.
pub struct TokenTable {
    waiters: Mutex<HashMap<i64, oneshot::Sender<Vec<u8>>>>,
    next_id: AtomicI64,
}

impl TokenTable {
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    /// Register a waiter under a fresh token id.
    pub fn allocate(&self) -> Result<Token, TokenCollision> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.register(id)
    }

    fn register(&self, id: i64) -> Result<Token, TokenCollision> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock().expect("token table lock poisoned");
        if waiters.contains_key(&id) {
            return Err(TokenCollision { id });
        }
        waiters.insert(id, tx);
        trace!(token = id, outstanding = waiters.len(), "token allocated");
        Ok(Token { id, rx })
    }

    /// Park the caller until the token is signalled or the timeout elapses.
    ///
    /// Returns the reply payload if the token was signalled in time, `None`
    /// otherwise. Never reports a signal that was not delivered for this id.
    pub async fn wait(&self, token: &mut Token, timeout: Duration) -> Option<Vec<u8>> {
        match tokio::time::timeout(timeout, &mut token.rx).await {
            Ok(Ok(payload)) => Some(payload),
            // Sender dropped: the entry was freed out from under us.
            Ok(Err(_)) => None,
            Err(_) => None,
        }
    }

    /// Deliver a correlated reply to whoever is waiting on `id`.
    ///
    /// A no-op for unknown ids: late replies after the requester gave up are
    /// absorbed here, never an error.
    pub fn signal(&self, id: i64, payload: Vec<u8>) {
        let waiter = self
            .waiters
            .lock()
            .expect("token table lock poisoned")
            .remove(&id);
        match waiter {
            Some(tx) => {
                // The waiter may have raced its timeout and dropped the
                // receiver; that is equivalent to an unknown id.
                let _ = tx.send(payload);
            }
            None => debug!(token = id, "reply for unknown token dropped"),
        }
    }

    /// Remove the token's entry regardless of outcome.
    pub fn free(&self, token: &Token) {
        self.waiters
            .lock()
            .expect("token table lock poisoned")
            .remove(&token.id);
    }

    #[cfg(test)]
    fn outstanding(&self) -> usize {
        self.waiters.lock().unwrap().len()
    }
}

impl Default for TokenTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn concurrent_allocations_yield_distinct_ids() {
        let table = Arc::new(TokenTable::new());
        let mut handles = Vec::new();

        for _ in 0..8 {
            let table = table.clone();
            handles.push(std::thread::spawn(move || {
                (0..64)
                    .map(|_| table.allocate().expect("allocate failed").id())
                    .collect::<Vec<i64>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "token id {} issued twice", id);
            }
        }
        assert_eq!(seen.len(), 8 * 64);
    }

    #[test]
    fn colliding_id_is_a_fatal_error() {
        let table = TokenTable::new();

        let _first = table.register(42).expect("first registration failed");
        let second = table.register(42);
        assert!(matches!(second, Err(TokenCollision { id: 42 })));
    }

    #[tokio::test]
    async fn wait_returns_payload_after_signal() {
        let table = Arc::new(TokenTable::new());
        let mut token = table.allocate().unwrap();
        let id = token.id();

        let signaller = table.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            signaller.signal(id, b"pong".to_vec());
        });

        let payload = table.wait(&mut token, Duration::from_secs(1)).await;
        table.free(&token);

        assert_eq!(payload.as_deref(), Some(&b"pong"[..]));
        assert_eq!(table.outstanding(), 0);
    }

    #[tokio::test]
    async fn wait_times_out_without_signal() {
        let table = TokenTable::new();
        let mut token = table.allocate().unwrap();

        let payload = table.wait(&mut token, Duration::from_millis(30)).await;
        table.free(&token);

        assert_eq!(payload, None);
        assert_eq!(table.outstanding(), 0);
    }

    #[tokio::test]
    async fn signal_for_unknown_token_is_a_noop() {
        let table = TokenTable::new();
        table.signal(9999, b"late".to_vec());
        assert_eq!(table.outstanding(), 0);
    }

    #[tokio::test]
    async fn freed_token_never_reports_signalled() {
        let table = TokenTable::new();
        let mut token = table.allocate().unwrap();
        let id = token.id();

        table.free(&token);
        table.signal(id, b"lost".to_vec());

        let payload = table.wait(&mut token, Duration::from_millis(30)).await;
        assert_eq!(payload, None);
    }
}
