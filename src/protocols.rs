//! Protocol trait definitions for Fidium's networking layer.
//!
//! Traits are defined here separately from implementations to:
//! - Let the DHT engine run over any transport (and over scripted fakes in
//!   tests) without depending on the UDP implementation
//! - Keep the external name-record codec an interface the crate consumes,
//!   never something it implements
//! - Avoid circular dependencies between modules
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`PeerRpc`] | The `{ping, send, fetch}` capability a contact is reachable through |
//! | [`RecordCodec`] | External name-record wire format (consumed, not implemented here) |

use async_trait::async_trait;
use std::time::Duration;

use crate::dht::Entry;
use crate::identity::{Contact, Identifier};
use crate::messages::ConsumerId;
use crate::transport::TransportError;

/// Peer capability: everything the DHT engine needs from a transport.
///
/// `ping` and `send` are the wire primitives; `fetch` is the composed
/// request/response query built on `send` plus reply correlation.
#[async_trait]
pub trait PeerRpc: Send + Sync + 'static {
    /// Probe a peer for liveness. `Ok(None)` means no reply within the
    /// budget - unreachable, not an error.
    async fn ping(
        &self,
        to: &Contact,
        timeout: Duration,
    ) -> Result<Option<Duration>, TransportError>;

    /// Fire-and-forget delivery to a named logical consumer on the peer.
    async fn send(
        &self,
        to: &Contact,
        consumer: ConsumerId,
        payload: Vec<u8>,
    ) -> Result<(), TransportError>;

    /// Ask a peer for every entry it holds under `key`, waiting up to
    /// `wait` for the correlated reply.
    async fn fetch(
        &self,
        to: &Contact,
        key: Identifier,
        wait: Duration,
    ) -> Result<Vec<Entry>, TransportError>;
}

/// External name-record codec.
///
/// The record wire format lives outside this crate; resolution only needs
/// an opaque encode/decode pair. `decode_record` returns `None` for bytes
/// that do not form a valid record under the queried name.
pub trait RecordCodec {
    type Record;

    fn encode_record(&self, record: &Self::Record) -> Vec<u8>;

    fn decode_record(&self, name: &str, bytes: &[u8]) -> Option<Self::Record>;
}
