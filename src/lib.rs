//! # Fidium - Peer-to-Peer Name Resolution
//!
//! Fidium resolves human-readable names to records through a peer-to-peer
//! network instead of a central authority. Nodes store key→value entries in
//! a flat distributed hash table; a client queries every peer it knows at
//! once and reconciles the conflicting answers with two independent checks:
//!
//! - **Authenticity**: a stored value can carry a signature binding it to
//!   its publisher's public key, verified against a hash pinned by the
//!   query name
//! - **Trust**: each peer in the local contact list carries an
//!   operator-assigned trust weight, and the verified answer from the
//!   highest-weighted peer wins
//!
//! ## Architecture
//!
//! Everything rides a single UDP socket with no reliable-delivery layer
//! beneath it: requests carry correlation tokens, replies are matched back
//! through a per-transport token table, and silence is a timeout. Queries
//! fan out to all known contacts concurrently under a primary budget, with
//! a longer grace window during which late replies still warm the cache.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `node` | High-level API combining transport and engine |
//! | `identity` | Identifiers and trust-weighted contacts |
//! | `messages` | Wire packet framing and consumer payloads |
//! | `tokens` | Correlation-token table for async replies |
//! | `transport` | UDP RPC layer: listener loop, ping, send, discovery |
//! | `dht` | Local store, bounded cache, broadcast query engine |
//! | `auth` | Record signing and envelope verification |
//! | `resolver` | Trust-weighted selection among verified entries |
//! | `protocols` | Trait seams: peer RPC capability, record codec |

mod auth;
mod dht;
mod identity;
mod messages;
mod node;
mod protocols;
mod resolver;
mod tokens;
mod transport;

pub use auth::{public_key_hash, sign_record, verify_record, Keypair};
pub use dht::{Dht, Entry, StoreStats, LATE_FETCH_GRACE, PRIMARY_FETCH_BUDGET};
pub use identity::{Contact, Identifier, ID_LEN};
pub use messages::ConsumerId;
pub use node::Node;
pub use protocols::{PeerRpc, RecordCodec};
pub use resolver::{decode_answer, resolve_trusted, TrustedAnswer};
pub use transport::{DataConsumer, TransportError, UdpTransport};
