//! # Identifiers and Contacts
//!
//! This module defines the core identity types used throughout Fidium:
//!
//! - [`Identifier`]: 512-bit opaque key, four 128-bit segments
//! - [`Contact`]: a known peer's identifier, UDP endpoint, and optional
//!   operator-assigned trust weight
//!
//! ## Identity Model
//!
//! An [`Identifier`] serves double duty: it names a node on the peer-to-peer
//! network and it keys entries in the distributed hash table. Record keys are
//! derived deterministically with [`Identifier::hash`], so every node maps
//! the same query to the same key without coordination.
//!
//! ## Trust Weights
//!
//! A trust weight is local, operator-assigned state attached to a contact in
//! this node's peer list. It expresses how much this operator believes the
//! peer's answers relative to others; an absent weight counts as zero.
//! Weights never travel on the wire (see [`Contact::trust_weight`]) - a peer
//! claiming its own weight would defeat the point.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Number of 128-bit segments in an identifier.
pub const ID_SEGMENTS: usize = 4;

/// Bytes per identifier segment.
pub const ID_SEGMENT_LEN: usize = 16;

/// Total identifier length in bytes (512 bits).
pub const ID_LEN: usize = ID_SEGMENTS * ID_SEGMENT_LEN;

/// Error raised when the system entropy source is unavailable.
///
/// This indicates a catastrophic platform failure; it should never occur on
/// a functioning system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntropyError {
    pub code: Option<u32>,
}

impl std::fmt::Display for EntropyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "CSPRNG unavailable (error code {})", code),
            None => write!(f, "CSPRNG unavailable"),
        }
    }
}

impl std::error::Error for EntropyError {}

impl From<getrandom::Error> for EntropyError {
    fn from(err: getrandom::Error) -> Self {
        Self {
            code: Some(err.code().get()),
        }
    }
}

/// 512-bit identifier used both as node identity and as DHT key.
///
/// Stored as four 128-bit segments; equality and ordering are plain byte
/// content. Immutable once constructed.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identifier([[u8; ID_SEGMENT_LEN]; ID_SEGMENTS]);

impl Identifier {
    /// Build an identifier from raw bytes.
    #[inline]
    pub fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        let mut segments = [[0u8; ID_SEGMENT_LEN]; ID_SEGMENTS];
        for (i, segment) in segments.iter_mut().enumerate() {
            segment.copy_from_slice(&bytes[i * ID_SEGMENT_LEN..(i + 1) * ID_SEGMENT_LEN]);
        }
        Self(segments)
    }

    /// Build an identifier from four 128-bit segments.
    #[inline]
    pub fn from_segments(segments: [[u8; ID_SEGMENT_LEN]; ID_SEGMENTS]) -> Self {
        Self(segments)
    }

    /// Derive an identifier deterministically from arbitrary bytes.
    ///
    /// This is how query names become DHT keys: every node hashing the same
    /// serialized question arrives at the same key. BLAKE3's extendable
    /// output fills the full 512 bits.
    pub fn hash(data: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(data);
        let mut out = [0u8; ID_LEN];
        hasher.finalize_xof().fill(&mut out);
        Self::from_bytes(out)
    }

    /// Generate a fresh random identifier from the system CSPRNG.
    pub fn random() -> Result<Self, EntropyError> {
        let mut out = [0u8; ID_LEN];
        getrandom::getrandom(&mut out)?;
        Ok(Self::from_bytes(out))
    }

    /// Flatten the identifier into its 64 raw bytes.
    #[inline]
    pub fn to_bytes(&self) -> [u8; ID_LEN] {
        let mut out = [0u8; ID_LEN];
        for (i, segment) in self.0.iter().enumerate() {
            out[i * ID_SEGMENT_LEN..(i + 1) * ID_SEGMENT_LEN].copy_from_slice(segment);
        }
        out
    }

    /// The four 128-bit segments.
    #[inline]
    pub fn segments(&self) -> &[[u8; ID_SEGMENT_LEN]; ID_SEGMENTS] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != ID_LEN {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; ID_LEN];
        arr.copy_from_slice(&bytes);
        Ok(Self::from_bytes(arr))
    }

    /// Short prefix for log output.
    pub(crate) fn log_prefix(&self) -> String {
        hex::encode(&self.to_bytes()[..8])
    }
}

impl std::fmt::Debug for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identifier({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; ID_LEN]> for Identifier {
    fn from(bytes: [u8; ID_LEN]) -> Self {
        Self::from_bytes(bytes)
    }
}

/// A known peer: identifier, UDP endpoint, and optional trust weight.
///
/// Contacts live in the DHT engine's peer list. Membership is mutable (peers
/// are added and removed), but an individual contact is immutable once
/// constructed.
///
/// The `network_id` tags which logical network the contact belongs to; it is
/// carried opaquely on the wire and plays no part in equality.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Contact {
    pub identifier: Identifier,
    pub network_id: [u8; 16],
    pub addr: SocketAddr,
    /// Operator-assigned trust weight; absent counts as zero.
    ///
    /// Never serialized: a weight is this node's private judgement of the
    /// peer, and anything a remote claimed for itself would be discarded
    /// anyway. Entries received from the network get their owner's weight
    /// rewritten from the local peer list.
    #[serde(skip)]
    pub trust_weight: Option<f64>,
}

impl Contact {
    /// Create a plain (unweighted) contact.
    pub fn new(identifier: Identifier, addr: SocketAddr) -> Self {
        Self {
            identifier,
            network_id: [0u8; 16],
            addr,
            trust_weight: None,
        }
    }

    /// Create a trust-weighted contact.
    pub fn trusted(identifier: Identifier, addr: SocketAddr, weight: f64) -> Self {
        Self {
            identifier,
            network_id: [0u8; 16],
            addr,
            trust_weight: Some(weight),
        }
    }

    pub fn with_network_id(mut self, network_id: [u8; 16]) -> Self {
        self.network_id = network_id;
        self
    }

    /// The effective trust weight; absent maps to zero.
    #[inline]
    pub fn weight(&self) -> f64 {
        self.trust_weight.unwrap_or(0.0)
    }
}

/// Two contacts are the same peer iff identifier, address, and port match.
impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.identifier == other.identifier && self.addr == other.addr
    }
}

impl Eq for Contact {}

impl std::hash::Hash for Contact {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.identifier.hash(state);
        self.addr.hash(state);
    }
}

impl std::fmt::Display for Contact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{ {} {} }}", self.addr, self.identifier.log_prefix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn hash_is_deterministic() {
        let a = Identifier::hash(b"www.example.p2p");
        let b = Identifier::hash(b"www.example.p2p");
        let c = Identifier::hash(b"www.other.p2p");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn byte_roundtrip_is_lossless() {
        let id = Identifier::hash(b"roundtrip");
        assert_eq!(Identifier::from_bytes(id.to_bytes()), id);

        let segments = *id.segments();
        assert_eq!(Identifier::from_segments(segments), id);
    }

    #[test]
    fn hex_roundtrip() {
        let id = Identifier::hash(b"hex");
        let hex = id.to_hex();

        assert_eq!(hex.len(), ID_LEN * 2);
        assert_eq!(Identifier::from_hex(&hex).unwrap(), id);
    }

    #[test]
    fn hex_rejects_invalid() {
        assert!(Identifier::from_hex("abcd").is_err());
        assert!(Identifier::from_hex(&"a".repeat(130)).is_err());
        assert!(Identifier::from_hex(&"g".repeat(128)).is_err());
    }

    #[test]
    fn random_identifiers_are_distinct() {
        let a = Identifier::random().unwrap();
        let b = Identifier::random().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn contact_equality_is_identifier_and_endpoint() {
        let id = Identifier::hash(b"peer");
        let other_id = Identifier::hash(b"other");

        let a = Contact::new(id, addr(9000));
        let b = Contact::trusted(id, addr(9000), 0.8);
        let c = Contact::new(id, addr(9001));
        let d = Contact::new(other_id, addr(9000));

        // Trust weight and network id play no part in equality.
        assert_eq!(a, b);
        assert_eq!(a, b.clone().with_network_id([7u8; 16]));
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn weight_defaults_to_zero() {
        let id = Identifier::hash(b"peer");
        assert_eq!(Contact::new(id, addr(9000)).weight(), 0.0);
        assert_eq!(Contact::trusted(id, addr(9000), 0.4).weight(), 0.4);
    }

    #[test]
    fn trust_weight_never_crosses_serialization() {
        let contact = Contact::trusted(Identifier::hash(b"peer"), addr(9000), 0.9);

        let bytes = bincode::serialize(&contact).unwrap();
        let decoded: Contact = bincode::deserialize(&bytes).unwrap();

        assert_eq!(decoded, contact);
        assert_eq!(decoded.trust_weight, None);
    }
}
