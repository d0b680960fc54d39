//! # Wire Protocol Messages
//!
//! This module defines the UDP wire format and the payload messages carried
//! inside it.
//!
//! ## Packet Layout
//!
//! Every datagram begins with one tag byte selecting the variant:
//!
//! | Tag | Packet | Body |
//! |-----|--------|------|
//! | 0 | `Ping` | contact, `i64` token |
//! | 1 | `Data` | contact, consumer id block, payload block |
//! | 2 | `WhoAreYou` | reply address block, `i32` port, `i64` unique number |
//! | 3 | `WhoAreYouReply` | `i64` unique number, identifier block |
//!
//! Every multi-byte integer is network byte order; every variable-length
//! field is preceded by its `i32` length. A contact serializes as
//! (identifier block, network-id block, `i32` port, address-octets block).
//! Receivers treat the contact fields as opaque beyond the ability to
//! round-trip them.
//!
//! ## Payloads
//!
//! `Data` payloads addressed to a consumer are application-defined. The DHT
//! fetch exchange serializes [`FetchRequest`] and entry lists with bincode
//! behind size-limited options - always deserialize untrusted bytes through
//! [`deserialize_bounded`].

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

use crate::identity::{Contact, Identifier, ID_LEN};

/// Largest datagram the transport will send or accept.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Maximum size of a `Data` payload.
/// Leaves headroom for the packet header inside a single datagram.
pub const MAX_PAYLOAD_SIZE: usize = 48 * 1024;

/// Maximum buffer size for bincode deserialization.
/// Slightly larger than MAX_PAYLOAD_SIZE to allow for framing overhead.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_PAYLOAD_SIZE as u64) + 4096;

/// Fixed acknowledgement payload returned for a ping.
pub const PING_ACK: [u8; 4] = [1, 3, 3, 7];

/// Packet tag bytes.
const TAG_PING: u8 = 0;
const TAG_DATA: u8 = 1;
const TAG_WHO_ARE_YOU: u8 = 2;
const TAG_WHO_ARE_YOU_REPLY: u8 = 3;

/// A logical consumer address on a remote node.
///
/// `Data` packets are dispatched by consumer id rather than by a fixed
/// message type, so independent subsystems can share one socket.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConsumerId(pub [u8; 16]);

impl std::fmt::Debug for ConsumerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConsumerId({})", hex::encode(self.0))
    }
}

/// Errors raised while decoding a datagram.
///
/// All of these mean the packet is dropped (logged, never fatal): a short
/// read, an unknown tag, or a length field that cannot be honored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// Datagram ended before the announced field did.
    Truncated,
    /// First byte is not a known packet tag.
    UnknownTag(u8),
    /// A length prefix was negative or larger than the datagram allows.
    InvalidLength(i32),
    /// An address block was neither 4 (IPv4) nor 16 (IPv6) octets.
    InvalidAddress(usize),
    /// A fixed-width field (identifier, network id, port) had the wrong size.
    InvalidField,
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::Truncated => write!(f, "datagram truncated"),
            WireError::UnknownTag(tag) => write!(f, "unknown packet tag {}", tag),
            WireError::InvalidLength(len) => write!(f, "invalid length prefix {}", len),
            WireError::InvalidAddress(len) => write!(f, "invalid address length {}", len),
            WireError::InvalidField => write!(f, "fixed-width field has wrong size"),
        }
    }
}

impl std::error::Error for WireError {}

/// One wire packet.
#[derive(Clone, Debug, PartialEq)]
pub enum Packet {
    /// Token-correlated liveness probe.
    Ping { source: Contact, token: i64 },
    /// Fire-and-forget delivery to a named consumer on the remote node.
    Data {
        source: Contact,
        consumer: ConsumerId,
        payload: Vec<u8>,
    },
    /// Discovery request: "tell me your identifier at this reply endpoint".
    WhoAreYou {
        reply_addr: IpAddr,
        reply_port: u16,
        unique: i64,
    },
    /// Discovery answer correlated by the requester's unique number.
    WhoAreYouReply { unique: i64, identifier: Identifier },
}

impl Packet {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);
        match self {
            Packet::Ping { source, token } => {
                buf.push(TAG_PING);
                write_contact(&mut buf, source);
                buf.extend_from_slice(&token.to_be_bytes());
            }
            Packet::Data {
                source,
                consumer,
                payload,
            } => {
                buf.push(TAG_DATA);
                write_contact(&mut buf, source);
                write_block(&mut buf, &consumer.0);
                write_block(&mut buf, payload);
            }
            Packet::WhoAreYou {
                reply_addr,
                reply_port,
                unique,
            } => {
                buf.push(TAG_WHO_ARE_YOU);
                write_addr(&mut buf, reply_addr);
                buf.extend_from_slice(&(*reply_port as i32).to_be_bytes());
                buf.extend_from_slice(&unique.to_be_bytes());
            }
            Packet::WhoAreYouReply { unique, identifier } => {
                buf.push(TAG_WHO_ARE_YOU_REPLY);
                buf.extend_from_slice(&unique.to_be_bytes());
                write_block(&mut buf, &identifier.to_bytes());
            }
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let mut reader = WireReader::new(data);
        let tag = reader.read_u8()?;
        match tag {
            TAG_PING => {
                let source = read_contact(&mut reader)?;
                let token = reader.read_i64()?;
                Ok(Packet::Ping { source, token })
            }
            TAG_DATA => {
                let source = read_contact(&mut reader)?;
                let consumer_bytes = reader.read_block()?;
                let consumer = ConsumerId(
                    <[u8; 16]>::try_from(consumer_bytes).map_err(|_| WireError::InvalidField)?,
                );
                let payload = reader.read_block()?.to_vec();
                if payload.len() > MAX_PAYLOAD_SIZE {
                    return Err(WireError::InvalidLength(payload.len() as i32));
                }
                Ok(Packet::Data {
                    source,
                    consumer,
                    payload,
                })
            }
            TAG_WHO_ARE_YOU => {
                let reply_addr = read_addr(&mut reader)?;
                let reply_port = reader.read_port()?;
                let unique = reader.read_i64()?;
                Ok(Packet::WhoAreYou {
                    reply_addr,
                    reply_port,
                    unique,
                })
            }
            TAG_WHO_ARE_YOU_REPLY => {
                let unique = reader.read_i64()?;
                let id_bytes = reader.read_block()?;
                let identifier = Identifier::from_bytes(
                    <[u8; ID_LEN]>::try_from(id_bytes).map_err(|_| WireError::InvalidField)?,
                );
                Ok(Packet::WhoAreYouReply { unique, identifier })
            }
            other => Err(WireError::UnknownTag(other)),
        }
    }
}

// ============================================================================
// Field-level encoding helpers
// ============================================================================

fn write_block(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(&(data.len() as i32).to_be_bytes());
    buf.extend_from_slice(data);
}

fn write_addr(buf: &mut Vec<u8>, addr: &IpAddr) {
    match addr {
        IpAddr::V4(v4) => write_block(buf, &v4.octets()),
        IpAddr::V6(v6) => write_block(buf, &v6.octets()),
    }
}

fn write_contact(buf: &mut Vec<u8>, contact: &Contact) {
    write_block(buf, &contact.identifier.to_bytes());
    write_block(buf, &contact.network_id);
    buf.extend_from_slice(&(contact.addr.port() as i32).to_be_bytes());
    write_addr(buf, &contact.addr.ip());
}

fn read_addr(reader: &mut WireReader<'_>) -> Result<IpAddr, WireError> {
    let octets = reader.read_block()?;
    match octets.len() {
        4 => {
            let arr = <[u8; 4]>::try_from(octets).map_err(|_| WireError::InvalidField)?;
            Ok(IpAddr::from(arr))
        }
        16 => {
            let arr = <[u8; 16]>::try_from(octets).map_err(|_| WireError::InvalidField)?;
            Ok(IpAddr::from(arr))
        }
        other => Err(WireError::InvalidAddress(other)),
    }
}

fn read_contact(reader: &mut WireReader<'_>) -> Result<Contact, WireError> {
    let id_bytes = reader.read_block()?;
    let identifier = Identifier::from_bytes(
        <[u8; ID_LEN]>::try_from(id_bytes).map_err(|_| WireError::InvalidField)?,
    );

    let net_id_bytes = reader.read_block()?;
    let network_id = <[u8; 16]>::try_from(net_id_bytes).map_err(|_| WireError::InvalidField)?;

    let port = reader.read_port()?;
    let ip = read_addr(reader)?;

    Ok(Contact::new(identifier, SocketAddr::new(ip, port)).with_network_id(network_id))
}

/// Cursor over a received datagram.
struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.buf.len() - self.pos < n {
            return Err(WireError::Truncated);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn read_i32(&mut self) -> Result<i32, WireError> {
        let bytes = self.take(4)?;
        Ok(i32::from_be_bytes(bytes.try_into().expect("4-byte slice")))
    }

    fn read_i64(&mut self) -> Result<i64, WireError> {
        let bytes = self.take(8)?;
        Ok(i64::from_be_bytes(bytes.try_into().expect("8-byte slice")))
    }

    fn read_port(&mut self) -> Result<u16, WireError> {
        let raw = self.read_i32()?;
        u16::try_from(raw).map_err(|_| WireError::InvalidField)
    }

    /// Read one `i32`-length-prefixed field.
    fn read_block(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.read_i32()?;
        if len < 0 || len as usize > MAX_DATAGRAM_SIZE {
            return Err(WireError::InvalidLength(len));
        }
        self.take(len as usize)
    }
}

// ============================================================================
// Consumer payloads
// ============================================================================

/// Returns bincode options with size limits enforced.
/// Always use this for deserialization of bytes received from the network.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

/// Ask a peer for every entry it holds under a key.
///
/// The reply comes back through the callback consumer tagged with
/// `reply_token`, carrying a bincode-encoded entry list.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchRequest {
    pub reply_token: i64,
    pub key: Identifier,
}

/// Frame a callback payload: the correlation token followed by the body.
pub fn encode_callback(token: i64, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + body.len());
    buf.extend_from_slice(&token.to_be_bytes());
    buf.extend_from_slice(body);
    buf
}

/// Split a callback payload into its correlation token and body.
pub fn split_callback(payload: &[u8]) -> Result<(i64, &[u8]), WireError> {
    if payload.len() < 8 {
        return Err(WireError::Truncated);
    }
    let token = i64::from_be_bytes(payload[..8].try_into().expect("8-byte slice"));
    Ok((token, &payload[8..]))
}
