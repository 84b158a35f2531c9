//! Gossip wire format and the transport interface.
//!
//! # Protocol annex
//!
//! The transport length-frames messages; cadastre defines only the payload
//! bytes. A unicast payload is one tag byte followed by a postcard-encoded
//! structure:
//!
//! | tag | message                | payload                 |
//! |-----|------------------------|-------------------------|
//! | 0   | `SPACE_REQUEST`        | [`Range`]               |
//! | 1   | `RING_UPDATE`          | [`GossipBlob`]          |
//! | 2   | `SPACE_REQUEST_DENIED` | [`Range`]               |
//!
//! Broadcast payloads are a bare [`GossipBlob`] with no tag byte.
//!
//! Postcard is stable and non-self-describing: integers are varint-encoded,
//! options are a presence byte, maps are a length followed by key/value
//! pairs, and fields appear in declaration order. Peers interoperate
//! because they agree on the structure definitions in this module; any
//! incompatible change to them needs a new tag space.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use cadastre_core::{decode, CodecError, PeerName, Range};
use cadastre_paxos::GossipState;

use crate::ring::{Ring, RingError};

/// Unicast tag: ask the receiver to donate space within a range.
pub const TAG_SPACE_REQUEST: u8 = 0;
/// Unicast tag: full state, sent point-to-point.
pub const TAG_RING_UPDATE: u8 = 1;
/// Unicast tag: the receiver's earlier space request cannot be served.
pub const TAG_SPACE_REQUEST_DENIED: u8 = 2;

/// A peer's full advertised state.
///
/// While a peer has no ring it advertises its Paxos view instead (observers
/// advertise neither, provoking a unicast ring update from peers that have
/// one). Nicknames ride along on every blob so that administrative commands
/// can name peers that have since left the mesh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipBlob {
    /// Sender wall clock, seconds. Decoded but not interpreted; kept for
    /// wire compatibility with older peers.
    pub now: i64,
    pub nicknames: BTreeMap<PeerName, String>,
    pub paxos: Option<GossipState>,
    pub ring: Option<Ring>,
}

/// A decoded unicast payload.
#[derive(Debug, Clone)]
pub enum UnicastMessage {
    SpaceRequest(Range),
    RingUpdate(Box<GossipBlob>),
    SpaceRequestDenied(Range),
}

/// Prepend `tag` to an encoded payload.
#[must_use]
pub fn frame(tag: u8, payload: &[u8]) -> Bytes {
    let mut framed = Vec::with_capacity(1 + payload.len());
    framed.push(tag);
    framed.extend_from_slice(payload);
    Bytes::from(framed)
}

/// Decode a unicast payload.
///
/// # Errors
/// [`GossipError::Codec`] on an empty or malformed payload,
/// [`GossipError::UnknownTag`] for tags outside the table above.
pub fn decode_unicast(payload: &[u8]) -> Result<UnicastMessage, GossipError> {
    let (&tag, rest) = payload
        .split_first()
        .ok_or(GossipError::Codec(CodecError::from(
            postcard::Error::DeserializeUnexpectedEnd,
        )))?;
    match tag {
        TAG_SPACE_REQUEST => Ok(UnicastMessage::SpaceRequest(decode(rest)?)),
        TAG_RING_UPDATE => Ok(UnicastMessage::RingUpdate(Box::new(decode(rest)?))),
        TAG_SPACE_REQUEST_DENIED => Ok(UnicastMessage::SpaceRequestDenied(decode(rest)?)),
        other => Err(GossipError::UnknownTag(other)),
    }
}

/// Failure while handling inbound gossip. Returned to the transport, which
/// decides whether to log or drop the peer; nothing here is fatal.
#[derive(Debug)]
pub enum GossipError {
    /// Payload would not decode.
    Codec(CodecError),
    /// Unicast tag outside the protocol table.
    UnknownTag(u8),
    /// The sender's ring cannot be merged with ours. `detail` names the
    /// peers involved where nicknames are known.
    Incompatible { source: RingError, detail: String },
}

impl fmt::Display for GossipError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GossipError::Codec(e) => write!(f, "undecodable gossip: {e}"),
            GossipError::UnknownTag(tag) => write!(f, "unknown unicast tag {tag}"),
            GossipError::Incompatible { detail, .. } => write!(f, "{detail}"),
        }
    }
}

impl std::error::Error for GossipError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GossipError::Codec(e) => Some(e),
            GossipError::UnknownTag(_) => None,
            GossipError::Incompatible { source, .. } => Some(source),
        }
    }
}

impl From<CodecError> for GossipError {
    fn from(e: CodecError) -> Self {
        GossipError::Codec(e)
    }
}

/// Outbound half of the gossip transport.
///
/// Both calls are non-blocking enqueues; delivery is best-effort and
/// unordered between peers. The transport feeds inbound traffic back
/// through the allocator handle's `on_unicast` / `on_broadcast` /
/// `on_gossip` methods.
pub trait Gossip: Send + 'static {
    /// Send our blob to every connected peer.
    fn broadcast(&mut self, blob: Bytes);

    /// Send a tagged message to one peer. Delivery to unknown or departed
    /// peers is silently dropped.
    fn unicast(&mut self, dst: PeerName, msg: Bytes);
}
