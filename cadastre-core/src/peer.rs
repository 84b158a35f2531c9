//! Peer identity.
//!
//! A peer is named by an opaque 64-bit [`PeerName`], stable across restarts,
//! plus a [`PeerUid`] drawn fresh at every process start so that a restarted
//! peer is distinguishable from its previous incarnation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Opaque, totally ordered peer identifier.
///
/// The textual form is sixteen lower-case hex digits in colon-separated
/// groups of four (`0000:0000:0000:002a`), used in logs and accepted back by
/// administrative commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct PeerName(pub u64);

impl fmt::Display for PeerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:04x}:{:04x}:{:04x}:{:04x}",
            (b >> 48) & 0xffff,
            (b >> 32) & 0xffff,
            (b >> 16) & 0xffff,
            b & 0xffff
        )
    }
}

impl FromStr for PeerName {
    type Err = ParsePeerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex: String = s.chars().filter(|c| *c != ':').collect();
        if hex.len() != 16 {
            return Err(ParsePeerError::new(s));
        }
        let value = u64::from_str_radix(&hex, 16).map_err(|_| ParsePeerError::new(s))?;
        Ok(PeerName(value))
    }
}

/// Failure to parse a [`PeerName`] from its textual form.
#[derive(Debug, Clone)]
pub struct ParsePeerError {
    input: String,
}

impl ParsePeerError {
    fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }
}

impl fmt::Display for ParsePeerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid peer name: {:?}", self.input)
    }
}

impl std::error::Error for ParsePeerError {}

/// Per-process-start unique id, distinguishing restarts of the same peer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct PeerUid(pub u64);

impl PeerUid {
    /// A fresh uid for this process start.
    #[must_use]
    pub fn random() -> Self {
        PeerUid(rand::random())
    }
}
