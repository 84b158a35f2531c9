//! Allocator configuration.

use cadastre_core::{PeerName, PeerUid, Range};

use crate::store::Store;

/// Everything an [`Allocator`](crate::Allocator) needs to start.
///
/// The two callbacks bridge to the mesh layer: `quorum` is polled once each
/// time ring establishment starts, `is_known_peer` whenever liveness
/// matters (claims against foreign owners, heir selection, nickname
/// pruning).
pub struct Config {
    pub our_name: PeerName,
    pub our_uid: PeerUid,
    pub our_nickname: String,
    /// Operator-supplied peer list for manual bootstrap; with `None` the
    /// first partition is agreed through Paxos instead.
    pub seed: Option<Vec<PeerName>>,
    pub universe: Range,
    /// Observers never propose and cannot seed a ring.
    pub is_observer: bool,
    pub quorum: Box<dyn Fn() -> u32 + Send>,
    pub is_known_peer: Box<dyn Fn(PeerName) -> bool + Send>,
    pub store: Store,
}
