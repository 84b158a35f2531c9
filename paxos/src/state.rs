//! The gossiped Paxos state and its merge rule.

use std::collections::BTreeMap;

use cadastre_core::{PeerName, PeerUid};
use serde::{Deserialize, Serialize};

/// The value under agreement: the peers that will seed the ring.
pub type Value = Vec<PeerName>;

/// Identity of an electing node.
///
/// The uid distinguishes restarts: a node that crashes mid-election and
/// comes back must not be mistaken for its former self, or it could break
/// its own promises.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct NodeId {
    pub name: PeerName,
    pub uid: PeerUid,
}

impl NodeId {
    #[must_use]
    pub fn new(name: PeerName, uid: PeerUid) -> Self {
        Self { name, uid }
    }
}

/// A ballot: proposal round plus proposer, ordered lexicographically.
///
/// Round zero is the null ballot; no proposal ever carries it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Ballot {
    pub round: u64,
    pub proposer: NodeId,
}

impl Ballot {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.round > 0
    }
}

/// One node's promise and acceptance, as authored by that node.
///
/// Only the node itself ever writes its entry; everyone else copies it
/// around. Both fields advance monotonically, so of two copies the one with
/// the greater `(promised, accepted)` pair is the newer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeState {
    /// Highest ballot this node has promised not to undercut.
    pub promised: Ballot,
    /// Highest ballot this node has accepted, null if none.
    pub accepted: Ballot,
    /// The value accepted at `accepted`; empty while `accepted` is null.
    pub value: Value,
}

impl NodeState {
    /// True if `self` is a newer version of the same node's state than
    /// `other`.
    #[must_use]
    pub fn supersedes(&self, other: &NodeState) -> bool {
        self.promised > other.promised || self.accepted > other.accepted
    }
}

/// Everything a participant knows about the election, keyed by node.
pub type GossipState = BTreeMap<NodeId, NodeState>;

/// Merge `other` into `ours`, keeping the newer copy of every node's entry.
/// Returns true iff `ours` changed.
pub(crate) fn merge(ours: &mut GossipState, other: &GossipState) -> bool {
    let mut changed = false;
    for (id, theirs) in other {
        match ours.get_mut(id) {
            None => {
                ours.insert(*id, theirs.clone());
                changed = true;
            }
            Some(current) if theirs.supersedes(current) => {
                *current = theirs.clone();
                changed = true;
            }
            Some(_) => {}
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(n: u64) -> NodeId {
        NodeId::new(PeerName(n), PeerUid(n))
    }

    fn ballot(round: u64, proposer: u64) -> Ballot {
        Ballot {
            round,
            proposer: node(proposer),
        }
    }

    #[test]
    fn ballots_order_by_round_then_proposer() {
        assert!(ballot(2, 1) > ballot(1, 9));
        assert!(ballot(1, 2) > ballot(1, 1));
        assert!(!Ballot::default().is_valid());
        assert!(ballot(1, 1).is_valid());
    }

    #[test]
    fn newer_state_supersedes() {
        let old = NodeState {
            promised: ballot(1, 1),
            ..NodeState::default()
        };
        let new = NodeState {
            promised: ballot(2, 1),
            ..NodeState::default()
        };
        assert!(new.supersedes(&old));
        assert!(!old.supersedes(&new));
        assert!(!old.supersedes(&old.clone()));
    }

    #[test]
    fn merge_keeps_newest_of_each_entry() {
        let mut ours = GossipState::new();
        ours.insert(
            node(1),
            NodeState {
                promised: ballot(3, 1),
                ..NodeState::default()
            },
        );

        let mut other = GossipState::new();
        other.insert(
            node(1),
            NodeState {
                promised: ballot(1, 1),
                ..NodeState::default()
            },
        );
        other.insert(node(2), NodeState::default());

        assert!(merge(&mut ours, &other));
        assert_eq!(ours[&node(1)].promised, ballot(3, 1));
        assert!(ours.contains_key(&node(2)));

        // Merging the same state again changes nothing.
        assert!(!merge(&mut ours, &other));
    }
}
