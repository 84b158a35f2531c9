//! Electing nodes, observers, and the participant wrapper.

use cadastre_core::{PeerName, PeerUid};

use crate::state::{merge, Ballot, GossipState, NodeId, NodeState, Value};

/// A full Paxos participant: proposer and acceptor in one.
#[derive(Debug, Clone)]
pub struct Node {
    id: NodeId,
    quorum: u32,
    knows: GossipState,
}

impl Node {
    /// A node that has seen nothing but itself. The own entry rides along
    /// on every gossiped state, so peers learn of each other's existence
    /// before any ballot is cast; the quorum is usually reconfigured later,
    /// immediately before the first proposal.
    #[must_use]
    pub fn new(name: PeerName, uid: PeerUid, quorum: u32) -> Self {
        let id = NodeId::new(name, uid);
        Self {
            id,
            quorum,
            knows: GossipState::from([(id, NodeState::default())]),
        }
    }

    pub fn set_quorum(&mut self, quorum: u32) {
        self.quorum = quorum.max(1);
    }

    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[must_use]
    pub fn gossip_state(&self) -> &GossipState {
        &self.knows
    }

    /// Start (or restart) a proposal: promise a ballot above everything we
    /// have seen, then run the acceptor logic, which with a quorum of one
    /// reaches consensus on the spot.
    pub fn propose(&mut self) {
        let top_round = self
            .knows
            .values()
            .flat_map(|s| [s.promised.round, s.accepted.round])
            .max()
            .unwrap_or(0);
        let ballot = Ballot {
            round: top_round + 1,
            proposer: self.id,
        };
        self.knows.entry(self.id).or_default().promised = ballot;
        self.think();
    }

    /// Merge a remote view of the election. Returns true iff we learned
    /// something.
    pub fn update(&mut self, other: &GossipState) -> bool {
        merge(&mut self.knows, other)
    }

    /// Run the promise/accept steps over the current view. Returns true iff
    /// our own state advanced, i.e. there is news worth broadcasting.
    /// Idempotent until the view changes again.
    pub fn think(&mut self) -> bool {
        let mut changed = false;

        // An acceptor promises the highest ballot in sight.
        let top = self
            .knows
            .values()
            .map(|s| s.promised)
            .max()
            .unwrap_or_default();
        {
            let ours = self.knows.entry(self.id).or_default();
            if top > ours.promised {
                ours.promised = top;
                changed = true;
            }
        }

        let outstanding = self.knows[&self.id].promised;
        if !outstanding.is_valid() || self.knows[&self.id].accepted >= outstanding {
            return changed;
        }

        // Accept: adopt a visible acceptance of the outstanding ballot, or,
        // if the ballot is ours and a quorum has promised it, accept our own
        // choice of value.
        let adopted = self
            .knows
            .values()
            .find(|s| s.accepted == outstanding)
            .map(|s| s.value.clone());
        let value = match adopted {
            Some(value) => Some(value),
            None if outstanding.proposer == self.id => {
                let promises = self
                    .knows
                    .values()
                    .filter(|s| s.promised == outstanding)
                    .count();
                (promises >= self.quorum as usize).then(|| self.choose_value())
            }
            None => None,
        };
        if let Some(value) = value {
            let ours = self.knows.entry(self.id).or_default();
            ours.accepted = outstanding;
            ours.value = value;
            changed = true;
        }
        changed
    }

    /// The value to accept when our own proposal wins its promises: the
    /// highest previously accepted value if one exists (Paxos obliges us to
    /// adopt it), else the names of every node taking part.
    fn choose_value(&self) -> Value {
        self.knows
            .values()
            .filter(|s| s.accepted.is_valid())
            .max_by_key(|s| s.accepted)
            .map(|s| s.value.clone())
            .unwrap_or_else(|| self.knows.keys().map(|id| id.name).collect())
    }

    /// Consensus is reached once a quorum have accepted the highest ballot
    /// anyone has accepted. Returns the sorted, deduplicated peer list.
    #[must_use]
    pub fn consensus(&self) -> Option<Value> {
        let highest = self
            .knows
            .values()
            .map(|s| s.accepted)
            .filter(Ballot::is_valid)
            .max()?;
        let accepts = self
            .knows
            .values()
            .filter(|s| s.accepted == highest)
            .count();
        if accepts < self.quorum as usize {
            return None;
        }
        let winner = self.knows.values().find(|s| s.accepted == highest)?;
        let mut value = winner.value.clone();
        value.sort_unstable();
        value.dedup();
        Some(value)
    }
}

/// A participant that follows an election without taking part.
///
/// Observers merge whatever they are shown, but never promise, accept or
/// propose, and they advertise no state of their own: a peer that receives
/// an empty paxos blob from an observer answers with a ring instead.
#[derive(Debug, Clone, Default)]
pub struct Observer {
    knows: GossipState,
}

impl Observer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, other: &GossipState) -> bool {
        merge(&mut self.knows, other)
    }
}

/// Either kind of participant, sharing the update/think/consensus contract.
#[derive(Debug, Clone)]
pub enum Participant {
    Node(Node),
    Observer(Observer),
}

impl Participant {
    #[must_use]
    pub fn node(name: PeerName, uid: PeerUid) -> Self {
        Participant::Node(Node::new(name, uid, 1))
    }

    #[must_use]
    pub fn observer() -> Self {
        Participant::Observer(Observer::new())
    }

    /// True for participants that may propose and seed rings on behalf of
    /// ring-less peers.
    #[must_use]
    pub fn is_node(&self) -> bool {
        matches!(self, Participant::Node(_))
    }

    pub fn set_quorum(&mut self, quorum: u32) {
        if let Participant::Node(node) = self {
            node.set_quorum(quorum);
        }
    }

    pub fn propose(&mut self) {
        if let Participant::Node(node) = self {
            node.propose();
        }
    }

    pub fn update(&mut self, other: &GossipState) -> bool {
        match self {
            Participant::Node(node) => node.update(other),
            Participant::Observer(observer) => observer.update(other),
        }
    }

    pub fn think(&mut self) -> bool {
        match self {
            Participant::Node(node) => node.think(),
            Participant::Observer(_) => false,
        }
    }

    /// Observers cannot judge consensus: they do not know the quorum. They
    /// receive the finished ring by unicast instead.
    #[must_use]
    pub fn consensus(&self) -> Option<Value> {
        match self {
            Participant::Node(node) => node.consensus(),
            Participant::Observer(_) => None,
        }
    }

    /// The state to gossip while ring-less; `None` for observers.
    #[must_use]
    pub fn gossip_state(&self) -> Option<GossipState> {
        match self {
            Participant::Node(node) => Some(node.gossip_state().clone()),
            Participant::Observer(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(n: u64, quorum: u32) -> Node {
        Node::new(PeerName(n), PeerUid(n * 100), quorum)
    }

    /// Gossip `from`'s state into `to`, running the acceptor step.
    fn gossip(from: &Node, to: &mut Node) -> bool {
        let updated = to.update(from.gossip_state());
        let thought = to.think();
        updated || thought
    }

    #[test]
    fn quorum_of_one_consenses_immediately() {
        let mut a = node(1, 1);
        a.propose();
        assert_eq!(a.consensus(), Some(vec![PeerName(1)]));
    }

    #[test]
    fn no_consensus_below_quorum() {
        let mut a = node(1, 2);
        a.propose();
        assert_eq!(a.consensus(), None);
    }

    #[test]
    fn three_nodes_elect_all_three() {
        let mut a = node(1, 2);
        let mut b = node(2, 2);
        let mut c = node(3, 2);

        // Everyone hears of everyone before any proposal, as happens when
        // allocation requests race on several peers at once.
        let mut seed = GossipState::new();
        for n in [&a, &b, &c] {
            seed.insert(n.id(), NodeState::default());
        }
        for n in [&mut a, &mut b, &mut c] {
            n.update(&seed);
        }

        a.propose();
        // a's ballot travels to b and back; the returning promise completes
        // the quorum and a accepts its own value.
        gossip(&a, &mut b);
        gossip(&b, &mut a);
        assert_eq!(
            a.consensus(),
            None,
            "one acceptance is not quorum-accepted yet"
        );

        // a's acceptance reaches b, which adopts it; b's echo gives a the
        // second acceptance.
        gossip(&a, &mut b);
        gossip(&b, &mut a);
        let value = a.consensus().expect("quorum accepted");
        assert_eq!(value, vec![PeerName(1), PeerName(2), PeerName(3)]);

        // c learns the outcome late but agrees.
        gossip(&a, &mut c);
        assert_eq!(c.consensus(), Some(value));
    }

    #[test]
    fn competing_proposals_agree_on_one_value() {
        let mut a = node(1, 2);
        let mut b = node(2, 2);

        a.propose();
        b.propose();

        // Exchange until quiet.
        for _ in 0..4 {
            gossip(&a, &mut b);
            gossip(&b, &mut a);
        }

        let va = a.consensus().expect("a consensus");
        let vb = b.consensus().expect("b consensus");
        assert_eq!(va, vb);
    }

    #[test]
    fn adopted_value_survives_higher_ballots() {
        let mut a = node(1, 1);
        a.propose();
        let decided = a.consensus().expect("immediate");

        // b arrives late with a higher round, but must adopt a's value.
        let mut b = node(2, 2);
        b.update(a.gossip_state());
        b.propose();
        for _ in 0..4 {
            gossip(&b, &mut a);
            gossip(&a, &mut b);
        }
        assert_eq!(b.consensus(), Some(decided));
    }

    #[test]
    fn observer_follows_but_never_speaks() {
        let mut a = node(1, 1);
        a.propose();

        let mut watcher = Participant::observer();
        assert!(watcher.update(a.gossip_state()));
        assert!(!watcher.think());
        assert_eq!(watcher.consensus(), None);
        assert!(watcher.gossip_state().is_none());
    }

    #[test]
    fn restarted_node_is_a_new_identity() {
        let before = Node::new(PeerName(7), PeerUid(1), 2);
        let after = Node::new(PeerName(7), PeerUid(2), 2);
        assert_ne!(before.id(), after.id());
    }
}
