//! Randomized gossip-order elections.
//!
//! Drives a handful of nodes through proposals and pairwise state
//! exchanges in random order, checking the two things that matter:
//! no two nodes ever decide different values, and with full connectivity
//! everyone eventually decides.

use cadastre_core::{PeerName, PeerUid};
use cadastre_paxos::{Node, Value};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn cluster(n: u64, quorum: u32) -> Vec<Node> {
    (1..=n)
        .map(|i| Node::new(PeerName(i), PeerUid(i * 1000 + 1), quorum))
        .collect()
}

/// Exchange state from `from` to `to`, running the acceptor step on `to`.
fn gossip_one_way(nodes: &mut [Node], from: usize, to: usize) {
    let state = nodes[from].gossip_state().clone();
    nodes[to].update(&state);
    nodes[to].think();
}

fn decided(nodes: &[Node]) -> Vec<Option<Value>> {
    nodes.iter().map(Node::consensus).collect()
}

#[test]
fn random_gossip_orders_converge() {
    for seed in 0..32 {
        let mut rng = StdRng::seed_from_u64(seed);
        let n = rng.gen_range(2..=5);
        let quorum = (n / 2 + 1) as u32;
        let mut nodes = cluster(n, quorum);

        // A random subset proposes at the start, as happens when several
        // peers serve their first allocation at once.
        for i in 0..nodes.len() {
            if rng.gen_bool(0.6) {
                nodes[i].propose();
            }
        }
        nodes[0].propose(); // at least one proposer

        for _round in 0..200 {
            let from = rng.gen_range(0..nodes.len());
            let to = rng.gen_range(0..nodes.len());
            if from != to {
                gossip_one_way(&mut nodes, from, to);
            }

            // Safety: all decided values agree at every step.
            let values: Vec<Value> = decided(&nodes).into_iter().flatten().collect();
            for pair in values.windows(2) {
                assert_eq!(pair[0], pair[1], "divergent consensus, seed {seed}");
            }
        }

        // Liveness under full connectivity: flush state everywhere.
        for _ in 0..3 {
            for from in 0..nodes.len() {
                for to in 0..nodes.len() {
                    if from != to {
                        gossip_one_way(&mut nodes, from, to);
                    }
                }
            }
        }
        let values = decided(&nodes);
        assert!(
            values.iter().all(Option::is_some),
            "stalled election, seed {seed}: {values:?}"
        );
    }
}

#[test]
fn value_covers_every_elector_once_all_are_known() {
    let mut nodes = cluster(3, 2);

    // Everyone exchanges empty state first, so all three are known before
    // any ballot is cast.
    for from in 0..3 {
        for to in 0..3 {
            if from != to {
                gossip_one_way(&mut nodes, from, to);
            }
        }
    }
    nodes[1].propose();
    for _ in 0..3 {
        for from in 0..3 {
            for to in 0..3 {
                if from != to {
                    gossip_one_way(&mut nodes, from, to);
                }
            }
        }
    }

    let value = nodes[0].consensus().expect("decided");
    assert_eq!(value, vec![PeerName(1), PeerName(2), PeerName(3)]);
}
