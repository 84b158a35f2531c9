//! Single-decree Paxos over gossiped state.
//!
//! The cadastre ring needs exactly one agreement in its lifetime: which
//! peers take part in the first partition of the universe. This crate
//! implements that agreement as a pure state machine with no I/O and no
//! async. There are no prepare/accept RPCs; instead every participant
//! gossips its whole [`GossipState`] (a map from node identity to that
//! node's promise and acceptance) and merges what it receives. Promises and
//! acceptances propagate through merges exactly as they would through
//! messages, so the classic Paxos safety argument carries over.
//!
//! # Roles
//!
//! - A [`Node`] is a proposer and acceptor: it advances ballots, promises
//!   the highest ballot it has seen, accepts once a quorum of promises is
//!   visible, and detects consensus.
//! - An [`Observer`] merges state so it can follow an election but never
//!   proposes, never accepts, and advertises no state of its own - which
//!   provokes electing peers into unicasting the finished ring instead.
//!
//! The two share the update/think/consensus contract through the
//! [`Participant`] tagged variant.

#![warn(clippy::pedantic)]

mod participant;
mod state;

pub use participant::{Node, Observer, Participant};
pub use state::{Ballot, GossipState, NodeId, NodeState, Value};
