//! Cadastre - a distributed IP address manager.
//!
//! A cluster of peers administers one contiguous IPv4 range (the
//! *universe*). Ownership of every subrange is recorded in the [`Ring`], a
//! replicated structure that every peer gossips and merges; each peer hands
//! out addresses from its own ranges without any coordination, using its
//! local [`Space`] accounting. The very first partition of the universe is
//! agreed once through `cadastre-paxos`, after which the ring alone carries
//! all ownership changes.
//!
//! The [`Allocator`] actor ties the pieces together: it owns the ring, the
//! space, the container-ownership map and the pending-request queues, and is
//! driven by client calls through an [`AllocatorHandle`] and by gossip
//! traffic from the transport.

#![warn(clippy::pedantic)]

pub mod allocator;
pub mod config;
pub mod gossip;
mod operations;
pub mod ring;
pub mod space;
pub mod store;

pub use allocator::{AllocError, Allocator, AllocatorHandle};
pub use config::Config;
pub use gossip::{Gossip, GossipBlob, GossipError};
pub use ring::{Ring, RingError};
pub use space::{Space, SpaceError, MIN_SUBNET_SIZE};
pub use store::Store;

/// Cadence at which pending operations are retried and dead containers
/// harvested.
pub const TICK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

/// Grace period before the addresses of a dead container are reclaimed.
pub const CONTAINER_DIED_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);
