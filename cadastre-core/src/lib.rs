//! Cadastre core - shared primitive types
//!
//! This crate provides the types shared by every layer of the cadastre IPAM:
//! IPv4 address arithmetic ([`Addr`], [`Range`], [`Cidr`]), peer identity
//! ([`PeerName`], [`PeerUid`]), and the postcard codec helpers used for both
//! the gossip wire format and the persistence layer.

#![warn(clippy::pedantic)]

pub mod address;
pub mod codec;
pub mod peer;

pub use address::{Addr, Cidr, Count, ParseAddrError, Range};
pub use codec::{decode, encode, CodecError};
pub use peer::{ParsePeerError, PeerName, PeerUid};
