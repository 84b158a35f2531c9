//! Persistence shim over the fjall embedded key-value store.
//!
//! Three postcard-encoded values live in a single `ipam` keyspace:
//! our peer name, the ring, and the per-container owned-address map. The
//! peer name and the ring belong together (a ring only makes sense for the
//! identity that persisted it), so [`Store::save_identity`] writes both
//! before one durability barrier.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use fjall::{Database, Keyspace, KeyspaceCreateOptions, PersistMode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use cadastre_core::{decode, encode, Cidr, CodecError, PeerName};

use crate::ring::Ring;

const NAME_KEY: &str = "peername";
const RING_KEY: &str = "ring";
const OWNED_KEY: &str = "ownedAddresses";

/// Persistence failure. Callers treat these as fatal.
#[derive(Debug)]
pub enum StoreError {
    Backend(fjall::Error),
    Codec(CodecError),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Backend(e) => write!(f, "storage backend error: {e}"),
            StoreError::Codec(e) => write!(f, "stored value corrupt: {e}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Backend(e) => Some(e),
            StoreError::Codec(e) => Some(e),
        }
    }
}

impl From<fjall::Error> for StoreError {
    fn from(e: fjall::Error) -> Self {
        StoreError::Backend(e)
    }
}

impl From<CodecError> for StoreError {
    fn from(e: CodecError) -> Self {
        StoreError::Codec(e)
    }
}

/// Handle on the allocator's on-disk state.
pub struct Store {
    db: Database,
    ipam: Keyspace,
}

impl Store {
    /// Open or create the database at `path`.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::builder(path.as_ref()).open()?;
        let ipam = db.keyspace("ipam", KeyspaceCreateOptions::default)?;
        Ok(Self { db, ipam })
    }

    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.ipam.get(key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        self.ipam.insert(key, &encode(value)?)?;
        Ok(())
    }

    /// The peer name a previous run persisted, if any.
    ///
    /// # Errors
    /// Backend or decoding failure.
    pub fn load_peer_name(&self) -> Result<Option<PeerName>, StoreError> {
        self.get(NAME_KEY)
    }

    /// The persisted ring, if any.
    ///
    /// # Errors
    /// Backend or decoding failure.
    pub fn load_ring(&self) -> Result<Option<Ring>, StoreError> {
        self.get(RING_KEY)
    }

    /// The persisted container ownership map, if any.
    ///
    /// # Errors
    /// Backend or decoding failure.
    pub fn load_owned(&self) -> Result<Option<BTreeMap<String, Vec<Cidr>>>, StoreError> {
        self.get(OWNED_KEY)
    }

    /// Persist our name and ring together, then make both durable.
    ///
    /// # Errors
    /// Backend or encoding failure.
    pub fn save_identity(&self, name: PeerName, ring: &Ring) -> Result<(), StoreError> {
        self.put(NAME_KEY, &name)?;
        self.put(RING_KEY, ring)?;
        self.db.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    /// Persist the container ownership map.
    ///
    /// # Errors
    /// Backend or encoding failure.
    pub fn save_owned(&self, owned: &BTreeMap<String, Vec<Cidr>>) -> Result<(), StoreError> {
        self.put(OWNED_KEY, owned)?;
        self.db.persist(PersistMode::SyncAll)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadastre_core::{Addr, Range};

    fn ring() -> Ring {
        let mut r = Ring::new(Range::new(Addr(0), Addr(256)), PeerName(1));
        r.claim_for_peers(&[PeerName(1), PeerName(2)]);
        r
    }

    #[test]
    fn empty_store_has_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        assert!(store.load_peer_name().unwrap().is_none());
        assert!(store.load_ring().unwrap().is_none());
        assert!(store.load_owned().unwrap().is_none());
    }

    #[test]
    fn identity_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let ring = ring();
        store.save_identity(PeerName(1), &ring).unwrap();
        assert_eq!(store.load_peer_name().unwrap(), Some(PeerName(1)));
        assert_eq!(store.load_ring().unwrap(), Some(ring));
    }

    #[test]
    fn owned_map_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let mut owned = BTreeMap::new();
        owned.insert("c1".to_string(), vec![Cidr::host(Addr(42))]);
        store.save_owned(&owned).unwrap();
        assert_eq!(store.load_owned().unwrap(), Some(owned));
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let ring = ring();
        {
            let store = Store::open(dir.path()).unwrap();
            store.save_identity(PeerName(1), &ring).unwrap();
        }
        let store = Store::open(dir.path()).unwrap();
        assert_eq!(store.load_ring().unwrap(), Some(ring));
    }
}
