//! The peer registry: authoritative address → connection record map.
//!
//! Shared between the orchestrator, the inbound correlator and session
//! watchers. Each call is atomic for its address; callers that need a
//! read-decide-write sequence to be atomic wrap it in
//! [`AddressLocks::with`](crate::AddressLocks::with).

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::record::{now_millis, ConnectionRecord, PeerState, RecordPatch};

/// Point-in-time copy of every registry entry, ordered by address.
pub type Snapshot = Vec<(String, ConnectionRecord)>;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A patch tried to create a record without a state. Only reachable when
    /// a record was removed between a caller's read and its write.
    #[error("cannot add {0} to the registry without a state")]
    MissingState(String),
}

#[derive(Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<DashMap<String, ConnectionRecord>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `patch` into the record for `address`, creating it if the patch
    /// carries a state.
    pub fn upsert(&self, address: &str, patch: RecordPatch) -> Result<(), RegistryError> {
        let now = now_millis();
        match self.peers.entry(address.to_string()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().apply(patch, now);
                Ok(())
            }
            Entry::Vacant(entry) => match ConnectionRecord::create(address, patch, now) {
                Some(record) => {
                    entry.insert(record);
                    Ok(())
                }
                None => Err(RegistryError::MissingState(address.to_string())),
            },
        }
    }

    pub fn get(&self, address: &str) -> Option<ConnectionRecord> {
        self.peers.get(address).map(|r| r.value().clone())
    }

    pub fn state(&self, address: &str) -> Option<PeerState> {
        self.peers.get(address).map(|r| r.state)
    }

    pub fn contains(&self, address: &str) -> bool {
        self.peers.contains_key(address)
    }

    pub fn remove(&self, address: &str) -> Option<ConnectionRecord> {
        self.peers.remove(address).map(|(_, record)| record)
    }

    /// First record whose key matches. Linear scan; peer counts are small.
    pub fn find_by_key(&self, key: &str) -> Option<(String, ConnectionRecord)> {
        self.peers
            .iter()
            .find(|entry| entry.value().key.as_deref() == Some(key))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
    }

    pub fn snapshot(&self) -> Snapshot {
        let mut entries: Snapshot = self
            .peers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&self) {
        self.peers.clear();
    }
}
