//! Per-address mutual exclusion.
//!
//! Operations on one address run their registry mutation and event
//! publication under that address's lock so they never interleave. Distinct
//! addresses never contend. Guards are never held across an await.

use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;

#[derive(Clone, Default)]
pub struct AddressLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl AddressLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for `address`.
    ///
    /// Not reentrant: `f` must not lock the same address again. The entry is
    /// dropped again once nobody holds or waits for it.
    pub fn with<R>(&self, address: &str, f: impl FnOnce() -> R) -> R {
        let lock = Arc::clone(&self.locks.entry(address.to_string()).or_default());
        let out = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };
        drop(lock);
        // Waiters clone the Arc under the shard lock, so a count of one means
        // the map holds the only reference.
        self.locks
            .remove_if(address, |_, lock| Arc::strong_count(lock) == 1);
        out
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
