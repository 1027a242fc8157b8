//! Per-key async mutexes.
//!
//! Services serialize read-modify-write cycles on one entity (a case, a
//! subject's geofence state, a match) by holding the key's guard for the
//! whole cycle. Operations spanning several entities take all their keys
//! through [`KeyedLocks::lock_many`], which acquires them in sorted order.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Prune idle entries once the registry grows past this many keys.
const PRUNE_THRESHOLD: usize = 1024;

/// Registry of one mutex per key.
#[derive(Clone, Default)]
pub struct KeyedLocks {
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

/// Holds every lock acquired by one call. Dropping it releases them.
pub struct KeyGuard {
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock a single key.
    pub async fn lock(&self, key: impl Into<String>) -> KeyGuard {
        self.lock_many(vec![key.into()]).await
    }

    /// Lock several keys. Keys are sorted and deduplicated first so two
    /// callers locking overlapping sets cannot deadlock.
    pub async fn lock_many(&self, mut keys: Vec<String>) -> KeyGuard {
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            let mutex = self.entry(key).await;
            guards.push(mutex.lock_owned().await);
        }
        KeyGuard { _guards: guards }
    }

    async fn entry(&self, key: String) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        if locks.len() > PRUNE_THRESHOLD {
            // Only the registry holds idle entries.
            locks.retain(|_, m| Arc::strong_count(m) > 1);
        }
        locks.entry(key).or_default().clone()
    }
}
