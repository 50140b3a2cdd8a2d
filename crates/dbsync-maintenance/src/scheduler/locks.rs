//! Per-resource mutual exclusion.
//!
//! Locks are created on first use and removed when the last holder or waiter
//! lets go, so the table only ever holds keys with work in flight.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::model::ResourceKey;

#[derive(Debug, Default)]
pub(crate) struct KeyLocks {
    table: Mutex<HashMap<ResourceKey, Arc<AsyncMutex<()>>>>,
}

impl KeyLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Wait until `key` is free and hold it until the guard drops.
    pub(crate) async fn lock(self: &Arc<Self>, key: &ResourceKey) -> KeyGuard {
        let slot = {
            let mut table = self.table.lock().unwrap();
            table.entry(key.clone()).or_default().clone()
        };
        let guard = slot.lock_owned().await;
        KeyGuard {
            locks: self.clone(),
            key: key.clone(),
            guard: Some(guard),
        }
    }

    /// Number of keys currently locked or waited on.
    pub(crate) fn len(&self) -> usize {
        self.table.lock().unwrap().len()
    }

    fn release(&self, key: &ResourceKey, guard: OwnedMutexGuard<()>) {
        let mut table = self.table.lock().unwrap();
        drop(guard);
        // One reference lives in the table; any other is a waiter.
        let idle = table
            .get(key)
            .is_some_and(|slot| Arc::strong_count(slot) == 1);
        if idle {
            table.remove(key);
        }
    }
}

pub(crate) struct KeyGuard {
    locks: Arc<KeyLocks>,
    key: ResourceKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            self.locks.release(&self.key, guard);
        }
    }
}
