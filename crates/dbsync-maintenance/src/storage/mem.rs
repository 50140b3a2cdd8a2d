use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    ApplyOutcome, CollectionInfo, LocalStorage, ShardChange, StorageError, StorageResult,
    shard_change,
};
use crate::action::{Action, ActionVerb};
use crate::model::{LocalDatabase, LocalSnapshot, ResourceKey};

/// Kind of failure injected into [`MemStorage::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Transient,
    Permanent,
}

/// In-memory storage engine with fault injection and execution accounting.
#[derive(Clone, Default)]
pub struct MemStorage {
    inner: Arc<Mutex<MemState>>,
}

#[derive(Default)]
struct MemState {
    local: LocalSnapshot,
    applied: Vec<Action>,
    faults: HashMap<ResourceKey, (Fault, usize)>,
    failing_listings: usize,
    apply_delay: Duration,
    in_flight: HashMap<ResourceKey, usize>,
    in_flight_total: usize,
    max_in_flight_per_key: usize,
    max_in_flight_total: usize,
}

impl std::fmt::Debug for MemStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock().unwrap();
        f.debug_struct("MemStorage")
            .field("databases", &state.local.databases.len())
            .field("applied", &state.applied.len())
            .finish()
    }
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(local: LocalSnapshot) -> Self {
        let storage = Self::default();
        storage.inner.lock().unwrap().local = local;
        storage
    }

    pub fn snapshot(&self) -> LocalSnapshot {
        self.inner.lock().unwrap().local.clone()
    }

    /// Every action that reached the engine, in call order, failed or not.
    pub fn applied(&self) -> Vec<Action> {
        self.inner.lock().unwrap().applied.clone()
    }

    pub fn apply_count(&self) -> usize {
        self.inner.lock().unwrap().applied.len()
    }

    /// Fail the next `times` applies for `key` with the given fault.
    pub fn fail_key(&self, key: ResourceKey, fault: Fault, times: usize) {
        let mut state = self.inner.lock().unwrap();
        if times == 0 {
            state.faults.remove(&key);
        } else {
            state.faults.insert(key, (fault, times));
        }
    }

    /// Fail the next `times` listing calls.
    pub fn fail_listings(&self, times: usize) {
        self.inner.lock().unwrap().failing_listings = times;
    }

    /// Hold every apply for `delay` before it takes effect.
    pub fn set_apply_delay(&self, delay: Duration) {
        self.inner.lock().unwrap().apply_delay = delay;
    }

    /// Highest number of concurrent applies observed for a single key.
    pub fn max_in_flight_per_key(&self) -> usize {
        self.inner.lock().unwrap().max_in_flight_per_key
    }

    /// Highest number of concurrent applies observed overall.
    pub fn max_in_flight(&self) -> usize {
        self.inner.lock().unwrap().max_in_flight_total
    }

    fn check_listing(&self) -> StorageResult<()> {
        let mut state = self.inner.lock().unwrap();
        if state.failing_listings > 0 {
            state.failing_listings -= 1;
            return Err(StorageError::Transient("injected listing failure".into()));
        }
        Ok(())
    }

    fn begin(&self, action: &Action) -> (InFlight, Duration) {
        let mut state = self.inner.lock().unwrap();
        state.applied.push(action.clone());
        let per_key = {
            let count = state.in_flight.entry(action.key.clone()).or_default();
            *count += 1;
            *count
        };
        state.in_flight_total += 1;
        state.max_in_flight_per_key = state.max_in_flight_per_key.max(per_key);
        state.max_in_flight_total = state.max_in_flight_total.max(state.in_flight_total);
        let guard = InFlight {
            inner: self.inner.clone(),
            key: action.key.clone(),
        };
        (guard, state.apply_delay)
    }

    fn take_fault(&self, key: &ResourceKey) -> Option<Fault> {
        let mut state = self.inner.lock().unwrap();
        let (fault, remaining) = state.faults.get_mut(key)?;
        let fault = *fault;
        *remaining -= 1;
        if *remaining == 0 {
            state.faults.remove(key);
        }
        Some(fault)
    }

    fn commit(&self, action: &Action) -> StorageResult<ApplyOutcome> {
        let mut state = self.inner.lock().unwrap();
        let local = &mut state.local;
        let key = &action.key;
        match action.verb {
            ActionVerb::CreateDatabase => {
                if local.has_database(&key.database) {
                    return Ok(ApplyOutcome::AlreadyConverged);
                }
                local
                    .databases
                    .insert(key.database.clone(), LocalDatabase::default());
                Ok(ApplyOutcome::Applied)
            }
            ActionVerb::DropDatabase => match local.databases.remove(&key.database) {
                Some(_) => Ok(ApplyOutcome::Applied),
                None => Ok(ApplyOutcome::AlreadyConverged),
            },
            _ => {
                let shard = key.shard.clone().unwrap_or_default();
                let Some(db) = local.databases.get_mut(&key.database) else {
                    if action.verb == ActionVerb::DropCollection {
                        return Ok(ApplyOutcome::AlreadyConverged);
                    }
                    return Err(StorageError::DatabaseNotFound(key.database.clone()));
                };
                match shard_change(db.collections.get(&shard), action)? {
                    ShardChange::Unchanged => Ok(ApplyOutcome::AlreadyConverged),
                    ShardChange::Put(next) => {
                        db.collections.insert(shard, next);
                        Ok(ApplyOutcome::Applied)
                    }
                    ShardChange::Remove => {
                        db.collections.remove(&shard);
                        Ok(ApplyOutcome::Applied)
                    }
                }
            }
        }
    }
}

/// Decrements in-flight counters when an apply ends, even if cancelled.
struct InFlight {
    inner: Arc<Mutex<MemState>>,
    key: ResourceKey,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut state = self.inner.lock().unwrap();
        state.in_flight_total -= 1;
        if let Some(count) = state.in_flight.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                state.in_flight.remove(&self.key);
            }
        }
    }
}

#[async_trait]
impl LocalStorage for MemStorage {
    async fn list_databases(&self) -> StorageResult<Vec<String>> {
        self.check_listing()?;
        let state = self.inner.lock().unwrap();
        Ok(state.local.databases.keys().cloned().collect())
    }

    async fn list_collections(&self, database: &str) -> StorageResult<Vec<CollectionInfo>> {
        self.check_listing()?;
        let state = self.inner.lock().unwrap();
        let db = state
            .local
            .databases
            .get(database)
            .ok_or_else(|| StorageError::DatabaseNotFound(database.to_string()))?;
        Ok(db
            .collections
            .iter()
            .map(|(name, details)| CollectionInfo {
                name: name.clone(),
                details: details.clone(),
            })
            .collect())
    }

    async fn apply(&self, action: &Action) -> StorageResult<ApplyOutcome> {
        let (_in_flight, delay) = self.begin(action);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match self.take_fault(&action.key) {
            Some(Fault::Transient) => Err(StorageError::Transient(format!(
                "injected transient failure for {action}"
            ))),
            Some(Fault::Permanent) => Err(StorageError::Permanent {
                code: 1104,
                message: format!("injected permanent failure for {action}"),
            }),
            None => self.commit(action),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn create_then_repeat_is_converged() {
        let storage = MemStorage::new();
        let create_db = Action::new(
            ResourceKey::database("db"),
            ActionVerb::CreateDatabase,
            json!({ "name": "db" }),
        );
        assert_eq!(storage.apply(&create_db).await.unwrap(), ApplyOutcome::Applied);
        assert_eq!(
            storage.apply(&create_db).await.unwrap(),
            ApplyOutcome::AlreadyConverged
        );

        let create_shard = Action::new(
            ResourceKey::shard("db", "s100"),
            ActionVerb::CreateCollection,
            json!({ "planId": "100", "theLeader": "", "followers": [] }),
        );
        assert_eq!(
            storage.apply(&create_shard).await.unwrap(),
            ApplyOutcome::Applied
        );
        assert!(storage.snapshot().collection("db", "s100").is_some());
        assert_eq!(storage.apply_count(), 3);
    }

    #[tokio::test]
    async fn shard_in_missing_database_is_transient() {
        let storage = MemStorage::new();
        let action = Action::new(
            ResourceKey::shard("gone", "s1"),
            ActionVerb::CreateCollection,
            json!({ "planId": "1" }),
        );
        let err = storage.apply(&action).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn injected_faults_run_out() {
        let storage = MemStorage::new();
        let key = ResourceKey::database("db");
        storage.fail_key(key.clone(), Fault::Transient, 2);
        let action = Action::new(key, ActionVerb::CreateDatabase, json!({ "name": "db" }));
        assert!(storage.apply(&action).await.is_err());
        assert!(storage.apply(&action).await.is_err());
        assert_eq!(storage.apply(&action).await.unwrap(), ApplyOutcome::Applied);
    }
}
