use std::time::Duration;

use tracing::debug;

use crate::config::InspectorConfig;
use crate::error::MaintenanceError;
use crate::model::{LocalDatabase, LocalSnapshot};
use crate::storage::DynStorage;

/// Builds [`LocalSnapshot`]s from the storage engine.
///
/// A snapshot is all-or-nothing: if any database or shard cannot be listed,
/// or enumeration exceeds the read timeout, the call fails instead of
/// returning partial data.
#[derive(Clone)]
pub struct LocalStateInspector {
    storage: DynStorage,
    read_timeout: Duration,
}

impl LocalStateInspector {
    pub fn new(storage: DynStorage, config: &InspectorConfig) -> Self {
        Self {
            storage,
            read_timeout: config.read_timeout,
        }
    }

    pub async fn snapshot(&self) -> Result<LocalSnapshot, MaintenanceError> {
        match tokio::time::timeout(self.read_timeout, self.enumerate()).await {
            Ok(result) => result,
            Err(_) => Err(MaintenanceError::SnapshotInconsistency(format!(
                "local enumeration exceeded {:?}",
                self.read_timeout
            ))),
        }
    }

    async fn enumerate(&self) -> Result<LocalSnapshot, MaintenanceError> {
        let names = self
            .storage
            .list_databases()
            .await
            .map_err(|e| MaintenanceError::local_read("list databases", e))?;
        let mut snapshot = LocalSnapshot::default();
        for name in names {
            let collections = self
                .storage
                .list_collections(&name)
                .await
                .map_err(|e| {
                    MaintenanceError::local_read(&format!("list shards of '{name}'"), e)
                })?;
            let mut database = LocalDatabase::default();
            for info in collections {
                database.collections.insert(info.name, info.details);
            }
            snapshot.databases.insert(name, database);
        }
        debug!(databases = snapshot.databases.len(), "sampled local state");
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::model::LocalCollection;
    use crate::storage::MemStorage;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn seeded() -> MemStorage {
        let mut local = LocalSnapshot::default();
        local.databases.insert(
            "db".into(),
            LocalDatabase {
                collections: BTreeMap::from([(
                    "s1".to_string(),
                    LocalCollection {
                        plan_id: "100".into(),
                        ..LocalCollection::default()
                    },
                )]),
            },
        );
        MemStorage::with_snapshot(local)
    }

    #[tokio::test]
    async fn snapshot_mirrors_storage() {
        let storage = seeded();
        let inspector =
            LocalStateInspector::new(Arc::new(storage.clone()), &InspectorConfig::default());
        assert_eq!(inspector.snapshot().await.unwrap(), storage.snapshot());
    }

    #[tokio::test]
    async fn any_listing_failure_fails_the_snapshot() {
        let storage = seeded();
        storage.fail_listings(1);
        let inspector = LocalStateInspector::new(Arc::new(storage), &InspectorConfig::default());
        let err = inspector.snapshot().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SnapshotInconsistency);
        // The next call sees the storage healthy again.
        assert!(inspector.snapshot().await.is_ok());
    }
}
