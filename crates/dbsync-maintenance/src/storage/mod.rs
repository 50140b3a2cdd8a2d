//! Local storage engine seam plus filesystem and in-memory backends.
//!
//! The engine that actually creates and drops databases and shards is
//! external; the controller only needs enumeration and an idempotent apply.

mod fs;
mod mem;

pub use fs::FsStorage;
pub use mem::{Fault, MemStorage};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::action::{Action, ActionVerb};
use crate::model::LocalCollection;

pub type StorageResult<T> = Result<T, StorageError>;
pub type DynStorage = Arc<dyn LocalStorage>;

/// A shard of one local database, as listed by the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionInfo {
    pub name: String,
    pub details: LocalCollection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The resource was already in the requested state.
    AlreadyConverged,
}

/// Trait implemented by all local storage backends.
///
/// `apply` must be idempotent: repeating an action that already took effect
/// returns [`ApplyOutcome::AlreadyConverged`] instead of an error.
#[async_trait]
pub trait LocalStorage: Send + Sync {
    async fn list_databases(&self) -> StorageResult<Vec<String>>;
    async fn list_collections(&self, database: &str) -> StorageResult<Vec<CollectionInfo>>;
    async fn apply(&self, action: &Action) -> StorageResult<ApplyOutcome>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("database '{0}' not found")]
    DatabaseNotFound(String),
    #[error("collection '{0}' not found")]
    CollectionNotFound(String),
    #[error("storage temporarily unavailable: {0}")]
    Transient(String),
    #[error("storage error {code}: {message}")]
    Permanent { code: i64, message: String },
    #[error("I/O error at {path:?}: {message}")]
    Io { path: PathBuf, message: String },
    #[error("invalid payload for {verb}: {message}")]
    Payload { verb: ActionVerb, message: String },
    #[error("storage call timed out after {0:?}")]
    Timeout(Duration),
}

impl StorageError {
    /// Whether the same action may succeed when retried later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::DatabaseNotFound(_)
                | StorageError::Transient(_)
                | StorageError::Io { .. }
                | StorageError::Timeout(_)
        )
    }

    /// Numeric error code reported in Current next to the message.
    pub fn error_num(&self) -> i64 {
        match self {
            StorageError::DatabaseNotFound(_) => 1228,
            StorageError::CollectionNotFound(_) => 1203,
            StorageError::Transient(_) => 1,
            StorageError::Permanent { code, .. } => *code,
            StorageError::Io { .. } => 2,
            StorageError::Payload { .. } => 10,
            StorageError::Timeout(_) => 18,
        }
    }
}

pub(crate) fn io_error(path: impl Into<PathBuf>, err: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.into(),
        message: err.to_string(),
    }
}

/// What a shard-level action does to the stored shard.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ShardChange {
    Unchanged,
    Put(LocalCollection),
    Remove,
}

/// Next state of one shard under `action`, given its current state.
///
/// Shared by every backend so they agree on idempotence.
pub(crate) fn shard_change(
    current: Option<&LocalCollection>,
    action: &Action,
) -> StorageResult<ShardChange> {
    let shard = action.key.shard.as_deref().unwrap_or_default();
    match (action.verb, current) {
        (ActionVerb::CreateCollection, Some(_)) => Ok(ShardChange::Unchanged),
        (ActionVerb::CreateCollection, None) => {
            let desired: LocalCollection =
                serde_json::from_value(action.payload.clone()).map_err(|e| {
                    StorageError::Payload {
                        verb: action.verb,
                        message: e.to_string(),
                    }
                })?;
            Ok(ShardChange::Put(desired))
        }
        (ActionVerb::DropCollection, Some(_)) => Ok(ShardChange::Remove),
        (ActionVerb::DropCollection, None) => Ok(ShardChange::Unchanged),
        (ActionVerb::UpdateCollection, Some(existing)) => {
            let changes = action
                .payload
                .get("properties")
                .and_then(Value::as_object)
                .ok_or_else(|| StorageError::Payload {
                    verb: action.verb,
                    message: "missing 'properties' object".into(),
                })?;
            let mut next = existing.clone();
            for (name, value) in changes {
                next.properties.insert(name.clone(), value.clone());
            }
            Ok(changed_or_unchanged(existing, next))
        }
        (ActionVerb::ModifyLeadership, Some(existing)) => {
            let leader = action
                .payload
                .get("theLeader")
                .and_then(Value::as_str)
                .ok_or_else(|| StorageError::Payload {
                    verb: action.verb,
                    message: "missing 'theLeader' string".into(),
                })?;
            let mut next = existing.clone();
            if next.leader != leader {
                next.leader = leader.to_string();
                // Follower lists are only meaningful on the leader.
                next.followers.clear();
            }
            Ok(changed_or_unchanged(existing, next))
        }
        (ActionVerb::UpdateCollection | ActionVerb::ModifyLeadership, None) => {
            Err(StorageError::CollectionNotFound(shard.to_string()))
        }
        (ActionVerb::CreateDatabase | ActionVerb::DropDatabase, _) => Err(StorageError::Payload {
            verb: action.verb,
            message: format!("'{}' is not a shard key", action.key),
        }),
    }
}

fn changed_or_unchanged(existing: &LocalCollection, next: LocalCollection) -> ShardChange {
    if &next == existing {
        ShardChange::Unchanged
    } else {
        ShardChange::Put(next)
    }
}
