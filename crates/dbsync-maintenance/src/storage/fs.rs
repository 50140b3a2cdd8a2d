use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use super::{
    ApplyOutcome, CollectionInfo, LocalStorage, ShardChange, StorageError, StorageResult,
    io_error, shard_change,
};
use crate::action::{Action, ActionVerb};
use crate::model::LocalCollection;

const SHARD_EXT: &str = "json";

/// Filesystem-backed storage rooted at `<root>`.
///
/// Each database is a directory and each shard a `<shard>.json` file inside
/// it holding the shard's [`LocalCollection`] document.
#[derive(Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl fmt::Debug for FsStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsStorage").field("root", &self.root).finish()
    }
}

impl FsStorage {
    pub async fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| io_error(&root, e))?;
        Ok(Self { root })
    }

    fn database_dir(&self, action: &Action, database: &str) -> StorageResult<PathBuf> {
        check_name(action, database)?;
        Ok(self.root.join(database))
    }

    fn shard_path(db_dir: &Path, action: &Action, shard: &str) -> StorageResult<PathBuf> {
        check_name(action, shard)?;
        Ok(db_dir.join(format!("{shard}.{SHARD_EXT}")))
    }

    async fn read_shard(path: &Path) -> StorageResult<Option<LocalCollection>> {
        match fs::read(path).await {
            Ok(bytes) => decode_shard(path, &bytes).map(Some),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(path, err)),
        }
    }

    /// Write through a temporary sibling and rename, so readers never see
    /// a truncated shard document.
    async fn write_shard(path: &Path, collection: &LocalCollection) -> StorageResult<()> {
        let bytes = serde_json::to_vec_pretty(collection).map_err(|e| StorageError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &bytes).await.map_err(|e| io_error(&tmp, e))?;
        fs::rename(&tmp, path).await.map_err(|e| io_error(path, e))
    }

    async fn apply_database(&self, action: &Action) -> StorageResult<ApplyOutcome> {
        let dir = self.database_dir(action, &action.key.database)?;
        match action.verb {
            ActionVerb::CreateDatabase => match fs::create_dir(&dir).await {
                Ok(()) => Ok(ApplyOutcome::Applied),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    Ok(ApplyOutcome::AlreadyConverged)
                }
                Err(err) => Err(io_error(&dir, err)),
            },
            _ => match fs::remove_dir_all(&dir).await {
                Ok(()) => Ok(ApplyOutcome::Applied),
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    Ok(ApplyOutcome::AlreadyConverged)
                }
                Err(err) => Err(io_error(&dir, err)),
            },
        }
    }

    async fn apply_shard(&self, action: &Action, shard: &str) -> StorageResult<ApplyOutcome> {
        let db_dir = self.database_dir(action, &action.key.database)?;
        if !is_dir(&db_dir).await? {
            if action.verb == ActionVerb::DropCollection {
                return Ok(ApplyOutcome::AlreadyConverged);
            }
            return Err(StorageError::DatabaseNotFound(action.key.database.clone()));
        }
        let path = Self::shard_path(&db_dir, action, shard)?;
        let current = Self::read_shard(&path).await?;
        match shard_change(current.as_ref(), action)? {
            ShardChange::Unchanged => Ok(ApplyOutcome::AlreadyConverged),
            ShardChange::Put(next) => {
                Self::write_shard(&path, &next).await?;
                Ok(ApplyOutcome::Applied)
            }
            ShardChange::Remove => match fs::remove_file(&path).await {
                Ok(()) => Ok(ApplyOutcome::Applied),
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    Ok(ApplyOutcome::AlreadyConverged)
                }
                Err(err) => Err(io_error(&path, err)),
            },
        }
    }
}

#[async_trait]
impl LocalStorage for FsStorage {
    async fn list_databases(&self) -> StorageResult<Vec<String>> {
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| io_error(&self.root, e))?;
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error(&self.root, e))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| io_error(entry.path(), e))?;
            if file_type.is_dir() {
                names.push(entry_name(&entry.path(), entry.file_name().to_str())?);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn list_collections(&self, database: &str) -> StorageResult<Vec<CollectionInfo>> {
        let dir = self.root.join(database);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StorageError::DatabaseNotFound(database.to_string()));
            }
            Err(err) => return Err(io_error(&dir, err)),
        };
        let mut shards = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&dir, e))? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(SHARD_EXT) {
                continue;
            }
            let name = entry_name(&path, path.file_stem().and_then(|stem| stem.to_str()))?;
            let bytes = fs::read(&path).await.map_err(|e| io_error(&path, e))?;
            shards.push(CollectionInfo {
                name,
                details: decode_shard(&path, &bytes)?,
            });
        }
        shards.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(shards)
    }

    async fn apply(&self, action: &Action) -> StorageResult<ApplyOutcome> {
        match (&action.key.shard, action.verb) {
            (None, ActionVerb::CreateDatabase | ActionVerb::DropDatabase) => {
                self.apply_database(action).await
            }
            (Some(shard), _) => self.apply_shard(action, shard).await,
            (None, verb) => Err(StorageError::Payload {
                verb,
                message: format!("'{}' is not a shard key", action.key),
            }),
        }
    }
}

fn decode_shard(path: &Path, bytes: &[u8]) -> StorageResult<LocalCollection> {
    serde_json::from_slice(bytes).map_err(|e| StorageError::Io {
        path: path.to_path_buf(),
        message: format!("malformed shard document: {e}"),
    })
}

/// A resource whose name does not decode cannot be reported, so listing it fails.
fn entry_name(path: &Path, name: Option<&str>) -> StorageResult<String> {
    name.map(str::to_owned).ok_or_else(|| StorageError::Io {
        path: path.to_path_buf(),
        message: "resource name is not valid UTF-8".into(),
    })
}

async fn is_dir(path: &Path) -> StorageResult<bool> {
    match fs::metadata(path).await {
        Ok(meta) => Ok(meta.is_dir()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(io_error(path, err)),
    }
}

/// Names become path components; refuse anything that could escape the root.
fn check_name(action: &Action, name: &str) -> StorageResult<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if bad {
        return Err(StorageError::Payload {
            verb: action.verb,
            message: format!("invalid resource name '{name}'"),
        });
    }
    Ok(())
}
