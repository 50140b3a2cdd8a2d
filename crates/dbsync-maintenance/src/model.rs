//! Documents a reconciliation cycle reads: Plan, Current and the local snapshot.

use std::collections::BTreeMap;
use std::fmt;

use dbsync_agency::tree;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const PLAN: &str = "Plan";
pub const CURRENT: &str = "Current";
pub const CURRENT_VERSION: &str = "Current/Version";

/// Immutable, versioned copy of an agency subtree (`Plan` or `Current`).
#[derive(Debug, Clone, PartialEq)]
pub struct AgencySnapshot {
    pub doc: Value,
    /// `Version` key of the subtree; zero when absent.
    pub version: u64,
    /// Store commit index the snapshot was read at.
    pub index: u64,
}

impl AgencySnapshot {
    pub fn empty() -> Self {
        Self::new(Value::Object(Map::new()), 0)
    }

    pub fn new(doc: Value, index: u64) -> Self {
        let version = doc.get("Version").and_then(Value::as_u64).unwrap_or(0);
        Self {
            doc,
            version,
            index,
        }
    }

    pub fn get(&self, segs: &[&str]) -> Option<&Value> {
        tree::get(&self.doc, segs)
    }

    /// Object at `segs`, or an empty iterator when missing or not an object.
    pub fn entries<'a>(
        &'a self,
        segs: &[&str],
    ) -> impl Iterator<Item = (&'a String, &'a Value)> + use<'a> {
        self.get(segs)
            .and_then(Value::as_object)
            .into_iter()
            .flat_map(|obj| obj.iter())
    }
}

/// Identity of a local resource: a database, or one shard inside it.
///
/// Ordering is by database, then shard, with the database itself sorting
/// before its shards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub database: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard: Option<String>,
}

impl ResourceKey {
    pub fn database(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            shard: None,
        }
    }

    pub fn shard(database: impl Into<String>, shard: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            shard: Some(shard.into()),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.shard {
            Some(shard) => write!(f, "{}/{}", self.database, shard),
            None => f.write_str(&self.database),
        }
    }
}

/// Point-in-time description of what this server stores.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalSnapshot {
    pub databases: BTreeMap<String, LocalDatabase>,
}

impl LocalSnapshot {
    pub fn has_database(&self, database: &str) -> bool {
        self.databases.contains_key(database)
    }

    pub fn collection(&self, database: &str, shard: &str) -> Option<&LocalCollection> {
        self.databases.get(database)?.collections.get(shard)
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        match &key.shard {
            Some(shard) => self.collection(&key.database, shard).is_some(),
            None => self.has_database(&key.database),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalDatabase {
    pub collections: BTreeMap<String, LocalCollection>,
}

/// A shard as stored locally.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalCollection {
    /// Id of the Plan collection this shard belongs to.
    #[serde(rename = "planId", default)]
    pub plan_id: String,
    /// Leader of the shard; empty when this server leads it.
    #[serde(rename = "theLeader", default)]
    pub leader: String,
    /// In-sync followers, as seen by the leader.
    #[serde(default)]
    pub followers: Vec<String>,
    #[serde(rename = "isSystem", default)]
    pub is_system: bool,
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

impl LocalCollection {
    pub fn is_leader(&self) -> bool {
        self.leader.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn local_collection_wire_shape() {
        let coll: LocalCollection = serde_json::from_value(json!({
            "planId": "1001",
            "theLeader": "",
            "waitForSync": true,
            "followers": ["PRMR-2"]
        }))
        .unwrap();
        assert!(coll.is_leader());
        assert_eq!(coll.followers, vec!["PRMR-2".to_string()]);
        assert_eq!(coll.properties.get("waitForSync"), Some(&json!(true)));
        assert!(!coll.is_system);
    }

    #[test]
    fn resource_keys_sort_database_first() {
        let mut keys = vec![
            ResourceKey::shard("db", "s2"),
            ResourceKey::database("db"),
            ResourceKey::shard("db", "s1"),
        ];
        keys.sort();
        let shown: Vec<String> = keys.iter().map(ToString::to_string).collect();
        assert_eq!(shown, ["db", "db/s1", "db/s2"]);
    }

    #[test]
    fn snapshot_version_defaults_to_zero() {
        assert_eq!(AgencySnapshot::new(json!({}), 3).version, 0);
        assert_eq!(AgencySnapshot::new(json!({ "Version": 9 }), 3).version, 9);
    }
}
