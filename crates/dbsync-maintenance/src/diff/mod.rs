//! Pure comparison of Plan, Current and local state.
//!
//! Nothing in here performs I/O. Given the same inputs, both phases return
//! identical results, which is what lets a dropped cycle simply be rerun.

mod phase_one;
mod phase_two;

pub use phase_one::phase_one;
pub use phase_two::phase_two;

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde_json::{Map, Value};

use crate::action::{Action, ActionFailures};
use crate::model::{AgencySnapshot, LocalSnapshot, ResourceKey};
use crate::report::Report;

/// Collection properties whose Plan value is enforced on local shards.
pub const COMPARED_PROPERTIES: [&str; 5] = [
    "waitForSync",
    "journalSize",
    "doCompact",
    "indexBuckets",
    "cacheEnabled",
];

/// Inputs phase one needs besides the three documents.
#[derive(Debug, Clone, Copy)]
pub struct DiffContext<'a> {
    pub server_id: &'a str,
    /// Databases that are never dropped.
    pub protected: &'a [String],
    /// Terminal failures known to the scheduler.
    pub failures: &'a ActionFailures,
}

/// Actions and report of one cycle, computed without side effects.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CyclePlan {
    pub actions: Vec<Action>,
    pub report: Report,
}

/// Run both phases against the same local snapshot.
///
/// Used for dry runs; a live cycle re-samples local state between phases.
pub fn compute_cycle(
    plan: &AgencySnapshot,
    current: &AgencySnapshot,
    local: &LocalSnapshot,
    ctx: DiffContext<'_>,
) -> CyclePlan {
    CyclePlan {
        actions: phase_one(plan, local, ctx),
        report: phase_two(plan, current, local, ctx.server_id, ctx.failures),
    }
}

/// One shard of a Plan collection.
#[derive(Debug, Clone)]
pub(crate) struct PlannedShard<'a> {
    pub database: &'a str,
    pub collection_id: &'a str,
    pub collection: &'a Map<String, Value>,
    pub servers: Vec<&'a str>,
}

impl PlannedShard<'_> {
    /// First server in the list leads the shard.
    pub fn leader(&self) -> Option<&str> {
        self.servers.first().copied()
    }

    pub fn is_assigned(&self, server_id: &str) -> bool {
        self.servers.contains(&server_id)
    }

    pub fn is_system(&self) -> bool {
        self.collection
            .get("isSystem")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Databases listed under `Plan/Databases`.
pub(crate) fn planned_databases(plan: &AgencySnapshot) -> BTreeSet<&str> {
    plan.entries(&["Databases"]).map(|(db, _)| db.as_str()).collect()
}

/// Shards the Plan assigns to `server_id`, by resource key.
///
/// A shard listed under several collections keeps its first assignment.
pub(crate) fn assigned_shards<'a>(
    plan: &'a AgencySnapshot,
    server_id: &str,
) -> BTreeMap<ResourceKey, PlannedShard<'a>> {
    let mut assigned = BTreeMap::new();
    for (database, collections) in plan.entries(&["Collections"]) {
        let Some(collections) = collections.as_object() else {
            continue;
        };
        for (collection_id, collection) in collections {
            let Some(collection) = collection.as_object() else {
                continue;
            };
            let Some(shards) = collection.get("shards").and_then(Value::as_object) else {
                continue;
            };
            for (shard, servers) in shards {
                let servers: Vec<&str> = servers
                    .as_array()
                    .map(|list| list.iter().filter_map(Value::as_str).collect())
                    .unwrap_or_default();
                let planned = PlannedShard {
                    database,
                    collection_id,
                    collection,
                    servers,
                };
                if planned.is_assigned(server_id) {
                    assigned
                        .entry(ResourceKey::shard(database.as_str(), shard.as_str()))
                        .or_insert(planned);
                }
            }
        }
    }
    assigned
}

/// Resources that may still need work from this server.
///
/// Failures recorded for anything outside this set are obsolete.
pub fn live_keys(
    plan: &AgencySnapshot,
    local: &LocalSnapshot,
    server_id: &str,
) -> BTreeSet<ResourceKey> {
    let mut keys: BTreeSet<ResourceKey> = planned_databases(plan)
        .into_iter()
        .map(ResourceKey::database)
        .collect();
    keys.extend(assigned_shards(plan, server_id).into_keys());
    for (database, db) in &local.databases {
        keys.insert(ResourceKey::database(database.as_str()));
        for shard in db.collections.keys() {
            keys.insert(ResourceKey::shard(database.as_str(), shard.as_str()));
        }
    }
    keys
}
