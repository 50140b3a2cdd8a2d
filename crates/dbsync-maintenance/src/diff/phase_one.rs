//! Plan vs local state: which actions bring this server to the Plan.

use std::collections::BTreeMap;

use serde_json::{Map, Value, json};

use super::{COMPARED_PROPERTIES, DiffContext, PlannedShard, assigned_shards, planned_databases};
use crate::action::{Action, ActionVerb};
use crate::model::{AgencySnapshot, LocalCollection, LocalSnapshot, ResourceKey};

/// Actions for every resource whose local state differs from the Plan,
/// ordered by resource key.
///
/// Shards are only compared for databases that already exist locally; a
/// missing database is created first and its shards follow on a later cycle.
/// When a resource qualifies for both destructive and non-destructive work,
/// only the non-destructive actions are kept.
pub fn phase_one(
    plan: &AgencySnapshot,
    local: &LocalSnapshot,
    ctx: DiffContext<'_>,
) -> Vec<Action> {
    let planned_dbs = planned_databases(plan);
    let assigned = assigned_shards(plan, ctx.server_id);
    let mut actions = Vec::new();

    for database in &planned_dbs {
        if !local.has_database(database) {
            actions.push(Action::new(
                ResourceKey::database(*database),
                ActionVerb::CreateDatabase,
                json!({ "name": database }),
            ));
        }
    }

    for (database, db) in &local.databases {
        let shards_here = assigned.keys().any(|key| &key.database == database);
        if !planned_dbs.contains(database.as_str()) {
            let protected = ctx.protected.iter().any(|p| p == database);
            if !protected && !shards_here {
                actions.push(Action::new(
                    ResourceKey::database(database.as_str()),
                    ActionVerb::DropDatabase,
                    json!({}),
                ));
                continue;
            }
        }

        for (key, planned) in assigned.iter().filter(|(key, _)| &key.database == database) {
            let shard = key.shard.as_deref().unwrap_or_default();
            match db.collections.get(shard) {
                None => actions.push(create_collection(key, planned, ctx.server_id)),
                Some(existing) => {
                    diff_shard(key, planned, existing, ctx.server_id, &mut actions)
                }
            }
        }

        for (shard, existing) in &db.collections {
            let key = ResourceKey::shard(database.as_str(), shard.as_str());
            if !assigned.contains_key(&key) && !existing.is_system {
                actions.push(Action::new(key, ActionVerb::DropCollection, json!({})));
            }
        }
    }

    let mut actions = prefer_non_destructive(actions);
    actions.retain(|action| !ctx.failures.suppresses(action));
    actions
}

/// `theLeader` this server should record for `planned`.
fn desired_leader<'a>(planned: &'a PlannedShard<'_>, server_id: &str) -> &'a str {
    match planned.leader() {
        Some(leader) if leader != server_id => leader,
        _ => "",
    }
}

fn planned_properties(planned: &PlannedShard<'_>) -> Map<String, Value> {
    COMPARED_PROPERTIES
        .iter()
        .filter_map(|name| {
            planned
                .collection
                .get(*name)
                .map(|value| (name.to_string(), value.clone()))
        })
        .collect()
}

fn create_collection(key: &ResourceKey, planned: &PlannedShard<'_>, server_id: &str) -> Action {
    let desired = LocalCollection {
        plan_id: planned.collection_id.to_string(),
        leader: desired_leader(planned, server_id).to_string(),
        followers: Vec::new(),
        is_system: planned.is_system(),
        properties: planned_properties(planned),
    };
    let payload = serde_json::to_value(&desired).unwrap_or_else(|_| json!({}));
    Action::new(key.clone(), ActionVerb::CreateCollection, payload)
}

fn diff_shard(
    key: &ResourceKey,
    planned: &PlannedShard<'_>,
    existing: &LocalCollection,
    server_id: &str,
    actions: &mut Vec<Action>,
) {
    let changed: Map<String, Value> = planned_properties(planned)
        .into_iter()
        .filter(|(name, value)| existing.properties.get(name) != Some(value))
        .collect();
    if !changed.is_empty() {
        actions.push(Action::new(
            key.clone(),
            ActionVerb::UpdateCollection,
            json!({ "properties": changed }),
        ));
    }

    let leader = desired_leader(planned, server_id);
    if existing.leader != leader {
        actions.push(Action::new(
            key.clone(),
            ActionVerb::ModifyLeadership,
            json!({ "theLeader": leader }),
        ));
    }
}

/// Sort by key, then verb, dropping destructive actions for keys that also
/// have non-destructive ones.
fn prefer_non_destructive(actions: Vec<Action>) -> Vec<Action> {
    let mut by_key: BTreeMap<ResourceKey, Vec<Action>> = BTreeMap::new();
    for action in actions {
        by_key.entry(action.key.clone()).or_default().push(action);
    }
    let mut ordered = Vec::new();
    for (_, mut group) in by_key {
        if group.iter().any(|a| !a.verb.is_destructive()) {
            group.retain(|a| !a.verb.is_destructive());
        }
        group.sort_by_key(|a| a.verb);
        group.dedup_by(|a, b| a.verb == b.verb);
        ordered.extend(group);
    }
    ordered
}
