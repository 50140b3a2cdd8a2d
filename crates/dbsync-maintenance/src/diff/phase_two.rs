//! Plan and Current vs refreshed local state: what Current should say about
//! this server.

use std::collections::BTreeMap;

use serde_json::{Value, json};

use super::{PlannedShard, assigned_shards, planned_databases};
use crate::action::{ActionFailure, ActionFailures};
use crate::model::{AgencySnapshot, LocalCollection, LocalSnapshot, ResourceKey};
use crate::report::Report;

/// Report of every Current entry owned by `server_id` that is missing,
/// stale, or no longer backed by a local resource.
///
/// Databases are reported for every local database. Shards are reported
/// only by their leader, with `servers` listing the leader followed by its
/// in-sync followers. Terminal action failures on planned resources are
/// reported as error entries. Entries that already match are left out, so
/// a converged server yields an empty report.
pub fn phase_two(
    plan: &AgencySnapshot,
    current: &AgencySnapshot,
    local: &LocalSnapshot,
    server_id: &str,
    failures: &ActionFailures,
) -> Report {
    let mut desired: BTreeMap<String, Value> = BTreeMap::new();
    report_databases(plan, local, server_id, failures, &mut desired);
    report_shards(plan, local, server_id, failures, &mut desired);

    let mut report = Report::new();
    for (path, payload) in &desired {
        let segs: Vec<&str> = path.split('/').skip(1).collect();
        if current.get(&segs) != Some(payload) {
            report.set(path.clone(), payload.clone());
        }
    }
    for path in owned_entries(current, server_id) {
        if !desired.contains_key(&path) {
            report.delete(path);
        }
    }
    report
}

fn database_path(database: &str, server_id: &str) -> String {
    format!("Current/Databases/{database}/{server_id}")
}

fn shard_path(database: &str, collection_id: &str, shard: &str) -> String {
    format!("Current/Collections/{database}/{collection_id}/{shard}")
}

fn error_fields(failure: Option<&ActionFailure>) -> (bool, i64, String) {
    match failure {
        Some(failure) => (true, failure.error_num, failure.message.clone()),
        None => (false, 0, String::new()),
    }
}

fn report_databases(
    plan: &AgencySnapshot,
    local: &LocalSnapshot,
    server_id: &str,
    failures: &ActionFailures,
    desired: &mut BTreeMap<String, Value>,
) {
    let planned = planned_databases(plan);
    for database in local.databases.keys() {
        let failure = planned
            .contains(database.as_str())
            .then(|| failures.for_key(&ResourceKey::database(database.as_str())))
            .flatten();
        let (error, error_num, message) = error_fields(failure);
        desired.insert(
            database_path(database, server_id),
            json!({
                "name": database,
                "error": error,
                "errorNum": error_num,
                "errorMessage": message,
            }),
        );
    }
    for database in planned {
        if local.has_database(database) {
            continue;
        }
        if let Some(failure) = failures.for_key(&ResourceKey::database(database)) {
            desired.insert(
                database_path(database, server_id),
                json!({
                    "name": database,
                    "error": true,
                    "errorNum": failure.error_num,
                    "errorMessage": failure.message,
                }),
            );
        }
    }
}

fn report_shards(
    plan: &AgencySnapshot,
    local: &LocalSnapshot,
    server_id: &str,
    failures: &ActionFailures,
    desired: &mut BTreeMap<String, Value>,
) {
    for (key, planned) in assigned_shards(plan, server_id) {
        let shard = key.shard.as_deref().unwrap_or_default();
        let path = shard_path(planned.database, planned.collection_id, shard);
        let failure = failures.for_key(&key);
        match local.collection(&key.database, shard) {
            Some(existing) if existing.is_leader() => {
                desired.insert(path, shard_entry(existing, server_id, failure));
            }
            Some(_) => {}
            None => {
                // Only the planned leader speaks for a shard nobody holds yet.
                if let Some(failure) = failure.filter(|_| leads(&planned, server_id)) {
                    let (error, error_num, message) = error_fields(Some(failure));
                    desired.insert(
                        path,
                        json!({
                            "servers": [],
                            "indexes": [],
                            "error": error,
                            "errorNum": error_num,
                            "errorMessage": message,
                        }),
                    );
                }
            }
        }
    }
}

fn leads(planned: &PlannedShard<'_>, server_id: &str) -> bool {
    planned.leader() == Some(server_id)
}

fn shard_entry(
    existing: &LocalCollection,
    server_id: &str,
    failure: Option<&ActionFailure>,
) -> Value {
    let mut servers = vec![server_id.to_string()];
    servers.extend(
        existing
            .followers
            .iter()
            .filter(|follower| follower.as_str() != server_id)
            .cloned(),
    );
    let indexes = existing
        .properties
        .get("indexes")
        .cloned()
        .unwrap_or_else(|| json!([]));
    let (error, error_num, message) = error_fields(failure);
    json!({
        "servers": servers,
        "indexes": indexes,
        "error": error,
        "errorNum": error_num,
        "errorMessage": message,
    })
}

/// Paths of Current entries this server is responsible for.
///
/// A database entry belongs to the server it is filed under; a shard entry
/// belongs to the server listed first in its `servers`.
fn owned_entries(current: &AgencySnapshot, server_id: &str) -> Vec<String> {
    let mut owned = Vec::new();
    for (database, servers) in current.entries(&["Databases"]) {
        if servers.get(server_id).is_some() {
            owned.push(database_path(database, server_id));
        }
    }
    for (database, collections) in current.entries(&["Collections"]) {
        let Some(collections) = collections.as_object() else {
            continue;
        };
        for (collection_id, shards) in collections {
            let Some(shards) = shards.as_object() else {
                continue;
            };
            for (shard, entry) in shards {
                let leader = entry
                    .get("servers")
                    .and_then(|servers| servers.get(0))
                    .and_then(Value::as_str);
                if leader == Some(server_id) {
                    owned.push(shard_path(database, collection_id, shard));
                }
            }
        }
    }
    owned
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::*;
    use crate::action::{Action, ActionVerb};
    use crate::report::ReportEntry;

    fn current(doc: Value) -> AgencySnapshot {
        AgencySnapshot::new(doc, 1)
    }

    fn users_local() -> LocalSnapshot {
        local(json!({
            "db": {
                "users": {
                    "planId": "100",
                    "theLeader": "",
                    "followers": [OTHER],
                    "waitForSync": false
                }
            }
        }))
    }

    #[test]
    fn empty_inputs_report_nothing() {
        let report = phase_two(
            &plan(json!({})),
            &current(json!({})),
            &local(json!({})),
            SELF,
            &ActionFailures::new(),
        );
        assert!(report.is_empty());
    }

    #[test]
    fn leader_reports_database_and_shard() {
        let report = phase_two(
            &users_plan(),
            &current(json!({ "Version": 4 })),
            &users_local(),
            SELF,
            &ActionFailures::new(),
        );
        assert_eq!(report.len(), 2);
        assert_eq!(
            report.get("Current/Collections/db/100/users"),
            Some(&ReportEntry::Set {
                payload: json!({
                    "servers": [SELF, OTHER],
                    "indexes": [],
                    "error": false,
                    "errorNum": 0,
                    "errorMessage": "",
                })
            })
        );
        assert!(matches!(
            report.get(&format!("Current/Databases/db/{SELF}")),
            Some(ReportEntry::Set { .. })
        ));
    }

    #[test]
    fn matching_current_needs_no_writes() {
        let current = current(json!({
            "Version": 5,
            "Databases": {
                "db": { SELF: { "name": "db", "error": false, "errorNum": 0, "errorMessage": "" } }
            },
            "Collections": {
                "db": { "100": { "users": {
                    "servers": [SELF, OTHER],
                    "indexes": [],
                    "error": false,
                    "errorNum": 0,
                    "errorMessage": ""
                } } }
            }
        }));
        let failures = ActionFailures::new();
        let report = phase_two(&users_plan(), &current, &users_local(), SELF, &failures);
        assert!(report.is_empty(), "unexpected report: {report:?}");
    }

    #[test]
    fn follower_does_not_report_shard() {
        let local = local(json!({
            "db": { "users": { "planId": "100", "theLeader": OTHER } }
        }));
        let report = phase_two(
            &users_plan(),
            &current(json!({})),
            &local,
            SELF,
            &ActionFailures::new(),
        );
        let paths: Vec<&String> = report.iter().map(|(path, _)| path).collect();
        assert_eq!(paths, [&format!("Current/Databases/db/{SELF}")]);
    }

    #[test]
    fn stale_owned_entries_are_deleted() {
        let current = current(json!({
            "Databases": {
                "gone": { SELF: { "name": "gone" }, OTHER: { "name": "gone" } }
            },
            "Collections": {
                "gone": { "7": {
                    "s7": { "servers": [SELF] },
                    "s8": { "servers": [OTHER, SELF] }
                } }
            }
        }));
        let report = phase_two(
            &plan(json!({})),
            &current,
            &local(json!({})),
            SELF,
            &ActionFailures::new(),
        );
        let entries: Vec<(&String, &ReportEntry)> = report.iter().collect();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|(_, entry)| **entry == ReportEntry::Delete));
        assert!(report.get("Current/Collections/gone/7/s7").is_some());
        assert!(report.get(&format!("Current/Databases/gone/{SELF}")).is_some());
    }

    #[test]
    fn failed_create_is_reported_as_error() {
        let mut failures = ActionFailures::new();
        failures.insert(ActionFailure {
            action: Action::new(
                ResourceKey::shard("db", "users"),
                ActionVerb::CreateCollection,
                json!({}),
            ),
            error_num: 1104,
            message: "disk full".into(),
            attempts: 5,
        });
        let report = phase_two(
            &users_plan(),
            &current(json!({})),
            &local(json!({ "db": {} })),
            SELF,
            &failures,
        );
        let Some(ReportEntry::Set { payload }) = report.get("Current/Collections/db/100/users")
        else {
            panic!("missing error entry: {report:?}");
        };
        assert_eq!(payload["error"], json!(true));
        assert_eq!(payload["errorNum"], json!(1104));
        assert_eq!(payload["errorMessage"], json!("disk full"));
    }
}
