//! Full reconciliation cycles against an in-process agency and storage.

use std::sync::Arc;
use std::time::Duration;

use dbsync_agency::MemAgency;
use dbsync_maintenance::diff::compute_cycle;
use dbsync_maintenance::{
    ActionFailures, ActionVerb, AgencySnapshot, DiffContext, ErrorKind, LocalSnapshot,
    MaintenanceConfig, MemStorage, ReconciliationEngine, ReportEntry, ReportStatus,
};
use serde_json::{Value, json};

const SERVER: &str = "PRMR-0001";

fn engine(agency: &MemAgency, storage: &MemStorage) -> ReconciliationEngine {
    let mut config = MaintenanceConfig::default();
    config.server_id = SERVER.into();
    config.scheduler.base_backoff = Duration::from_millis(1);
    ReconciliationEngine::assemble(
        &config,
        Arc::new(agency.clone()),
        Arc::new(storage.clone()),
    )
}

fn local(doc: Value) -> LocalSnapshot {
    serde_json::from_value(doc).unwrap()
}

fn users_plan() -> Value {
    json!({
        "Version": 1,
        "Databases": { "db": { "name": "db" } },
        "Collections": {
            "db": {
                "100": {
                    "name": "users",
                    "waitForSync": false,
                    "shards": { "users": [SERVER] }
                }
            }
        }
    })
}

fn version(agency: &MemAgency) -> u64 {
    agency
        .get("Current/Version")
        .and_then(|v| v.as_u64())
        .unwrap_or(0)
}

#[tokio::test]
async fn planned_collection_converges_and_is_reported() {
    let agency = MemAgency::with_root(json!({
        "Plan": users_plan(),
        "Current": { "Version": 7 }
    }));
    let storage = MemStorage::with_snapshot(local(json!({ "db": {} })));
    // Keep the create from finishing before the phase-two re-sample.
    storage.set_apply_delay(Duration::from_millis(50));
    let engine = engine(&agency, &storage);

    let first = engine.run_once().await.unwrap();
    assert_eq!(first.actions_enqueued, 1);
    engine.scheduler().wait_idle().await;
    let applied = storage.applied();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].verb, ActionVerb::CreateCollection);
    assert_eq!(applied[0].key.to_string(), "db/users");
    assert!(storage.snapshot().collection("db", "users").is_some());

    let before = version(&agency);
    let second = engine.run_once().await.unwrap();
    assert_eq!(second.actions_enqueued, 0);
    assert!(matches!(second.report_status, ReportStatus::Committed { .. }));
    assert!(matches!(
        second.report.get("Current/Collections/db/100/users"),
        Some(ReportEntry::Set { .. })
    ));
    assert_eq!(version(&agency), before + 1);
    assert_eq!(
        agency.get("Current/Collections/db/100/users/servers"),
        Some(json!([SERVER]))
    );

    // Converged: nothing left to report, so the version stays put.
    let third = engine.run_once().await.unwrap();
    assert_eq!(third.report_status, ReportStatus::Empty);
    assert_eq!(version(&agency), before + 1);
}

#[tokio::test]
async fn empty_server_creates_database_then_collection() {
    let agency = MemAgency::with_root(json!({
        "Plan": users_plan(),
        "Current": { "Version": 1 }
    }));
    let storage = MemStorage::new();
    storage.set_apply_delay(Duration::from_millis(50));
    let engine = engine(&agency, &storage);

    // Cycle 1: the database is created and reported; its shard has to wait.
    let first = engine.run_once().await.unwrap();
    assert_eq!(first.actions_enqueued, 1);
    assert!(matches!(first.report_status, ReportStatus::Committed { .. }));
    assert!(storage.snapshot().has_database("db"));
    assert!(storage.snapshot().collection("db", "users").is_none());
    assert!(agency.get(&format!("Current/Databases/db/{SERVER}")).is_some());
    assert_eq!(version(&agency), 2);

    // Cycle 2: the shard is created inside the now existing database.
    let second = engine.run_once().await.unwrap();
    assert_eq!(second.actions_enqueued, 1);
    engine.scheduler().wait_idle().await;
    let verbs: Vec<ActionVerb> = storage.applied().iter().map(|a| a.verb).collect();
    assert_eq!(verbs, [ActionVerb::CreateDatabase, ActionVerb::CreateCollection]);
    assert!(storage.snapshot().collection("db", "users").is_some());

    let mut committed = [&first, &second]
        .iter()
        .filter(|o| matches!(o.report_status, ReportStatus::Committed { .. }))
        .count() as u64;
    loop {
        let outcome = engine.run_once().await.unwrap();
        assert_eq!(outcome.actions_enqueued, 0);
        match outcome.report_status {
            ReportStatus::Committed { .. } => committed += 1,
            ReportStatus::Empty => break,
            ReportStatus::Failed { error } => panic!("report failed: {error}"),
        }
        assert!(committed < 5, "report never converged");
    }
    assert_eq!(
        agency.get("Current/Collections/db/100/users/servers"),
        Some(json!([SERVER]))
    );
    // One increment per committed report, none for the empty ones.
    assert_eq!(version(&agency), 1 + committed);
    assert_eq!(agency.transaction_count(), committed);
}

#[tokio::test]
async fn orphan_collection_is_pruned() {
    let agency = MemAgency::with_root(json!({
        "Plan": { "Version": 1, "Databases": { "db": { "name": "db" } } }
    }));
    let storage = MemStorage::with_snapshot(local(json!({
        "db": { "orphan": { "planId": "9", "theLeader": "" } }
    })));
    let engine = engine(&agency, &storage);

    let outcome = engine.run_once().await.unwrap();
    assert_eq!(outcome.actions_enqueued, 1);
    engine.scheduler().wait_idle().await;

    let applied = storage.applied();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].verb, ActionVerb::DropCollection);
    assert_eq!(applied[0].key.to_string(), "db/orphan");
    assert!(storage.snapshot().collection("db", "orphan").is_none());
}

#[tokio::test]
async fn empty_cluster_submits_nothing() {
    let agency = MemAgency::new();
    let storage = MemStorage::new();
    let outcome = engine(&agency, &storage).run_once().await.unwrap();

    assert!(outcome.report.is_empty());
    assert_eq!(outcome.report_status, ReportStatus::Empty);
    assert_eq!(outcome.actions_enqueued, 0);
    assert_eq!(agency.transaction_count(), 0);
    assert_eq!(agency.get("Current/Version"), None);
}

#[tokio::test]
async fn failed_report_is_resubmitted_without_double_increment() {
    let agency = MemAgency::with_root(json!({
        "Plan": { "Version": 1, "Databases": { "db": { "name": "db" } } },
        "Current": { "Version": 3 }
    }));
    let storage = MemStorage::with_snapshot(local(json!({ "db": {} })));
    let engine = engine(&agency, &storage);

    agency.fail_next_transactions(1);
    let failed = engine.run_once().await.unwrap();
    assert!(matches!(failed.report_status, ReportStatus::Failed { .. }));
    assert_eq!(version(&agency), 3);

    let retried = engine.run_once().await.unwrap();
    assert_eq!(retried.report, failed.report);
    assert!(matches!(retried.report_status, ReportStatus::Committed { .. }));
    assert_eq!(version(&agency), 4);
    assert_eq!(agency.transaction_count(), 1);
}

#[tokio::test]
async fn unreadable_local_state_aborts_the_cycle() {
    let agency = MemAgency::with_root(json!({ "Plan": users_plan() }));
    let storage = MemStorage::with_snapshot(local(json!({ "db": {} })));
    storage.fail_listings(1);
    let engine = engine(&agency, &storage);

    let err = engine.run_once().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SnapshotInconsistency);
    assert_eq!(agency.transaction_count(), 0);
    assert_eq!(storage.apply_count(), 0);
}

#[tokio::test]
async fn plan_going_backwards_aborts_the_cycle() {
    let agency = MemAgency::with_root(json!({ "Plan": users_plan() }));
    agency.put("Plan/Version", json!(9));
    let storage = MemStorage::with_snapshot(local(json!({ "db": {} })));
    let engine = engine(&agency, &storage);
    engine.run_once().await.unwrap();
    engine.scheduler().wait_idle().await;
    let transactions = agency.transaction_count();

    agency.put("Plan/Version", json!(8));
    let err = engine.run_once().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SnapshotInconsistency);
    assert_eq!(agency.transaction_count(), transactions);
}

#[tokio::test]
async fn terminal_failure_surfaces_as_error_entry() {
    let agency = MemAgency::with_root(json!({
        "Plan": users_plan(),
        "Current": { "Version": 1 }
    }));
    let storage = MemStorage::with_snapshot(local(json!({ "db": {} })));
    storage.fail_key(
        dbsync_maintenance::ResourceKey::shard("db", "users"),
        dbsync_maintenance::Fault::Permanent,
        1,
    );
    let engine = engine(&agency, &storage);

    engine.run_once().await.unwrap();
    engine.scheduler().wait_idle().await;

    let outcome = engine.run_once().await.unwrap();
    // The failed create is not retried with an unchanged Plan.
    assert_eq!(outcome.actions_enqueued, 0);
    assert_eq!(storage.apply_count(), 1);
    assert_eq!(
        agency.get("Current/Collections/db/100/users/error"),
        Some(json!(true))
    );
    assert_eq!(
        agency.get("Current/Collections/db/100/users/errorNum"),
        Some(json!(1104))
    );
}

#[test]
fn identical_inputs_give_identical_results() {
    let plan = AgencySnapshot::new(users_plan(), 4);
    let current = AgencySnapshot::new(
        json!({
            "Version": 12,
            "Databases": { "stale": { SERVER: { "name": "stale" } } }
        }),
        4,
    );
    let local = local(json!({
        "db": { "orphan": { "planId": "9" } },
        "other": {}
    }));
    let failures = ActionFailures::new();
    let protected = vec!["_system".to_string()];
    let ctx = DiffContext {
        server_id: SERVER,
        protected: &protected,
        failures: &failures,
    };

    let first = compute_cycle(&plan, &current, &local, ctx);
    let second = compute_cycle(&plan, &current, &local, ctx);
    assert_eq!(
        serde_json::to_vec(&first.report).unwrap(),
        serde_json::to_vec(&second.report).unwrap()
    );
    assert_eq!(first.actions, second.actions);
    assert!(!first.actions.is_empty());
    assert!(!first.report.is_empty());
}
