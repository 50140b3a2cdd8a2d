//! `dbsync diff` against an in-process agency emulator.

use std::net::SocketAddr;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use dbsync_agency::{AgencyStore, INDEX_HEADER, MemAgency, tree};
use serde_json::{Value, json};

const ROOT: &str = "/arango";

async fn read_handler(
    State(agency): State<MemAgency>,
    Json(body): Json<Value>,
) -> ([(&'static str, String); 1], Json<Value>) {
    let key = body[0][0].as_str().unwrap_or_default().to_string();
    let read = agency.read(key.trim_start_matches(ROOT)).await.unwrap();
    let mut wrapped = json!({});
    if let Some(value) = read.value {
        tree::set(&mut wrapped, &tree::segments(&key), value);
    }
    ([(INDEX_HEADER, read.index.to_string())], Json(json!([wrapped])))
}

async fn spawn_agency(agency: MemAgency) -> SocketAddr {
    let app = Router::new()
        .route("/_api/agency/read", post(read_handler))
        .with_state(agency);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio::test(flavor = "multi_thread")]
async fn diff_prints_pending_work_without_applying_it() {
    let agency = MemAgency::with_root(json!({
        "Plan": {
            "Version": 3,
            "Databases": { "db": { "name": "db" } },
            "Collections": { "db": { "100": {
                "name": "users",
                "shards": { "users": ["PRMR-0007"] }
            } } }
        },
        "Current": { "Version": 1 }
    }));
    let addr = spawn_agency(agency.clone()).await;
    let data = tempfile::tempdir().unwrap();
    std::fs::create_dir(data.path().join("db")).unwrap();
    let data_dir = data.path().to_path_buf();

    let output = tokio::task::spawn_blocking(move || {
        std::process::Command::new(assert_cmd::cargo::cargo_bin!("dbsync"))
            .env("RUST_LOG", "warn")
            .args(["--server-id", "PRMR-0007"])
            .args(["--agency-endpoints", &format!("http://{addr}")])
            .arg("--data-dir")
            .arg(&data_dir)
            .arg("diff")
            .output()
            .expect("run diff")
    })
    .await
    .unwrap();

    assert!(
        output.status.success(),
        "diff failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let preview: Value = serde_json::from_slice(&output.stdout).unwrap();
    let actions = preview["actions"].as_array().unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0]["verb"], json!("create-collection"));
    assert!(
        preview["report"]
            .as_object()
            .unwrap()
            .contains_key("Current/Databases/db/PRMR-0007")
    );

    assert!(!data.path().join("db").join("users.json").exists());
    assert_eq!(agency.transaction_count(), 0);
}
