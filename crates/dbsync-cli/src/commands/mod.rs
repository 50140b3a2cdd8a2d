pub mod diff;
pub mod once;
pub mod run;

use std::sync::Arc;

use anyhow::{Context, Result};
use dbsync_agency::HttpAgency;
use dbsync_maintenance::{FsStorage, MaintenanceConfig, ReconciliationEngine};

/// Engine backed by the HTTP agency and the filesystem storage under
/// `config.data_dir`.
pub(crate) async fn create_engine(config: &MaintenanceConfig) -> Result<ReconciliationEngine> {
    let agency = HttpAgency::new(config.agency.clone()).context("create agency client")?;
    let storage = FsStorage::open(&config.data_dir)
        .await
        .with_context(|| format!("open data directory {}", config.data_dir.display()))?;
    tracing::debug!(
        server = %config.server_id,
        endpoints = config.agency.endpoints.len(),
        data_dir = %config.data_dir.display(),
        "engine assembled"
    );
    Ok(ReconciliationEngine::assemble(
        config,
        Arc::new(agency),
        Arc::new(storage),
    ))
}
