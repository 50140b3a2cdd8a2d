//! Global CLI options and config resolution.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use dbsync_agency::AgencyConfig;
use dbsync_maintenance::MaintenanceConfig;

/// Global options for all commands.
///
/// Each option falls back to its `DBSYNC_*` environment variable, then to
/// the built-in default.
#[derive(Args, Debug, Clone)]
pub struct GlobalOpts {
    /// Id of this server in Plan and Current (env: DBSYNC_SERVER_ID)
    #[arg(long, global = true, env = "DBSYNC_SERVER_ID")]
    pub server_id: Option<String>,

    /// Comma-separated agency endpoints (env: DBSYNC_AGENCY_ENDPOINTS)
    #[arg(long, global = true, env = "DBSYNC_AGENCY_ENDPOINTS")]
    pub agency_endpoints: Option<String>,

    /// Root directory of local databases (env: DBSYNC_DATA_DIR)
    #[arg(long, global = true, env = "DBSYNC_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Heartbeat interval in milliseconds (env: DBSYNC_HEARTBEAT_MS)
    #[arg(long, global = true, env = "DBSYNC_HEARTBEAT_MS")]
    pub heartbeat_ms: Option<u64>,

    /// Maximum number of concurrently applied actions (env: DBSYNC_WORKERS)
    #[arg(long, global = true, env = "DBSYNC_WORKERS")]
    pub workers: Option<usize>,

    /// Databases never dropped even when absent from Plan (repeatable)
    #[arg(long = "protect", global = true, value_name = "DATABASE")]
    pub protected: Vec<String>,

    /// Pretty-print JSON output
    #[arg(long, global = true)]
    pub pretty: bool,
}

impl GlobalOpts {
    /// Environment defaults with command-line overrides applied.
    pub fn resolve_config(&self) -> Result<MaintenanceConfig> {
        let mut config = MaintenanceConfig::from_env().context("read DBSYNC_* environment")?;
        if let Some(id) = &self.server_id {
            config.server_id = id.clone();
        }
        if let Some(list) = &self.agency_endpoints {
            config.agency.endpoints =
                AgencyConfig::parse_endpoints(list).context("parse --agency-endpoints")?;
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(ms) = self.heartbeat_ms {
            anyhow::ensure!(ms > 0, "--heartbeat-ms must be positive");
            config.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(workers) = self.workers {
            anyhow::ensure!(workers > 0, "--workers must be positive");
            config.scheduler.workers = workers;
        }
        for database in &self.protected {
            if !config.is_protected(database) {
                config.protected_databases.push(database.clone());
            }
        }
        if config.agency.endpoints.is_empty() {
            anyhow::bail!(
                "No agency endpoints configured. Pass --agency-endpoints <URLS> \
                 or set DBSYNC_AGENCY_ENDPOINTS"
            );
        }
        Ok(config)
    }
}
