use std::path::PathBuf;
use std::time::Duration;

use dbsync_agency::{AgencyConfig, AgencyError};

pub const ENV_SERVER_ID: &str = "DBSYNC_SERVER_ID";
pub const ENV_AGENCY_ENDPOINTS: &str = "DBSYNC_AGENCY_ENDPOINTS";
pub const ENV_HEARTBEAT_MS: &str = "DBSYNC_HEARTBEAT_MS";
pub const ENV_WORKERS: &str = "DBSYNC_WORKERS";
pub const ENV_MAX_ATTEMPTS: &str = "DBSYNC_MAX_ATTEMPTS";
pub const ENV_DATA_DIR: &str = "DBSYNC_DATA_DIR";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error(transparent)]
    Agency(#[from] AgencyError),
}

#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Identity of this server in Plan and Current (e.g. `PRMR-0001`).
    pub server_id: String,
    /// Interval of the heartbeat trigger.
    pub heartbeat_interval: Duration,
    /// Cycles taking longer than this are logged as warnings.
    pub slow_cycle_warning: Duration,
    /// Upper bound for one report transaction, including failover.
    pub report_timeout: Duration,
    /// Databases that are never dropped even when absent from Plan.
    pub protected_databases: Vec<String>,
    /// Root directory of the filesystem storage backend.
    pub data_dir: PathBuf,
    pub scheduler: SchedulerConfig,
    pub inspector: InspectorConfig,
    pub agency: AgencyConfig,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            server_id: "PRMR-0001".into(),
            heartbeat_interval: Duration::from_secs(1),
            slow_cycle_warning: Duration::from_secs(30),
            report_timeout: Duration::from_secs(30),
            protected_databases: vec!["_system".into()],
            data_dir: PathBuf::from("data"),
            scheduler: SchedulerConfig::default(),
            inspector: InspectorConfig::default(),
            agency: AgencyConfig::default(),
        }
    }
}

impl MaintenanceConfig {
    /// Defaults overridden by `DBSYNC_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|var| std::env::var(var).ok())
    }

    /// Like [`MaintenanceConfig::from_env`], reading variables through `lookup`.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();
        if let Some(id) = var(ENV_SERVER_ID) {
            config.server_id = id;
        }
        if let Some(list) = var(ENV_AGENCY_ENDPOINTS) {
            config.agency.endpoints = AgencyConfig::parse_endpoints(&list)?;
        }
        if let Some(ms) = parse_positive::<u64>(ENV_HEARTBEAT_MS, var(ENV_HEARTBEAT_MS))? {
            config.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(workers) = parse_positive::<usize>(ENV_WORKERS, var(ENV_WORKERS))? {
            config.scheduler.workers = workers;
        }
        if let Some(attempts) = parse_positive::<u32>(ENV_MAX_ATTEMPTS, var(ENV_MAX_ATTEMPTS))? {
            config.scheduler.max_attempts = attempts;
        }
        if let Some(dir) = var(ENV_DATA_DIR) {
            config.data_dir = PathBuf::from(dir);
        }
        Ok(config)
    }

    pub fn is_protected(&self, database: &str) -> bool {
        self.protected_databases.iter().any(|d| d == database)
    }
}

/// Worker pool and retry settings of the action scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of actions applied concurrently.
    pub workers: usize,
    /// Capacity of the hand-off queue between enqueue and the dispatcher.
    pub queue_capacity: usize,
    /// Attempts per action before it fails terminally (first try included).
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound for a single storage apply call.
    pub apply_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
            max_attempts: 5,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
            apply_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InspectorConfig {
    /// Upper bound for enumerating all local resources.
    pub read_timeout: Duration,
}

impl Default for InspectorConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(30),
        }
    }
}

fn parse_positive<T>(var: &'static str, value: Option<String>) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr + Default + PartialEq,
    T::Err: std::fmt::Display,
{
    let Some(value) = value else {
        return Ok(None);
    };
    match value.trim().parse::<T>() {
        Ok(parsed) if parsed == T::default() => Err(ConfigError::Invalid {
            var,
            value,
            reason: "must be positive".into(),
        }),
        Ok(parsed) => Ok(Some(parsed)),
        Err(e) => Err(ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_protect_system_database() {
        let config = MaintenanceConfig::default();
        assert!(config.is_protected("_system"));
        assert!(!config.is_protected("users"));
        assert_eq!(config.scheduler.max_attempts, 5);
    }

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
        let vars: Vec<(String, String)> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone())
    }

    #[test]
    fn env_overrides_defaults() {
        let config = MaintenanceConfig::from_vars(lookup(&[
            (ENV_SERVER_ID, "PRMR-0042"),
            (ENV_HEARTBEAT_MS, "250"),
            (ENV_WORKERS, " 8 "),
            (ENV_DATA_DIR, ""),
        ]))
        .unwrap();
        assert_eq!(config.server_id, "PRMR-0042");
        assert_eq!(config.heartbeat_interval, Duration::from_millis(250));
        assert_eq!(config.scheduler.workers, 8);
        assert_eq!(config.data_dir, PathBuf::from("data"));
    }

    #[test]
    fn zero_heartbeat_is_rejected() {
        let err = MaintenanceConfig::from_vars(lookup(&[(ENV_HEARTBEAT_MS, "0")])).unwrap_err();
        assert!(
            matches!(err, ConfigError::Invalid { var: ENV_HEARTBEAT_MS, .. }),
            "unexpected error: {err}"
        );
        assert!(MaintenanceConfig::from_vars(lookup(&[(ENV_WORKERS, "0")])).is_err());
        assert!(MaintenanceConfig::from_vars(lookup(&[(ENV_WORKERS, "many")])).is_err());
    }
}
