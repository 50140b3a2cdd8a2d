//! Consistent, versioned reads of Plan and Current.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use dbsync_agency::DynAgency;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::MaintenanceError;
use crate::model::{AgencySnapshot, CURRENT, PLAN};

/// Reads Plan and Current from the agency.
///
/// Each call performs one agency read, so a snapshot never mixes keys from
/// different commits. The highest Plan version seen so far is remembered; a
/// Plan older than that is rejected as inconsistent.
pub struct PlanCurrentClient {
    agency: DynAgency,
    last_plan_version: AtomicU64,
    current_cache: RwLock<Option<Arc<AgencySnapshot>>>,
}

impl PlanCurrentClient {
    pub fn new(agency: DynAgency) -> Self {
        Self {
            agency,
            last_plan_version: AtomicU64::new(0),
            current_cache: RwLock::new(None),
        }
    }

    pub fn agency(&self) -> &DynAgency {
        &self.agency
    }

    pub async fn get_plan(&self) -> Result<AgencySnapshot, MaintenanceError> {
        let plan = self.read(PLAN).await?;
        let previous = self.last_plan_version.fetch_max(plan.version, Ordering::SeqCst);
        if plan.version < previous {
            warn!(
                seen = previous,
                read = plan.version,
                "plan version went backwards"
            );
            return Err(MaintenanceError::SnapshotInconsistency(format!(
                "plan version {} is older than already seen {previous}",
                plan.version
            )));
        }
        Ok(plan)
    }

    /// Fresh read of Current; also refreshes the in-process cache.
    pub async fn get_current(&self) -> Result<Arc<AgencySnapshot>, MaintenanceError> {
        let current = Arc::new(self.read(CURRENT).await?);
        *self.current_cache.write().unwrap() = Some(current.clone());
        Ok(current)
    }

    /// Last Current read, unless invalidated since.
    pub fn cached_current(&self) -> Option<Arc<AgencySnapshot>> {
        self.current_cache.read().unwrap().clone()
    }

    /// Drop the cached Current after this process changed it.
    pub fn invalidate_current(&self) {
        if self.current_cache.write().unwrap().take().is_some() {
            debug!("invalidated cached current");
        }
    }

    pub fn last_plan_version(&self) -> u64 {
        self.last_plan_version.load(Ordering::SeqCst)
    }

    async fn read(&self, path: &str) -> Result<AgencySnapshot, MaintenanceError> {
        let read = self
            .agency
            .read(path)
            .await
            .map_err(|e| MaintenanceError::snapshot_read(path, e))?;
        let doc = match read.value {
            None => Value::Object(Default::default()),
            Some(doc @ Value::Object(_)) => doc,
            Some(other) => {
                return Err(MaintenanceError::SnapshotInconsistency(format!(
                    "{path} is not an object: {other}"
                )));
            }
        };
        let snapshot = AgencySnapshot::new(doc, read.index);
        debug!(path, version = snapshot.version, index = snapshot.index, "read agency snapshot");
        Ok(snapshot)
    }
}
