use dbsync_agency::AgencyError;
use thiserror::Error;

use crate::storage::StorageError;

/// Failure classes the controller distinguishes.
///
/// Callers branch on [`MaintenanceError::kind`] rather than on individual
/// variants or messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    TransientIo,
    PermanentResource,
    SnapshotInconsistency,
    AgencyComm,
    InternalLogic,
}

#[derive(Debug, Clone, Error)]
pub enum MaintenanceError {
    #[error("transient I/O error: {0}")]
    TransientIo(String),
    #[error("action on '{key}' cannot succeed: {message}")]
    PermanentResource { key: String, message: String },
    #[error("inconsistent snapshot: {0}")]
    SnapshotInconsistency(String),
    #[error("agency communication failed: {0}")]
    AgencyComm(String),
    #[error("internal error: {0}")]
    InternalLogic(String),
}

impl MaintenanceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MaintenanceError::TransientIo(_) => ErrorKind::TransientIo,
            MaintenanceError::PermanentResource { .. } => ErrorKind::PermanentResource,
            MaintenanceError::SnapshotInconsistency(_) => ErrorKind::SnapshotInconsistency,
            MaintenanceError::AgencyComm(_) => ErrorKind::AgencyComm,
            MaintenanceError::InternalLogic(_) => ErrorKind::InternalLogic,
        }
    }

    /// Classify a failed snapshot read from the agency.
    pub(crate) fn snapshot_read(path: &str, err: AgencyError) -> Self {
        if err.is_transient() {
            MaintenanceError::TransientIo(format!("read {path}: {err}"))
        } else {
            MaintenanceError::SnapshotInconsistency(format!("read {path}: {err}"))
        }
    }

    /// Classify a local storage failure encountered while reading state.
    pub(crate) fn local_read(what: &str, err: StorageError) -> Self {
        MaintenanceError::SnapshotInconsistency(format!("{what}: {err}"))
    }
}
