//! Per-server maintenance controller.
//!
//! Keeps the databases and shards stored on this server converged with the
//! cluster-wide Plan held in the agency, and reports what the server actually
//! holds back into Current. One reconciliation cycle runs phase one
//! (Plan vs Local, producing [`Action`]s for the [`ActionScheduler`]) and
//! phase two (Plan/Current vs refreshed Local, producing a [`Report`] that the
//! [`AgencyReporter`] commits as a single transaction).

pub mod action;
pub mod cluster_info;
pub mod config;
pub mod daemon;
pub mod diff;
pub mod engine;
pub mod error;
pub mod inspector;
pub mod model;
pub mod report;
pub mod reporter;
pub mod scheduler;
pub mod storage;

pub use action::{Action, ActionFailure, ActionFailures, ActionRecord, ActionState, ActionVerb};
pub use cluster_info::PlanCurrentClient;
pub use config::{ConfigError, InspectorConfig, MaintenanceConfig, SchedulerConfig};
pub use daemon::{MaintenanceDaemon, SyncStatus, SyncTrigger};
pub use diff::{CyclePlan, DiffContext};
pub use engine::{CycleOutcome, EngineConfig, ReconciliationEngine, ReportStatus};
pub use error::{ErrorKind, MaintenanceError};
pub use inspector::LocalStateInspector;
pub use model::{AgencySnapshot, LocalCollection, LocalDatabase, LocalSnapshot, ResourceKey};
pub use report::{Report, ReportEntry};
pub use reporter::{AgencyReporter, SubmitOutcome};
pub use scheduler::{ActionScheduler, EnqueueOutcome, RetryPolicy};
pub use storage::{
    ApplyOutcome, CollectionInfo, DynStorage, Fault, FsStorage, LocalStorage, MemStorage,
    StorageError,
};
