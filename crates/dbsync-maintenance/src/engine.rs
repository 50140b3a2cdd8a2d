//! One reconciliation cycle: phase one, local re-sample, phase two, report.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dbsync_agency::DynAgency;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::action::{Action, ActionFailures};
use crate::cluster_info::PlanCurrentClient;
use crate::config::MaintenanceConfig;
use crate::diff::{CyclePlan, DiffContext, compute_cycle, live_keys, phase_one, phase_two};
use crate::error::MaintenanceError;
use crate::inspector::LocalStateInspector;
use crate::report::Report;
use crate::reporter::{AgencyReporter, SubmitOutcome};
use crate::scheduler::{ActionScheduler, EnqueueOutcome};
use crate::storage::DynStorage;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub server_id: String,
    pub protected_databases: Vec<String>,
    pub slow_cycle_warning: Duration,
}

impl EngineConfig {
    pub fn from_config(config: &MaintenanceConfig) -> Self {
        Self {
            server_id: config.server_id.clone(),
            protected_databases: config.protected_databases.clone(),
            slow_cycle_warning: config.slow_cycle_warning,
        }
    }
}

/// What happened to a cycle's report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReportStatus {
    /// Nothing to report; no transaction was sent.
    Empty,
    Committed { index: u64 },
    /// The transaction failed; Current and its version are unchanged.
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleOutcome {
    pub report: Report,
    pub actions_enqueued: usize,
    pub actions_deduped: usize,
    pub plan_version: u64,
    pub current_version: u64,
    pub report_status: ReportStatus,
    pub elapsed_ms: u64,
}

/// Drives reconciliation cycles for one server.
///
/// All collaborators are supplied by the caller. A cycle either produces a
/// full [`CycleOutcome`] or an error; an aborted cycle never submits a
/// partially built report.
pub struct ReconciliationEngine {
    config: EngineConfig,
    cluster: Arc<PlanCurrentClient>,
    inspector: LocalStateInspector,
    scheduler: ActionScheduler,
    reporter: AgencyReporter,
}

impl ReconciliationEngine {
    pub fn new(
        config: EngineConfig,
        cluster: Arc<PlanCurrentClient>,
        inspector: LocalStateInspector,
        scheduler: ActionScheduler,
        reporter: AgencyReporter,
    ) -> Self {
        Self {
            config,
            cluster,
            inspector,
            scheduler,
            reporter,
        }
    }

    /// Wire the standard collaborators from `config` around `agency` and
    /// `storage`. Starts the action scheduler on the current runtime.
    pub fn assemble(config: &MaintenanceConfig, agency: DynAgency, storage: DynStorage) -> Self {
        let cluster = Arc::new(PlanCurrentClient::new(agency.clone()));
        let inspector = LocalStateInspector::new(storage.clone(), &config.inspector);
        let scheduler = ActionScheduler::start(storage, &config.scheduler);
        let reporter = AgencyReporter::new(agency, cluster.clone(), config.report_timeout);
        Self::new(
            EngineConfig::from_config(config),
            cluster,
            inspector,
            scheduler,
            reporter,
        )
    }

    pub fn server_id(&self) -> &str {
        &self.config.server_id
    }

    pub fn scheduler(&self) -> &ActionScheduler {
        &self.scheduler
    }

    pub async fn run_once(&self) -> Result<CycleOutcome, MaintenanceError> {
        let started = Instant::now();
        debug!(server = %self.config.server_id, "reconciliation cycle started");
        let result = self.cycle(started).await;
        let elapsed = started.elapsed();
        if elapsed > self.config.slow_cycle_warning {
            warn!(
                elapsed_secs = elapsed.as_secs_f64(),
                "reconciliation cycle took longer than {:?}", self.config.slow_cycle_warning
            );
        }
        match &result {
            Ok(outcome) => debug!(
                plan_version = outcome.plan_version,
                enqueued = outcome.actions_enqueued,
                report_entries = outcome.report.len(),
                "reconciliation cycle finished"
            ),
            Err(err) => warn!(kind = ?err.kind(), "reconciliation cycle aborted: {err}"),
        }
        result
    }

    /// Compute actions and report without enqueueing or submitting anything.
    pub async fn preview(&self) -> Result<CyclePlan, MaintenanceError> {
        let plan = self.cluster.get_plan().await?;
        let current = self.cluster.get_current().await?;
        let local = self.inspector.snapshot().await?;
        let failures = self.scheduler.failures();
        Ok(compute_cycle(&plan, &current, &local, self.context(&failures)))
    }

    fn context<'a>(&'a self, failures: &'a ActionFailures) -> DiffContext<'a> {
        DiffContext {
            server_id: &self.config.server_id,
            protected: &self.config.protected_databases,
            failures,
        }
    }

    async fn cycle(&self, started: Instant) -> Result<CycleOutcome, MaintenanceError> {
        let server_id = self.config.server_id.as_str();

        // Phase one: Plan vs local.
        let plan = self.cluster.get_plan().await?;
        let local = self.inspector.snapshot().await?;
        self.scheduler.retain_failures(&live_keys(&plan, &local, server_id));
        let failures = self.scheduler.failures();
        let actions = phase_one(&plan, &local, self.context(&failures));

        let (fast_track, queued): (Vec<Action>, Vec<Action>) =
            actions.into_iter().partition(|a| a.verb.is_fast_track());
        let mut enqueued = 0;
        let mut deduped = 0;
        let mut count = |outcome: EnqueueOutcome| match outcome {
            EnqueueOutcome::Accepted { .. } => enqueued += 1,
            EnqueueOutcome::Deduped { .. } => deduped += 1,
        };
        for action in queued {
            count(self.scheduler.enqueue(action)?);
        }
        for outcome in self.run_fast_track(fast_track).await? {
            count(outcome);
        }
        if enqueued > 0 {
            info!(enqueued, deduped, plan_version = plan.version, "enqueued actions");
        }

        // Phase two: Plan and Current vs refreshed local.
        let local = self.inspector.snapshot().await?;
        let current = self.cluster.get_current().await?;
        let failures = self.scheduler.failures();
        let report = phase_two(&plan, &current, &local, server_id, &failures);

        let report_status = match self.reporter.submit(&report).await {
            Ok(SubmitOutcome::Skipped) => ReportStatus::Empty,
            Ok(SubmitOutcome::Committed { index }) => ReportStatus::Committed { index },
            Err(err @ MaintenanceError::InternalLogic(_)) => return Err(err),
            Err(err) => ReportStatus::Failed {
                error: err.to_string(),
            },
        };

        Ok(CycleOutcome {
            report,
            actions_enqueued: enqueued,
            actions_deduped: deduped,
            plan_version: plan.version,
            current_version: current.version,
            report_status,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Run fast-track actions to completion, concurrently across keys.
    async fn run_fast_track(
        &self,
        actions: Vec<Action>,
    ) -> Result<Vec<EnqueueOutcome>, MaintenanceError> {
        let mut waits = JoinSet::new();
        for action in actions {
            let scheduler = self.scheduler.clone();
            waits.spawn(async move { scheduler.enqueue_and_wait(action).await });
        }
        let mut outcomes = Vec::with_capacity(waits.len());
        while let Some(joined) = waits.join_next().await {
            let (outcome, _state) =
                joined.map_err(|e| MaintenanceError::InternalLogic(e.to_string()))??;
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}
