//! Long-lived maintenance loop.
//!
//! The daemon runs a select loop that:
//! 1. Starts a cycle on every heartbeat tick or trigger notification
//! 2. Publishes the outcome of each cycle on a status channel
//! 3. Handles graceful shutdown, also in the middle of a cycle
//!
//! Cycles never overlap. Notifications that arrive while a cycle runs
//! collapse into a single follow-up cycle.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Notify, broadcast, watch};
use tokio::time::MissedTickBehavior;

use crate::engine::{CycleOutcome, ReconciliationEngine, ReportStatus};
use crate::error::MaintenanceError;

/// Requests a reconciliation cycle. Cheap to clone and fire-and-forget.
#[derive(Debug, Clone, Default)]
pub struct SyncTrigger {
    notify: Arc<Notify>,
}

impl SyncTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for a cycle. Repeated calls before the next cycle starts count once.
    pub fn notify(&self) {
        self.notify.notify_one();
    }

    async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// Summary of the daemon's progress, published after every cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncStatus {
    pub running: bool,
    pub cycles: u64,
    pub failed_cycles: u64,
    pub plan_version: u64,
    pub current_version: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_report: Option<ReportStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

pub struct MaintenanceDaemon {
    engine: Arc<ReconciliationEngine>,
    trigger: SyncTrigger,
    heartbeat: Duration,
    shutdown_rx: broadcast::Receiver<()>,
    status_tx: watch::Sender<SyncStatus>,
}

impl MaintenanceDaemon {
    pub fn new(
        engine: Arc<ReconciliationEngine>,
        trigger: SyncTrigger,
        heartbeat: Duration,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        let (status_tx, _) = watch::channel(SyncStatus::default());
        Self {
            engine,
            trigger,
            heartbeat,
            shutdown_rx,
            status_tx,
        }
    }

    pub fn trigger(&self) -> SyncTrigger {
        self.trigger.clone()
    }

    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    /// Run until a shutdown signal arrives, then stop the action scheduler.
    ///
    /// The first heartbeat tick fires immediately, so a cycle starts as soon
    /// as the daemon runs.
    pub async fn run(mut self) {
        tracing::info!(
            server = self.engine.server_id(),
            heartbeat_ms = self.heartbeat.as_millis() as u64,
            "maintenance daemon started"
        );
        let mut heartbeat = tokio::time::interval(self.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {}
                _ = self.trigger.notified() => {
                    tracing::debug!("cycle requested by trigger");
                }
                _ = self.shutdown_rx.recv() => {
                    tracing::info!("shutdown requested");
                    break;
                }
            }

            self.status_tx.send_modify(|status| status.running = true);
            let result = tokio::select! {
                result = self.engine.run_once() => Some(result),
                _ = self.shutdown_rx.recv() => None,
            };
            let Some(result) = result else {
                tracing::info!("shutdown requested during cycle");
                break;
            };
            self.publish(result);
        }

        self.engine.scheduler().shutdown().await;
        self.status_tx.send_modify(|status| status.running = false);
        tracing::info!("maintenance daemon stopped");
    }

    fn publish(&self, result: Result<CycleOutcome, MaintenanceError>) {
        self.status_tx.send_modify(|status| {
            status.running = false;
            status.cycles += 1;
            match result {
                Ok(outcome) => {
                    status.plan_version = outcome.plan_version;
                    status.current_version = outcome.current_version;
                    if let ReportStatus::Failed { error } = &outcome.report_status {
                        status.last_error = Some(error.clone());
                    } else {
                        status.last_error = None;
                    }
                    status.last_report = Some(outcome.report_status);
                }
                Err(err) => {
                    status.failed_cycles += 1;
                    status.last_error = Some(err.to_string());
                }
            }
        });
    }
}
