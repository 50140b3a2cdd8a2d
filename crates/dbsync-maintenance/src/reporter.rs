use std::sync::Arc;
use std::time::Duration;

use dbsync_agency::{AgencyOperation, DynAgency, TransactionOutcome, WriteTransaction};
use tracing::{debug, error, info};

use crate::cluster_info::PlanCurrentClient;
use crate::error::MaintenanceError;
use crate::model::{CURRENT, CURRENT_VERSION};
use crate::report::Report;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The report was empty; nothing was sent.
    Skipped,
    Committed { index: u64 },
}

/// Commits reports to Current.
///
/// A non-empty report becomes exactly one agency transaction: its entries
/// in path order followed by one increment of `Current/Version`. Either all
/// of it applies, version bump included, or none of it does.
pub struct AgencyReporter {
    agency: DynAgency,
    cluster: Arc<PlanCurrentClient>,
    timeout: Duration,
}

impl AgencyReporter {
    pub fn new(agency: DynAgency, cluster: Arc<PlanCurrentClient>, timeout: Duration) -> Self {
        Self {
            agency,
            cluster,
            timeout,
        }
    }

    /// The transaction `report` is submitted as, or `None` for an empty report.
    pub fn transaction(report: &Report) -> Result<Option<WriteTransaction>, MaintenanceError> {
        if report.is_empty() {
            return Ok(None);
        }
        let mut operations = report.operations();
        if let Some(op) = operations.iter().find(|op| !is_current_path(op.path())) {
            return Err(MaintenanceError::InternalLogic(format!(
                "report entry '{}' is outside {CURRENT}",
                op.path()
            )));
        }
        operations.push(AgencyOperation::increment(CURRENT_VERSION));
        Ok(Some(WriteTransaction::new(operations)))
    }

    pub async fn submit(&self, report: &Report) -> Result<SubmitOutcome, MaintenanceError> {
        let Some(tx) = Self::transaction(report)? else {
            debug!("empty report, nothing to submit");
            return Ok(SubmitOutcome::Skipped);
        };
        let outcome = match tokio::time::timeout(self.timeout, self.agency.transact(&tx)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                error!(entries = report.len(), "report submission failed: {err}");
                return Err(MaintenanceError::AgencyComm(err.to_string()));
            }
            Err(_) => {
                error!(entries = report.len(), "report submission timed out");
                return Err(MaintenanceError::AgencyComm(format!(
                    "report submission timed out after {:?}",
                    self.timeout
                )));
            }
        };
        match outcome {
            TransactionOutcome::Committed { index } => {
                self.cluster.invalidate_current();
                info!(entries = report.len(), index, "committed report to current");
                Ok(SubmitOutcome::Committed { index })
            }
            TransactionOutcome::Rejected => {
                error!(entries = report.len(), "report transaction rejected");
                Err(MaintenanceError::AgencyComm(
                    "report transaction rejected by precondition".into(),
                ))
            }
        }
    }
}

fn is_current_path(path: &str) -> bool {
    path.strip_prefix(CURRENT)
        .is_some_and(|rest| rest.starts_with('/') && rest.len() > 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use dbsync_agency::MemAgency;
    use serde_json::json;

    fn reporter(agency: &MemAgency) -> AgencyReporter {
        let shared: DynAgency = Arc::new(agency.clone());
        let cluster = Arc::new(PlanCurrentClient::new(shared.clone()));
        AgencyReporter::new(shared, cluster, Duration::from_secs(5))
    }

    fn sample_report() -> Report {
        let mut report = Report::new();
        report.set("Current/Databases/db/PRMR-0001", json!({ "name": "db" }));
        report.delete("Current/Databases/old/PRMR-0001");
        report
    }

    #[tokio::test]
    async fn empty_report_sends_nothing() {
        let agency = MemAgency::with_root(json!({ "Current": { "Version": 1 } }));
        let outcome = reporter(&agency).submit(&Report::new()).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Skipped);
        assert_eq!(agency.transaction_count(), 0);
        assert_eq!(agency.get("Current/Version"), Some(json!(1)));
    }

    #[tokio::test]
    async fn report_and_version_bump_commit_together() {
        let agency = MemAgency::with_root(json!({
            "Current": { "Version": 1, "Databases": { "old": { "PRMR-0001": {} } } }
        }));
        let outcome = reporter(&agency).submit(&sample_report()).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Committed { .. }));
        assert_eq!(agency.transaction_count(), 1);
        assert_eq!(agency.get("Current/Version"), Some(json!(2)));
        assert_eq!(
            agency.get("Current/Databases/db/PRMR-0001"),
            Some(json!({ "name": "db" }))
        );
        assert_eq!(agency.get("Current/Databases/old/PRMR-0001"), None);
    }

    #[tokio::test]
    async fn failed_submission_leaves_version_alone() {
        let agency = MemAgency::with_root(json!({ "Current": { "Version": 1 } }));
        agency.fail_next_transactions(1);
        let reporter = reporter(&agency);

        let err = reporter.submit(&sample_report()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AgencyComm);
        assert_eq!(agency.get("Current/Version"), Some(json!(1)));

        reporter.submit(&sample_report()).await.unwrap();
        assert_eq!(agency.get("Current/Version"), Some(json!(2)));
    }

    #[test]
    fn entries_outside_current_are_refused() {
        let mut report = Report::new();
        report.set("Plan/Databases/db", json!({}));
        let err = AgencyReporter::transaction(&report).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InternalLogic);
        assert!(!is_current_path("CurrentVersion"));
        assert!(!is_current_path("Current/"));
    }

    #[test]
    fn version_increment_is_last() {
        let tx = AgencyReporter::transaction(&sample_report()).unwrap().unwrap();
        assert_eq!(tx.operations.len(), 3);
        assert_eq!(
            tx.operations.last(),
            Some(&AgencyOperation::increment(CURRENT_VERSION))
        );
    }
}
