//! Client side of the cluster consensus store ("the Agency").
//!
//! The store itself is external; this crate only models the two calls the
//! maintenance controller consumes: consistent point reads and atomic
//! multi-key write transactions. Two backends implement [`AgencyStore`]:
//! an in-process [`MemAgency`] and an HTTP client [`HttpAgency`] with
//! endpoint failover.

mod config;
mod http_agency;
mod mem_agency;
pub mod ops;
pub mod tree;

pub use config::AgencyConfig;
pub use http_agency::{HttpAgency, INDEX_HEADER};
pub use mem_agency::MemAgency;
pub use ops::{AgencyOperation, Precondition, TransactionOutcome, WriteTransaction};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

pub type AgencyResult<T> = Result<T, AgencyError>;
pub type DynAgency = Arc<dyn AgencyStore>;

/// A point-in-time read of one subtree.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadResult {
    /// The subtree at the requested path, `None` when the path does not exist.
    pub value: Option<Value>,
    /// Commit index of the store at the time of the read.
    pub index: u64,
}

/// Trait implemented by all consensus store backends.
///
/// A single `read` never tears across keys: the returned subtree reflects
/// exactly one committed index. `transact` applies all operations or none.
#[async_trait]
pub trait AgencyStore: Send + Sync {
    async fn read(&self, path: &str) -> AgencyResult<ReadResult>;
    async fn transact(&self, tx: &WriteTransaction) -> AgencyResult<TransactionOutcome>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum AgencyError {
    #[error("no agency endpoints configured")]
    NoEndpoints,
    #[error("invalid agency endpoint '{value}': {reason}")]
    InvalidEndpoint { value: String, reason: String },
    #[error("invalid agency path '{0}'")]
    InvalidPath(String),
    #[error("agency unavailable: {0}")]
    Unavailable(String),
    #[error("agency transport error: {0}")]
    Transport(String),
    #[error("agency request timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed agency response: {0}")]
    Decode(String),
    /// A write reached an endpoint but its outcome is unknown.
    #[error("agency write outcome unknown: {0}")]
    Ambiguous(String),
}

impl AgencyError {
    /// Whether retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AgencyError::Unavailable(_)
                | AgencyError::Transport(_)
                | AgencyError::Timeout(_)
                | AgencyError::Ambiguous(_)
        )
    }
}
