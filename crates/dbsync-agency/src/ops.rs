//! Wire-level write operations and transactions.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::tree;

/// One operation against one key of the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum AgencyOperation {
    Set { path: String, value: Value },
    Delete { path: String },
    Increment { path: String },
}

impl AgencyOperation {
    pub fn set(path: impl Into<String>, value: Value) -> Self {
        AgencyOperation::Set {
            path: path.into(),
            value,
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        AgencyOperation::Delete { path: path.into() }
    }

    pub fn increment(path: impl Into<String>) -> Self {
        AgencyOperation::Increment { path: path.into() }
    }

    pub fn path(&self) -> &str {
        match self {
            AgencyOperation::Set { path, .. }
            | AgencyOperation::Delete { path }
            | AgencyOperation::Increment { path } => path,
        }
    }

    /// Body of this operation in the agency write format.
    pub(crate) fn wire_body(&self) -> Value {
        match self {
            AgencyOperation::Set { value, .. } => json!({ "op": "set", "new": value }),
            AgencyOperation::Delete { .. } => json!({ "op": "delete" }),
            AgencyOperation::Increment { .. } => json!({ "op": "increment" }),
        }
    }
}

/// Condition that must hold for a transaction to apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Precondition {
    /// The key holds exactly this value.
    OldValue { path: String, value: Value },
    /// The key is absent (`empty == true`) or present (`empty == false`).
    OldEmpty { path: String, empty: bool },
}

impl Precondition {
    pub fn path(&self) -> &str {
        match self {
            Precondition::OldValue { path, .. } | Precondition::OldEmpty { path, .. } => path,
        }
    }

    /// Evaluate against an in-memory root document.
    pub fn holds(&self, root: &Value) -> bool {
        let segs = tree::segments(self.path());
        match self {
            Precondition::OldValue { value, .. } => tree::get(root, &segs) == Some(value),
            Precondition::OldEmpty { empty, .. } => tree::get(root, &segs).is_none() == *empty,
        }
    }

    pub(crate) fn wire_body(&self) -> Value {
        match self {
            Precondition::OldValue { value, .. } => json!({ "old": value }),
            Precondition::OldEmpty { empty, .. } => json!({ "oldEmpty": empty }),
        }
    }
}

/// An ordered list of operations applied atomically, guarded by preconditions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteTransaction {
    pub operations: Vec<AgencyOperation>,
    #[serde(default)]
    pub preconditions: Vec<Precondition>,
}

impl WriteTransaction {
    pub fn new(operations: Vec<AgencyOperation>) -> Self {
        Self {
            operations,
            preconditions: Vec::new(),
        }
    }

    pub fn with_precondition(mut self, precondition: Precondition) -> Self {
        self.preconditions.push(precondition);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Encode as a single-transaction agency write body, with all keys under `root`.
    ///
    /// Keys appear in operation order. The wire body is a JSON object keyed
    /// by path, so a later operation on an already used path replaces the
    /// earlier one in place.
    pub fn to_wire(&self, root: &str) -> Value {
        let mut ops = Map::new();
        for op in &self.operations {
            ops.insert(prefixed(root, op.path()), op.wire_body());
        }
        let mut pre = Map::new();
        for cond in &self.preconditions {
            pre.insert(prefixed(root, cond.path()), cond.wire_body());
        }
        json!([[Value::Object(ops), Value::Object(pre)]])
    }
}

/// Result of submitting a transaction that reached the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TransactionOutcome {
    Committed { index: u64 },
    /// A precondition did not hold; nothing was applied.
    Rejected,
}

impl TransactionOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, TransactionOutcome::Committed { .. })
    }
}

/// Absolute wire key for `path` below `root` (e.g. `/arango/Current/Version`).
pub fn prefixed(root: &str, path: &str) -> String {
    let root = tree::normalize(root);
    let path = tree::normalize(path);
    if root.is_empty() {
        format!("/{path}")
    } else {
        format!("/{root}/{path}")
    }
}
