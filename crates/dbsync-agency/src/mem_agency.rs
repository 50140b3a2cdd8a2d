use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::ops::{AgencyOperation, TransactionOutcome, WriteTransaction};
use crate::{AgencyError, AgencyResult, AgencyStore, ReadResult, tree};

/// In-process agency with the same atomicity guarantees as the real store.
///
/// Every committed transaction bumps the commit index by one. Reads clone the
/// requested subtree under the lock, so they never observe a half-applied
/// transaction.
#[derive(Clone, Default)]
pub struct MemAgency {
    inner: Arc<RwLock<MemState>>,
}

#[derive(Default)]
struct MemState {
    root: Value,
    index: u64,
    transactions: u64,
    fail_next_reads: usize,
    fail_next_transactions: usize,
}

impl std::fmt::Debug for MemAgency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.read().unwrap();
        f.debug_struct("MemAgency")
            .field("index", &state.index)
            .field("transactions", &state.transactions)
            .finish()
    }
}

impl MemAgency {
    pub fn new() -> Self {
        Self::with_root(Value::Object(Map::new()))
    }

    /// Seed the store with an initial document.
    pub fn with_root(root: Value) -> Self {
        let agency = Self::default();
        agency.inner.write().unwrap().root = root;
        agency
    }

    /// Value at `path` right now, bypassing the async API.
    pub fn get(&self, path: &str) -> Option<Value> {
        let state = self.inner.read().unwrap();
        tree::get(&state.root, &tree::segments(path)).cloned()
    }

    /// Overwrite a single key outside of any transaction (test setup).
    pub fn put(&self, path: &str, value: Value) {
        let mut state = self.inner.write().unwrap();
        tree::set(&mut state.root, &tree::segments(path), value);
        state.index += 1;
    }

    /// Number of transactions that reached the store, committed or rejected.
    pub fn transaction_count(&self) -> u64 {
        self.inner.read().unwrap().transactions
    }

    /// Make the next `n` reads fail as if the store were unreachable.
    pub fn fail_next_reads(&self, n: usize) {
        self.inner.write().unwrap().fail_next_reads = n;
    }

    /// Make the next `n` transactions fail before reaching the store.
    pub fn fail_next_transactions(&self, n: usize) {
        self.inner.write().unwrap().fail_next_transactions = n;
    }
}

fn apply_operation(root: &mut Value, op: &AgencyOperation) -> AgencyResult<()> {
    let segs = tree::key_segments(op.path())?;
    match op {
        AgencyOperation::Set { value, .. } => tree::set(root, &segs, value.clone()),
        AgencyOperation::Delete { .. } => tree::delete(root, &segs),
        AgencyOperation::Increment { .. } => {
            tree::increment(root, &segs, 1);
        }
    }
    Ok(())
}

#[async_trait]
impl AgencyStore for MemAgency {
    async fn read(&self, path: &str) -> AgencyResult<ReadResult> {
        {
            let mut state = self.inner.write().unwrap();
            if state.fail_next_reads > 0 {
                state.fail_next_reads -= 1;
                return Err(AgencyError::Unavailable("injected read failure".into()));
            }
        }
        let state = self.inner.read().unwrap();
        Ok(ReadResult {
            value: tree::get(&state.root, &tree::segments(path)).cloned(),
            index: state.index,
        })
    }

    async fn transact(&self, tx: &WriteTransaction) -> AgencyResult<TransactionOutcome> {
        let mut state = self.inner.write().unwrap();
        if state.fail_next_transactions > 0 {
            state.fail_next_transactions -= 1;
            return Err(AgencyError::Unavailable(
                "injected transaction failure".into(),
            ));
        }
        state.transactions += 1;

        if !tx.preconditions.iter().all(|p| p.holds(&state.root)) {
            return Ok(TransactionOutcome::Rejected);
        }

        // Apply to a scratch copy so an invalid operation leaves the store untouched.
        let mut next = state.root.clone();
        for op in &tx.operations {
            apply_operation(&mut next, op)?;
        }
        state.root = next;
        state.index += 1;
        Ok(TransactionOutcome::Committed { index: state.index })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::Precondition;
    use serde_json::json;

    #[tokio::test]
    async fn transaction_applies_all_operations() {
        let agency = MemAgency::with_root(json!({
            "Current": { "Version": 4, "Databases": { "old": { "PRMR-1": {} } } }
        }));
        let tx = WriteTransaction::new(vec![
            AgencyOperation::set("Current/Databases/db/PRMR-1", json!({ "name": "db" })),
            AgencyOperation::delete("Current/Databases/old"),
            AgencyOperation::increment("Current/Version"),
        ]);
        let outcome = agency.transact(&tx).await.unwrap();
        assert!(outcome.is_committed());
        assert_eq!(agency.get("Current/Version"), Some(json!(5)));
        assert_eq!(agency.get("Current/Databases/old"), None);
        assert_eq!(
            agency.get("Current/Databases/db/PRMR-1/name"),
            Some(json!("db"))
        );
    }

    #[tokio::test]
    async fn rejected_precondition_changes_nothing() {
        let agency = MemAgency::with_root(json!({ "Current": { "Version": 1 } }));
        let index_before = agency.read("Current").await.unwrap().index;
        let tx = WriteTransaction::new(vec![AgencyOperation::increment("Current/Version")])
            .with_precondition(Precondition::OldValue {
                path: "Current/Version".into(),
                value: json!(9),
            });
        assert_eq!(
            agency.transact(&tx).await.unwrap(),
            TransactionOutcome::Rejected
        );
        assert_eq!(agency.get("Current/Version"), Some(json!(1)));
        assert_eq!(agency.read("Current").await.unwrap().index, index_before);
    }

    #[tokio::test]
    async fn invalid_operation_is_atomic() {
        let agency = MemAgency::with_root(json!({ "Current": { "Version": 1 } }));
        let tx = WriteTransaction::new(vec![
            AgencyOperation::increment("Current/Version"),
            AgencyOperation::set("/", json!(null)),
        ]);
        assert!(matches!(
            agency.transact(&tx).await,
            Err(AgencyError::InvalidPath(_))
        ));
        assert_eq!(agency.get("Current/Version"), Some(json!(1)));
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let agency = MemAgency::new();
        agency.fail_next_transactions(1);
        let tx = WriteTransaction::new(vec![AgencyOperation::increment("Current/Version")]);
        let err = agency.transact(&tx).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(agency.transaction_count(), 0);
        assert!(agency.transact(&tx).await.unwrap().is_committed());
        assert_eq!(agency.get("Current/Version"), Some(json!(1)));
    }

    #[tokio::test]
    async fn read_returns_subtree_and_index() {
        let agency = MemAgency::with_root(json!({ "Plan": { "Version": 2 } }));
        agency.put("Plan/Databases/db", json!({ "id": "1" }));
        let read = agency.read("/Plan").await.unwrap();
        assert_eq!(read.index, 1);
        assert_eq!(
            read.value,
            Some(json!({ "Version": 2, "Databases": { "db": { "id": "1" } } }))
        );
        assert_eq!(agency.read("Nope").await.unwrap().value, None);
    }
}
