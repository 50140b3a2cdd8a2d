//! Pending writes for Current produced by phase two.

use std::collections::BTreeMap;

use dbsync_agency::AgencyOperation;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One pending write, addressed by its path in the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ReportEntry {
    Set { payload: Value },
    Delete,
}

/// Keyed set of writes destined for Current.
///
/// Keys are slash-separated agency paths such as
/// `Current/Databases/db/PRMR-0001`. A sorted map keeps the serialized form
/// stable for identical inputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Report {
    entries: BTreeMap<String, ReportEntry>,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, path: impl Into<String>, payload: Value) {
        self.entries
            .insert(path.into(), ReportEntry::Set { payload });
    }

    pub fn delete(&mut self, path: impl Into<String>) {
        self.entries.insert(path.into(), ReportEntry::Delete);
    }

    pub fn get(&self, path: &str) -> Option<&ReportEntry> {
        self.entries.get(path)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ReportEntry)> {
        self.entries.iter()
    }

    /// Operations for the report entries, in path order.
    pub fn operations(&self) -> Vec<AgencyOperation> {
        self.entries
            .iter()
            .map(|(path, entry)| match entry {
                ReportEntry::Set { payload } => AgencyOperation::set(path.clone(), payload.clone()),
                ReportEntry::Delete => AgencyOperation::delete(path.clone()),
            })
            .collect()
    }
}
