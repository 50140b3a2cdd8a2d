//! Units of local convergence work and their execution records.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::ResourceKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionVerb {
    CreateDatabase,
    DropDatabase,
    CreateCollection,
    UpdateCollection,
    DropCollection,
    ModifyLeadership,
}

impl ActionVerb {
    /// Verbs that remove data from this server.
    pub fn is_destructive(self) -> bool {
        matches!(self, ActionVerb::DropDatabase | ActionVerb::DropCollection)
    }

    /// Verbs whose completion the cycle waits for before re-sampling local state.
    pub fn is_fast_track(self) -> bool {
        matches!(self, ActionVerb::CreateDatabase)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionVerb::CreateDatabase => "create-database",
            ActionVerb::DropDatabase => "drop-database",
            ActionVerb::CreateCollection => "create-collection",
            ActionVerb::UpdateCollection => "update-collection",
            ActionVerb::DropCollection => "drop-collection",
            ActionVerb::ModifyLeadership => "modify-leadership",
        }
    }
}

impl fmt::Display for ActionVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One idempotent step towards the planned state of a single resource.
///
/// Actions carry no identity of their own: the same inputs always yield an
/// equal action, which is what makes deduplication and cycle idempotence work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub key: ResourceKey,
    pub verb: ActionVerb,
    #[serde(default)]
    pub payload: Value,
}

impl Action {
    pub fn new(key: ResourceKey, verb: ActionVerb, payload: Value) -> Self {
        Self { key, verb, payload }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.verb, self.key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionState {
    Queued,
    Running,
    Succeeded,
    FailedTransient,
    FailedTerminal,
}

impl ActionState {
    pub fn is_final(self) -> bool {
        matches!(self, ActionState::Succeeded | ActionState::FailedTerminal)
    }
}

/// Scheduler-side view of an accepted action.
#[derive(Debug, Clone, Serialize)]
pub struct ActionRecord {
    pub id: u64,
    pub action: Action,
    pub state: ActionState,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// An action that will not be retried any more.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionFailure {
    pub action: Action,
    #[serde(rename = "errorNum")]
    pub error_num: i64,
    #[serde(rename = "errorMessage")]
    pub message: String,
    pub attempts: u32,
}

/// Terminal failures keyed by resource and verb; a newer failure replaces an older one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionFailures {
    entries: BTreeMap<(ResourceKey, ActionVerb), ActionFailure>,
}

impl ActionFailures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, failure: ActionFailure) {
        let slot = (failure.action.key.clone(), failure.action.verb);
        self.entries.insert(slot, failure);
    }

    pub fn remove(&mut self, key: &ResourceKey, verb: ActionVerb) -> Option<ActionFailure> {
        self.entries.remove(&(key.clone(), verb))
    }

    /// Most relevant failure for `key`, preferring non-destructive verbs.
    pub fn for_key(&self, key: &ResourceKey) -> Option<&ActionFailure> {
        self.entries
            .iter()
            .filter(|((k, _), _)| k == key)
            .map(|(_, failure)| failure)
            .min_by_key(|failure| (failure.action.verb.is_destructive(), failure.action.verb))
    }

    /// True when exactly this action already failed terminally.
    ///
    /// A changed payload for the same key and verb is a fresh attempt.
    pub fn suppresses(&self, action: &Action) -> bool {
        self.entries
            .get(&(action.key.clone(), action.verb))
            .is_some_and(|failure| failure.action.payload == action.payload)
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&ResourceKey) -> bool) {
        self.entries.retain(|(key, _), _| keep(key));
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActionFailure> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
