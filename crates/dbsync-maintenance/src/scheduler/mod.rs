//! Bounded worker pool executing convergence actions.
//!
//! `enqueue` hands accepted actions to a dispatcher task over a bounded
//! channel. The dispatcher spawns one task per action; each task first takes
//! the per-key lock, then a worker permit for every attempt, so distinct keys
//! run in parallel up to the worker limit while a single key never has more
//! than one action in flight. Transient failures back off with the key lock
//! held and the worker permit released.

mod locks;
mod retry;

pub use retry::RetryPolicy;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Semaphore, broadcast, mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::action::{Action, ActionFailure, ActionFailures, ActionRecord, ActionState, ActionVerb};
use crate::config::SchedulerConfig;
use crate::error::MaintenanceError;
use crate::model::ResourceKey;
use crate::storage::{ApplyOutcome, DynStorage, StorageError};
use locks::KeyLocks;

/// Finished records kept around for inspection.
const FINISHED_RECORDS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted { id: u64 },
    /// An action with the same key and verb is already queued or running.
    Deduped { id: u64 },
}

impl EnqueueOutcome {
    pub fn id(&self) -> u64 {
        match self {
            EnqueueOutcome::Accepted { id } | EnqueueOutcome::Deduped { id } => *id,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, EnqueueOutcome::Accepted { .. })
    }
}

#[derive(Clone)]
pub struct ActionScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    storage: DynStorage,
    policy: RetryPolicy,
    apply_timeout: Duration,
    capacity: usize,
    locks: Arc<KeyLocks>,
    workers: Arc<Semaphore>,
    queue_tx: mpsc::Sender<Job>,
    state: Mutex<SchedulerState>,
    active_tx: watch::Sender<usize>,
    shutdown_tx: broadcast::Sender<()>,
    closed: AtomicBool,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct SchedulerState {
    next_id: u64,
    active: HashMap<(ResourceKey, ActionVerb), u64>,
    records: BTreeMap<u64, ActionRecord>,
    failures: ActionFailures,
    waiters: HashMap<u64, Vec<oneshot::Sender<ActionState>>>,
}

struct Job {
    id: u64,
    action: Action,
}

enum Completion {
    Succeeded,
    Failed(ActionFailure),
    Cancelled,
}

impl std::fmt::Debug for ActionScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionScheduler")
            .field("active", &*self.inner.active_tx.borrow())
            .field("locked_keys", &self.inner.locks.len())
            .finish()
    }
}

impl ActionScheduler {
    /// Create the scheduler and spawn its dispatcher on the current runtime.
    pub fn start(storage: DynStorage, config: &SchedulerConfig) -> Self {
        let capacity = config.queue_capacity.max(1);
        let (queue_tx, queue_rx) = mpsc::channel(capacity);
        let (shutdown_tx, _) = broadcast::channel(1);
        let (active_tx, _) = watch::channel(0);
        let inner = Arc::new(Inner {
            storage,
            policy: RetryPolicy::from_config(config),
            apply_timeout: config.apply_timeout,
            capacity,
            locks: Arc::new(KeyLocks::new()),
            workers: Arc::new(Semaphore::new(config.workers.max(1))),
            queue_tx,
            state: Mutex::new(SchedulerState::default()),
            active_tx,
            shutdown_tx,
            closed: AtomicBool::new(false),
            dispatcher: Mutex::new(None),
        });
        let handle = tokio::spawn(dispatch(inner.clone(), queue_rx));
        *inner.dispatcher.lock().unwrap() = Some(handle);
        Self { inner }
    }

    /// Accept `action` unless an equivalent one is already queued or running.
    pub fn enqueue(&self, action: Action) -> Result<EnqueueOutcome, MaintenanceError> {
        self.submit(action, None)
    }

    /// Enqueue `action` (or join the equivalent active one) and wait until it
    /// reaches a final state.
    pub async fn enqueue_and_wait(
        &self,
        action: Action,
    ) -> Result<(EnqueueOutcome, ActionState), MaintenanceError> {
        let (tx, rx) = oneshot::channel();
        let outcome = self.submit(action, Some(tx))?;
        let state = rx
            .await
            .map_err(|_| MaintenanceError::TransientIo("action scheduler shut down".into()))?;
        Ok((outcome, state))
    }

    fn submit(
        &self,
        action: Action,
        waiter: Option<oneshot::Sender<ActionState>>,
    ) -> Result<EnqueueOutcome, MaintenanceError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(MaintenanceError::TransientIo(
                "action scheduler shut down".into(),
            ));
        }
        let mut state = self.inner.state.lock().unwrap();
        let slot = (action.key.clone(), action.verb);
        if let Some(&id) = state.active.get(&slot) {
            debug!(key = %action.key, verb = %action.verb, id, "deduplicated action");
            if let Some(waiter) = waiter {
                state.waiters.entry(id).or_default().push(waiter);
            }
            return Ok(EnqueueOutcome::Deduped { id });
        }
        if state.active.len() >= self.inner.capacity {
            return Err(MaintenanceError::TransientIo(format!(
                "action queue is full ({} active)",
                state.active.len()
            )));
        }

        state.next_id += 1;
        let id = state.next_id;
        let job = Job {
            id,
            action: action.clone(),
        };
        if self.inner.queue_tx.try_send(job).is_err() {
            return Err(MaintenanceError::TransientIo(
                "action queue is not accepting work".into(),
            ));
        }
        info!(key = %action.key, verb = %action.verb, id, "enqueued action");
        state.active.insert(slot, id);
        state.records.insert(
            id,
            ActionRecord {
                id,
                action,
                state: ActionState::Queued,
                attempts: 0,
                last_error: None,
            },
        );
        if let Some(waiter) = waiter {
            state.waiters.entry(id).or_default().push(waiter);
        }
        self.inner.active_tx.send_modify(|n| *n += 1);
        Ok(EnqueueOutcome::Accepted { id })
    }

    /// Active and recently finished records, by id.
    pub fn records(&self) -> Vec<ActionRecord> {
        let state = self.inner.state.lock().unwrap();
        state.records.values().cloned().collect()
    }

    /// Terminal failures not yet cleared by a later success.
    pub fn failures(&self) -> ActionFailures {
        self.inner.state.lock().unwrap().failures.clone()
    }

    /// Forget failures of resources that no longer need any action.
    pub fn retain_failures(&self, live: &BTreeSet<ResourceKey>) {
        let mut state = self.inner.state.lock().unwrap();
        state.failures.retain(|key| live.contains(key));
    }

    /// Number of actions queued or running.
    pub fn active(&self) -> usize {
        *self.inner.active_tx.borrow()
    }

    /// Resolve once no action is queued or running.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.active_tx.subscribe();
        // The sender lives as long as `self`, so this only ends on idle.
        let _ = rx.wait_for(|active| *active == 0).await;
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting work, cancel backoffs and in-flight applies, and wait
    /// for the dispatcher to drain.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.shutdown_tx.send(());
        self.inner.workers.close();
        let handle = self.inner.dispatcher.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!("action dispatcher failed: {err}");
            }
        }

        // Jobs still sitting in the channel never ran.
        let mut state = self.inner.state.lock().unwrap();
        let leftover: Vec<u64> = state.active.drain().map(|(_, id)| id).collect();
        for id in &leftover {
            if let Some(record) = state.records.get_mut(id) {
                record.state = ActionState::FailedTransient;
                record.last_error = Some("cancelled by shutdown".into());
            }
        }
        state.waiters.clear();
        drop(state);
        self.inner.active_tx.send_replace(0);
        info!(cancelled = leftover.len(), "action scheduler stopped");
    }
}

impl Inner {
    fn mark_attempt(&self, id: u64, attempts: u32) {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.records.get_mut(&id) {
            record.state = ActionState::Running;
            record.attempts = attempts;
        }
    }

    fn mark_retry(&self, id: u64, err: &StorageError) {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.records.get_mut(&id) {
            record.state = ActionState::FailedTransient;
            record.last_error = Some(err.to_string());
        }
    }

    fn finish(&self, job: &Job, completion: Completion) {
        let mut state = self.state.lock().unwrap();
        let slot = (job.action.key.clone(), job.action.verb);
        let was_active = state.active.get(&slot) == Some(&job.id);
        if was_active {
            state.active.remove(&slot);
        }

        let final_state = match completion {
            Completion::Succeeded => {
                state.failures.remove(&job.action.key, job.action.verb);
                ActionState::Succeeded
            }
            Completion::Failed(failure) => {
                let message = failure.message.clone();
                state.failures.insert(failure);
                if let Some(record) = state.records.get_mut(&job.id) {
                    record.last_error = Some(message);
                }
                ActionState::FailedTerminal
            }
            Completion::Cancelled => {
                if let Some(record) = state.records.get_mut(&job.id) {
                    record.last_error = Some("cancelled by shutdown".into());
                }
                ActionState::FailedTransient
            }
        };
        if let Some(record) = state.records.get_mut(&job.id) {
            record.state = final_state;
        }
        for waiter in state.waiters.remove(&job.id).unwrap_or_default() {
            let _ = waiter.send(final_state);
        }
        trim_finished(&mut state.records);
        drop(state);

        if was_active {
            self.active_tx.send_modify(|n| *n = n.saturating_sub(1));
        }
    }
}

fn trim_finished(records: &mut BTreeMap<u64, ActionRecord>) {
    let finished: Vec<u64> = records
        .values()
        .filter(|r| r.state.is_final())
        .map(|r| r.id)
        .collect();
    let excess = finished.len().saturating_sub(FINISHED_RECORDS);
    for id in finished.into_iter().take(excess) {
        records.remove(&id);
    }
}

async fn dispatch(inner: Arc<Inner>, mut queue_rx: mpsc::Receiver<Job>) {
    let mut shutdown_rx = inner.shutdown_tx.subscribe();
    let mut tasks = JoinSet::new();
    loop {
        tokio::select! {
            job = queue_rx.recv() => match job {
                Some(job) => {
                    tasks.spawn(execute(inner.clone(), job));
                }
                None => break,
            },
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(err) = joined {
                    error!("action task failed: {err}");
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }
    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            error!("action task failed: {err}");
        }
    }
    debug!("action dispatcher exited");
}

async fn execute(inner: Arc<Inner>, job: Job) {
    let mut shutdown_rx = inner.shutdown_tx.subscribe();
    if inner.closed.load(Ordering::SeqCst) {
        inner.finish(&job, Completion::Cancelled);
        return;
    }
    let completion = tokio::select! {
        completion = run_attempts(&inner, &job) => completion,
        _ = shutdown_rx.recv() => {
            warn!(key = %job.action.key, verb = %job.action.verb, "action cancelled by shutdown");
            Completion::Cancelled
        }
    };
    inner.finish(&job, completion);
}

async fn run_attempts(inner: &Inner, job: &Job) -> Completion {
    let action = &job.action;
    let _key_guard = inner.locks.lock(&action.key).await;
    let mut attempts = 0u32;
    loop {
        let Ok(permit) = inner.workers.clone().acquire_owned().await else {
            return Completion::Cancelled;
        };
        attempts += 1;
        inner.mark_attempt(job.id, attempts);
        let result = tokio::time::timeout(inner.apply_timeout, inner.storage.apply(action))
            .await
            .unwrap_or_else(|_| Err(StorageError::Timeout(inner.apply_timeout)));
        drop(permit);

        match result {
            Ok(ApplyOutcome::Applied) => {
                info!(key = %action.key, verb = %action.verb, attempts, "action applied");
                return Completion::Succeeded;
            }
            Ok(ApplyOutcome::AlreadyConverged) => {
                debug!(key = %action.key, verb = %action.verb, "action already converged");
                return Completion::Succeeded;
            }
            Err(err) if err.is_transient() && inner.policy.should_retry(attempts) => {
                let delay = inner.policy.delay(attempts);
                warn!(
                    key = %action.key,
                    verb = %action.verb,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    "action failed, retrying: {err}"
                );
                inner.mark_retry(job.id, &err);
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                error!(
                    key = %action.key,
                    verb = %action.verb,
                    attempts,
                    "action failed terminally: {err}"
                );
                return Completion::Failed(ActionFailure {
                    action: action.clone(),
                    error_num: err.error_num(),
                    message: err.to_string(),
                    attempts,
                });
            }
        }
    }
}
