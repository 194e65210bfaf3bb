//! Recovery executor
//!
//! Queues recovery actions by priority and runs them through a pluggable
//! [`RecoveryHandler`], at most `max_concurrent_recoveries` at a time. Each
//! attempt is bounded by the action's timeout; failed attempts are retried
//! after `retry_backoff` until the attempt budget runs out.

use super::types::{RecoveryAction, RecoveryOperation, RecoveryState, RecoveryStrategy};
use crate::config::FailoverConfig;
use crate::error::HaError;
use crate::events::{HaEvent, ListenerRegistry};
use crate::task::TaskGroup;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Notify, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const COMPLETION_CHANNEL_CAPACITY: usize = 256;

/// Performs the actual recovery work for a strategy.
#[async_trait]
pub trait RecoveryHandler: Send + Sync {
    fn supports(&self, strategy: RecoveryStrategy) -> bool;

    /// Returns `Ok(false)` when the attempt ran but did not recover the component.
    async fn execute(&self, action: &RecoveryAction) -> Result<bool, HaError>;

    async fn rollback(&self, operation: &RecoveryOperation) -> Result<bool, HaError>;
}

/// Accepts every strategy and reports success without touching anything.
/// Deployments that need real restarts must supply their own handler.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultRecoveryHandler;

#[async_trait]
impl RecoveryHandler for DefaultRecoveryHandler {
    fn supports(&self, _strategy: RecoveryStrategy) -> bool {
        true
    }

    async fn execute(&self, action: &RecoveryAction) -> Result<bool, HaError> {
        info!(
            component_id = %action.component_id,
            strategy = ?action.strategy,
            "Simulated recovery"
        );
        Ok(true)
    }

    async fn rollback(&self, operation: &RecoveryOperation) -> Result<bool, HaError> {
        info!(operation_id = %operation.operation_id, "Simulated rollback");
        Ok(true)
    }
}

#[derive(Debug, PartialEq, Eq)]
struct QueuedAction {
    priority: u8,
    seq: u64,
    operation_id: Uuid,
}

impl Ord for QueuedAction {
    // Higher priority first, then earlier submissions
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedAction {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct Counters {
    queued: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    rolled_back: AtomicU64,
    recovery_ms_total: AtomicU64,
}

/// Aggregate executor counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutorStats {
    pub queued: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub rolled_back: u64,
    pub average_recovery_ms: f64,
}

#[derive(Clone)]
pub struct RecoveryExecutor {
    config: FailoverConfig,
    handler: Arc<dyn RecoveryHandler>,
    operations: Arc<DashMap<Uuid, RecoveryOperation>>,
    queue: Arc<Mutex<BinaryHeap<QueuedAction>>>,
    seq: Arc<AtomicU64>,
    wakeup: Arc<Notify>,
    permits: Arc<Semaphore>,
    completed_tx: broadcast::Sender<RecoveryOperation>,
    listeners: ListenerRegistry,
    counters: Arc<Counters>,
    tasks: Arc<Mutex<Option<TaskGroup>>>,
}

impl RecoveryExecutor {
    pub fn new(
        config: FailoverConfig,
        handler: Arc<dyn RecoveryHandler>,
        listeners: ListenerRegistry,
    ) -> Self {
        let (completed_tx, _) = broadcast::channel(COMPLETION_CHANNEL_CAPACITY);
        let permits = Arc::new(Semaphore::new(config.max_concurrent_recoveries.max(1)));
        Self {
            config,
            handler,
            operations: Arc::new(DashMap::new()),
            queue: Arc::new(Mutex::new(BinaryHeap::new())),
            seq: Arc::new(AtomicU64::new(0)),
            wakeup: Arc::new(Notify::new()),
            permits,
            completed_tx,
            listeners,
            counters: Arc::new(Counters::default()),
            tasks: Arc::new(Mutex::new(None)),
        }
    }

    /// Queue `action` and return its operation id. If the component already
    /// has a pending or running operation with the same strategy, that
    /// operation's id is returned instead.
    pub fn queue_action(&self, action: RecoveryAction) -> Uuid {
        let mut queue = self.queue.lock();

        if let Some(existing) = self.operations.iter().find(|op| {
            !op.state.is_terminal()
                && op.action.component_id == action.component_id
                && op.action.strategy == action.strategy
        }) {
            debug!(
                component_id = %action.component_id,
                strategy = ?action.strategy,
                operation_id = %existing.operation_id,
                "Recovery already queued"
            );
            return existing.operation_id;
        }

        let operation = RecoveryOperation::new(action);
        let operation_id = operation.operation_id;
        queue.push(QueuedAction {
            priority: operation.action.priority,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            operation_id,
        });
        info!(
            operation_id = %operation_id,
            component_id = %operation.action.component_id,
            strategy = ?operation.action.strategy,
            priority = operation.action.priority,
            "Recovery queued"
        );
        self.operations.insert(operation_id, operation);
        self.counters.queued.fetch_add(1, Ordering::Relaxed);
        drop(queue);

        self.wakeup.notify_one();
        operation_id
    }

    fn next_queued(&self) -> Option<Uuid> {
        self.queue.lock().pop().map(|q| q.operation_id)
    }

    /// Run one operation to completion, retrying within its attempt budget.
    pub async fn execute_operation(&self, operation_id: Uuid) -> Option<RecoveryOperation> {
        let action = {
            let mut op = self.operations.get_mut(&operation_id)?;
            if op.state != RecoveryState::Pending {
                return None;
            }
            op.state = RecoveryState::InProgress;
            op.started_at = Some(Utc::now());
            op.action.clone()
        };
        self.listeners
            .emit(HaEvent::RecoveryStarted { operation_id });

        if !self.handler.supports(action.strategy) {
            warn!(
                operation_id = %operation_id,
                strategy = ?action.strategy,
                "Handler does not support strategy"
            );
            self.set_error(operation_id, format!("unsupported strategy {:?}", action.strategy));
            return self.finish(operation_id, RecoveryState::Failed);
        }

        let budget = action.max_retries.max(1);
        let mut final_state = RecoveryState::Failed;

        for attempt in 1..=budget {
            if let Some(mut op) = self.operations.get_mut(&operation_id) {
                op.attempts = attempt;
            }

            match tokio::time::timeout(action.timeout, self.handler.execute(&action)).await {
                Ok(Ok(true)) => {
                    final_state = RecoveryState::Succeeded;
                    break;
                }
                Ok(Ok(false)) => {
                    final_state = RecoveryState::Failed;
                    self.set_error(operation_id, "handler reported failure".to_string());
                }
                Ok(Err(e)) => {
                    final_state = RecoveryState::Failed;
                    self.set_error(operation_id, e.to_string());
                }
                Err(_) => {
                    final_state = RecoveryState::Timeout;
                    self.set_error(operation_id, HaError::Timeout(action.timeout).to_string());
                }
            }

            warn!(
                operation_id = %operation_id,
                component_id = %action.component_id,
                attempt,
                budget,
                "Recovery attempt failed"
            );
            if attempt < budget {
                tokio::time::sleep(self.config.retry_backoff()).await;
            }
        }

        self.finish(operation_id, final_state)
    }

    fn set_error(&self, operation_id: Uuid, error: String) {
        if let Some(mut op) = self.operations.get_mut(&operation_id) {
            op.last_error = Some(error);
        }
    }

    fn finish(&self, operation_id: Uuid, state: RecoveryState) -> Option<RecoveryOperation> {
        let operation = {
            let mut op = self.operations.get_mut(&operation_id)?;
            op.state = state;
            op.completed_at = Some(Utc::now());
            op.clone()
        };

        let success = state == RecoveryState::Succeeded;
        match state {
            RecoveryState::Succeeded => {
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                let elapsed_ms = operation
                    .duration()
                    .map(|d| d.num_milliseconds().max(0) as u64)
                    .unwrap_or(0);
                self.counters
                    .recovery_ms_total
                    .fetch_add(elapsed_ms, Ordering::Relaxed);
                info!(
                    operation_id = %operation_id,
                    component_id = %operation.action.component_id,
                    attempts = operation.attempts,
                    elapsed_ms,
                    "Recovery succeeded"
                );
            }
            RecoveryState::Timeout => {
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                error!(
                    operation_id = %operation_id,
                    component_id = %operation.action.component_id,
                    attempts = operation.attempts,
                    "Recovery timed out"
                );
            }
            _ => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    operation_id = %operation_id,
                    component_id = %operation.action.component_id,
                    attempts = operation.attempts,
                    error = operation.last_error.as_deref().unwrap_or("unknown"),
                    "Recovery failed"
                );
            }
        }

        self.listeners.emit(HaEvent::RecoveryCompleted {
            operation_id,
            success,
        });
        // Nobody listening is fine
        let _ = self.completed_tx.send(operation.clone());
        Some(operation)
    }

    /// Undo a failed or timed out operation.
    pub async fn rollback_operation(&self, operation_id: Uuid) -> bool {
        let Some(operation) = self.get_operation(operation_id) else {
            return false;
        };
        if !matches!(
            operation.state,
            RecoveryState::Failed | RecoveryState::Timeout
        ) {
            debug!(
                operation_id = %operation_id,
                state = ?operation.state,
                "Rollback refused"
            );
            return false;
        }

        match self.handler.rollback(&operation).await {
            Ok(true) => {
                if let Some(mut op) = self.operations.get_mut(&operation_id) {
                    op.state = RecoveryState::RolledBack;
                }
                self.counters.rolled_back.fetch_add(1, Ordering::Relaxed);
                info!(operation_id = %operation_id, "Recovery rolled back");
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(operation_id = %operation_id, error = %e, "Rollback failed");
                false
            }
        }
    }

    /// Forget terminal operations completed before `now - operation_retention`.
    pub fn prune_completed(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.config.operation_retention())
            .unwrap_or(chrono::Duration::MAX);
        let before = self.operations.len();
        self.operations.retain(|_, op| {
            !(op.state.is_terminal()
                && op.completed_at.is_some_and(|done| now - done >= retention))
        });
        before - self.operations.len()
    }

    pub fn get_operation(&self, operation_id: Uuid) -> Option<RecoveryOperation> {
        self.operations.get(&operation_id).map(|op| op.clone())
    }

    pub fn operations(&self) -> Vec<RecoveryOperation> {
        let mut operations: Vec<RecoveryOperation> =
            self.operations.iter().map(|op| op.clone()).collect();
        operations.sort_by_key(|op| op.queued_at);
        operations
    }

    pub fn active_operations(&self) -> Vec<RecoveryOperation> {
        self.operations()
            .into_iter()
            .filter(|op| !op.state.is_terminal())
            .collect()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn in_flight(&self) -> usize {
        self.config
            .max_concurrent_recoveries
            .max(1)
            .saturating_sub(self.permits.available_permits())
    }

    pub fn subscribe_completed(&self) -> broadcast::Receiver<RecoveryOperation> {
        self.completed_tx.subscribe()
    }

    pub fn stats(&self) -> ExecutorStats {
        let succeeded = self.counters.succeeded.load(Ordering::Relaxed);
        let total_ms = self.counters.recovery_ms_total.load(Ordering::Relaxed);
        ExecutorStats {
            queued: self.counters.queued.load(Ordering::Relaxed),
            succeeded,
            failed: self.counters.failed.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            rolled_back: self.counters.rolled_back.load(Ordering::Relaxed),
            average_recovery_ms: if succeeded == 0 {
                0.0
            } else {
                total_ms as f64 / succeeded as f64
            },
        }
    }

    /// Start the dispatcher. Queued actions start running immediately.
    pub async fn start(&self) -> Result<(), HaError> {
        let group = {
            let mut tasks = self.tasks.lock();
            if tasks.is_some() {
                return Ok(());
            }
            let group = TaskGroup::new("recovery");
            *tasks = Some(group.clone());
            group
        };

        let executor = self.clone();
        let workers = group.clone();
        group.spawn(async move { executor.dispatch(workers).await });
        Ok(())
    }

    async fn dispatch(&self, workers: TaskGroup) {
        loop {
            let permit = match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!(error = %e, "Recovery semaphore closed");
                    return;
                }
            };

            let Some(operation_id) = self.next_queued() else {
                drop(permit);
                self.wakeup.notified().await;
                continue;
            };

            let executor = self.clone();
            workers.spawn(async move {
                executor.execute_operation(operation_id).await;
                drop(permit);
            });
        }
    }

    pub async fn stop(&self) -> Result<(), HaError> {
        let group = self.tasks.lock().take();
        if let Some(group) = group {
            group.shutdown().await;
            self.settle_interrupted();
        }
        Ok(())
    }

    /// Fail operations whose worker was cancelled mid-attempt, and put back
    /// on the queue any that were dequeued but never started.
    fn settle_interrupted(&self) {
        let interrupted: Vec<Uuid> = self
            .operations
            .iter()
            .filter(|op| op.state == RecoveryState::InProgress)
            .map(|op| op.operation_id)
            .collect();
        for operation_id in interrupted {
            self.set_error(operation_id, "cancelled".to_string());
            self.finish(operation_id, RecoveryState::Failed);
        }

        let mut queue = self.queue.lock();
        let queued: HashSet<Uuid> = queue.iter().map(|q| q.operation_id).collect();
        let orphaned: Vec<(u8, Uuid)> = self
            .operations
            .iter()
            .filter(|op| op.state == RecoveryState::Pending && !queued.contains(&op.operation_id))
            .map(|op| (op.action.priority, op.operation_id))
            .collect();
        for (priority, operation_id) in orphaned {
            debug!(operation_id = %operation_id, "Requeueing undispatched recovery");
            queue.push(QueuedAction {
                priority,
                seq: self.seq.fetch_add(1, Ordering::Relaxed),
                operation_id,
            });
        }
    }
}
