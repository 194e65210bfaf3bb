//! Typed event listeners and the event stream shared by one node's managers.

use crate::failover::types::CascadeEvent;
use crate::state::consensus::ConsensusProposal;
use crate::state::locks::Lock;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Callbacks fired by the coordination core. Every method defaults to a no-op,
/// so implementers only override what they care about.
pub trait HaListener: Send + Sync {
    fn on_leader_elected(&self, _node_id: &str, _term: u64) {}

    fn on_lock_acquired(&self, _lock: &Lock) {}

    fn on_lock_released(&self, _lock: &Lock) {}

    fn on_consensus_reached(&self, _proposal: &ConsensusProposal) {}

    fn on_proposal_applied(&self, _proposal: &ConsensusProposal) {}

    fn on_failure_detected(&self, _component_id: &str, _error: &str) {}

    fn on_recovery_started(&self, _operation_id: Uuid) {}

    fn on_recovery_completed(&self, _operation_id: Uuid, _success: bool) {}

    fn on_cascade_detected(&self, _cascade: &CascadeEvent) {}
}

/// Event published on the broadcast stream
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HaEvent {
    LeaderElected { node_id: String, term: u64 },
    LockAcquired { lock: Lock },
    LockReleased { lock: Lock },
    ConsensusReached { proposal: ConsensusProposal },
    ProposalApplied { proposal: ConsensusProposal },
    FailureDetected { component_id: String, error: String },
    RecoveryStarted { operation_id: Uuid },
    RecoveryCompleted { operation_id: Uuid, success: bool },
    CascadeDetected { cascade: CascadeEvent },
}

#[derive(Debug, Clone, Serialize)]
pub struct TimedEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: HaEvent,
}

/// Registry of listeners plus a broadcast stream of the same events.
#[derive(Clone)]
pub struct ListenerRegistry {
    listeners: Arc<RwLock<Vec<Arc<dyn HaListener>>>>,
    event_tx: broadcast::Sender<TimedEvent>,
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.listeners.read().len())
            .field("subscribers", &self.event_tx.receiver_count())
            .finish()
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            listeners: Arc::new(RwLock::new(Vec::new())),
            event_tx,
        }
    }

    pub fn register(&self, listener: Arc<dyn HaListener>) {
        self.listeners.write().push(listener);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TimedEvent> {
        self.event_tx.subscribe()
    }

    /// Dispatch to every listener and publish on the stream.
    pub fn emit(&self, event: HaEvent) {
        // Snapshot so a listener may register others without deadlocking
        let listeners = self.listeners.read().clone();
        for listener in &listeners {
            dispatch(listener.as_ref(), &event);
        }

        // No subscribers is fine
        if self
            .event_tx
            .send(TimedEvent {
                at: Utc::now(),
                event,
            })
            .is_err()
        {
            trace!("No event subscribers");
        }
    }
}

fn dispatch(listener: &dyn HaListener, event: &HaEvent) {
    match event {
        HaEvent::LeaderElected { node_id, term } => listener.on_leader_elected(node_id, *term),
        HaEvent::LockAcquired { lock } => listener.on_lock_acquired(lock),
        HaEvent::LockReleased { lock } => listener.on_lock_released(lock),
        HaEvent::ConsensusReached { proposal } => listener.on_consensus_reached(proposal),
        HaEvent::ProposalApplied { proposal } => listener.on_proposal_applied(proposal),
        HaEvent::FailureDetected {
            component_id,
            error,
        } => listener.on_failure_detected(component_id, error),
        HaEvent::RecoveryStarted { operation_id } => listener.on_recovery_started(*operation_id),
        HaEvent::RecoveryCompleted {
            operation_id,
            success,
        } => listener.on_recovery_completed(*operation_id, *success),
        HaEvent::CascadeDetected { cascade } => listener.on_cascade_detected(cascade),
    }
}
