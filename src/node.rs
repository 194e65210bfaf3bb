//! One HA node: every manager wired together for a single process.

use crate::cluster::{ClusterCoordinator, ClusterSnapshot, Node, PeerOracle};
use crate::config::HaConfig;
use crate::error::HaError;
use crate::events::{HaListener, ListenerRegistry, TimedEvent};
use crate::failover::{
    CascadeEvent, DefaultRecoveryHandler, FailoverManager, FailoverMetrics, RecoveryHandler,
};
use crate::state::{
    ConsensusManager, ConsensusMetrics, ConsensusProposal, Lock, LockManager, LockMetrics,
};
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Point-in-time view of a node for dashboards and the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct HaSnapshot {
    pub taken_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub cluster: ClusterSnapshot,
    pub active_locks: Vec<Lock>,
    pub pending_proposals: Vec<ConsensusProposal>,
    pub active_cascades: Vec<CascadeEvent>,
    pub lock_metrics: LockMetrics,
    pub consensus_metrics: ConsensusMetrics,
    pub failover_metrics: FailoverMetrics,
}

pub struct HaNode {
    config: HaConfig,
    listeners: ListenerRegistry,
    cluster: Arc<ClusterCoordinator>,
    locks: LockManager,
    consensus: ConsensusManager,
    failover: FailoverManager,
    started_at: DateTime<Utc>,
}

impl HaNode {
    pub fn new(config: HaConfig, transport: Arc<dyn Transport>) -> Result<Self, HaError> {
        Self::with_recovery_handler(config, transport, Arc::new(DefaultRecoveryHandler))
    }

    pub fn with_recovery_handler(
        config: HaConfig,
        transport: Arc<dyn Transport>,
        handler: Arc<dyn RecoveryHandler>,
    ) -> Result<Self, HaError> {
        config.validate()?;

        let listeners = ListenerRegistry::new();
        let local = Node::new(
            config.node.node_id.clone(),
            config.node.hostname.clone(),
            config.node.port,
        );
        let cluster = Arc::new(ClusterCoordinator::new(
            local,
            config.cluster.clone(),
            transport,
            listeners.clone(),
        ));
        for seed in &config.node.seeds {
            if seed.node_id == config.node.node_id {
                continue;
            }
            cluster.register_node(&seed.node_id, &seed.hostname, seed.port);
        }

        let peers: Arc<dyn PeerOracle> = cluster.clone();
        let locks = LockManager::new(config.locks.clone(), listeners.clone());
        let consensus = ConsensusManager::new(
            config.node.node_id.clone(),
            config.consensus.clone(),
            peers.clone(),
            listeners.clone(),
        );
        let failover = FailoverManager::new(
            config.failover.clone(),
            handler,
            Some(peers),
            listeners.clone(),
        );

        Ok(Self {
            config,
            listeners,
            cluster,
            locks,
            consensus,
            failover,
            started_at: Utc::now(),
        })
    }

    pub fn node_id(&self) -> &str {
        self.cluster.node_id()
    }

    pub fn config(&self) -> &HaConfig {
        &self.config
    }

    pub fn cluster(&self) -> &Arc<ClusterCoordinator> {
        &self.cluster
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn consensus(&self) -> &ConsensusManager {
        &self.consensus
    }

    pub fn failover(&self) -> &FailoverManager {
        &self.failover
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    pub fn register_listener(&self, listener: Arc<dyn HaListener>) {
        self.listeners.register(listener);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TimedEvent> {
        self.listeners.subscribe()
    }

    /// Start every manager, cluster first.
    pub async fn start(&self) -> Result<(), HaError> {
        info!(node_id = %self.node_id(), "Starting HA node");
        self.cluster.start().await?;
        self.locks.start().await?;
        self.consensus.start().await?;
        self.failover.start().await?;
        Ok(())
    }

    /// Stop every manager in reverse start order. All managers are stopped
    /// even if one fails; the first error is returned.
    pub async fn stop(&self) -> Result<(), HaError> {
        info!(node_id = %self.node_id(), "Stopping HA node");
        let results = [
            self.failover.stop().await,
            self.consensus.stop().await,
            self.locks.stop().await,
            self.cluster.stop().await,
        ];

        let mut first = None;
        for result in results {
            if let Err(e) = result {
                warn!(node_id = %self.node_id(), error = %e, "Manager failed to stop");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    pub fn uptime(&self) -> chrono::Duration {
        Utc::now() - self.started_at
    }

    pub fn snapshot(&self) -> HaSnapshot {
        HaSnapshot {
            taken_at: Utc::now(),
            uptime_secs: self.uptime().num_seconds(),
            cluster: self.cluster.snapshot(),
            active_locks: self.locks.active_locks(),
            pending_proposals: self.consensus.pending_proposals(),
            active_cascades: self.failover.active_cascades(),
            lock_metrics: self.locks.metrics(),
            consensus_metrics: self.consensus.metrics(),
            failover_metrics: self.failover.metrics(),
        }
    }
}
