//! Peer transport seam.
//!
//! The core never opens sockets. Everything it sends to other nodes goes
//! through a [`Transport`] supplied by whoever owns the process.

use crate::cluster::types::{GossipMessage, HeartbeatMessage, Node, NodeId, VoteRequest};
use crate::cluster::ClusterCoordinator;
use crate::error::HaError;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_gossip(&self, peer: &Node, message: GossipMessage) -> Result<(), HaError>;

    /// Deliver a leader heartbeat to every peer.
    async fn send_heartbeat(&self, message: HeartbeatMessage) -> Result<(), HaError>;

    /// Solicit votes for a candidacy. Responses, if any, come back through
    /// `ClusterCoordinator::handle_vote_response`.
    async fn send_vote_request(&self, _request: VoteRequest) -> Result<(), HaError> {
        Ok(())
    }
}

/// Drops every message. Suitable for a single-node deployment.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTransport;

#[async_trait]
impl Transport for NoopTransport {
    async fn send_gossip(&self, peer: &Node, _message: GossipMessage) -> Result<(), HaError> {
        trace!(peer = %peer.node_id, "Dropping gossip");
        Ok(())
    }

    async fn send_heartbeat(&self, _message: HeartbeatMessage) -> Result<(), HaError> {
        Ok(())
    }
}

/// In-process network connecting coordinators by node id.
///
/// Coordinators are held weakly so the network never keeps a node alive.
#[derive(Default)]
pub struct InMemoryNetwork {
    nodes: DashMap<NodeId, Weak<ClusterCoordinator>>,
    isolated: DashSet<NodeId>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl InMemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attach(&self, coordinator: &Arc<ClusterCoordinator>) {
        self.nodes.insert(
            coordinator.node_id().to_string(),
            Arc::downgrade(coordinator),
        );
    }

    pub fn detach(&self, node_id: &str) {
        self.nodes.remove(node_id);
    }

    /// Cut a node off: nothing it sends arrives, nothing sent to it arrives.
    pub fn isolate(&self, node_id: &str) {
        debug!(node_id = %node_id, "Isolating node from in-memory network");
        self.isolated.insert(node_id.to_string());
    }

    pub fn heal(&self, node_id: &str) {
        self.isolated.remove(node_id);
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn route(&self, from: &str, to: &str) -> Result<Arc<ClusterCoordinator>, HaError> {
        if self.isolated.contains(from) || self.isolated.contains(to) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(HaError::transport(format!("{} -> {}: partitioned", from, to)));
        }

        let target = self
            .nodes
            .get(to)
            .and_then(|weak| weak.upgrade())
            .ok_or_else(|| {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                HaError::transport(format!("{} -> {}: unreachable", from, to))
            })?;

        self.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(target)
    }

    fn others(&self, from: &str) -> Vec<NodeId> {
        self.nodes
            .iter()
            .map(|e| e.key().clone())
            .filter(|id| id != from)
            .collect()
    }
}

#[async_trait]
impl Transport for InMemoryNetwork {
    async fn send_gossip(&self, peer: &Node, message: GossipMessage) -> Result<(), HaError> {
        let target = self.route(&message.sender_id, &peer.node_id)?;
        target.handle_gossip(&message);
        Ok(())
    }

    async fn send_heartbeat(&self, message: HeartbeatMessage) -> Result<(), HaError> {
        for peer in self.others(&message.leader_id) {
            if let Ok(target) = self.route(&message.leader_id, &peer) {
                target.handle_heartbeat(&message);
            }
        }
        Ok(())
    }

    async fn send_vote_request(&self, request: VoteRequest) -> Result<(), HaError> {
        let candidate = self
            .nodes
            .get(&request.candidate_id)
            .and_then(|weak| weak.upgrade())
            .ok_or_else(|| HaError::transport("candidate is not attached"))?;

        for peer in self.others(&request.candidate_id) {
            let Ok(voter) = self.route(&request.candidate_id, &peer) else {
                continue;
            };
            let response = voter.handle_vote_request(&request);
            if self.route(&peer, &request.candidate_id).is_ok() {
                candidate.handle_vote_response(&response);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::events::ListenerRegistry;

    fn coordinator(id: &str, network: &Arc<InMemoryNetwork>) -> Arc<ClusterCoordinator> {
        let coordinator = Arc::new(ClusterCoordinator::new(
            Node::new(id, "127.0.0.1", 7000),
            ClusterConfig::default(),
            network.clone(),
            ListenerRegistry::new(),
        ));
        network.attach(&coordinator);
        coordinator
    }

    #[tokio::test]
    async fn test_gossip_is_delivered() {
        let network = InMemoryNetwork::new();
        let a = coordinator("a", &network);
        let b = coordinator("b", &network);
        a.register_node("b", "127.0.0.1", 7000);

        assert_eq!(a.gossip_round().await.unwrap(), 1);
        assert!(b.registry().contains("a"));
        assert_eq!(network.delivered(), 1);
    }

    #[tokio::test]
    async fn test_isolated_node_gets_nothing() {
        let network = InMemoryNetwork::new();
        let a = coordinator("a", &network);
        let b = coordinator("b", &network);
        a.register_node("b", "127.0.0.1", 7000);
        network.isolate("b");

        assert!(a.gossip_round().await.is_err());
        assert!(!b.registry().contains("a"));
        assert_eq!(network.dropped(), 1);

        network.heal("b");
        assert_eq!(a.gossip_round().await.unwrap(), 1);
        assert!(b.registry().contains("a"));
    }

    #[tokio::test]
    async fn test_dropped_coordinator_is_unreachable() {
        let network = InMemoryNetwork::new();
        let a = coordinator("a", &network);
        let b = coordinator("b", &network);
        a.register_node("b", "127.0.0.1", 7000);
        drop(b);

        let err = network
            .send_gossip(&a.registry().get("b").unwrap(), a.registry().build_gossip_message(0))
            .await
            .unwrap_err();
        assert!(matches!(err, HaError::Transport(_)));
    }
}
