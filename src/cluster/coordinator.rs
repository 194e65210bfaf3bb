//! Cluster Coordinator
//!
//! Node-facing API over membership and election:
//! - Register / deregister nodes
//! - Dispatch inbound gossip, heartbeat and vote messages
//! - Own the gossip, election and heartbeat loops

use super::election::ElectionManager;
use super::registry::NodeRegistry;
use super::types::{
    ClusterMessage, ClusterSnapshot, GossipMessage, HeartbeatMessage, Node, NodeId, NodeRole,
    VoteRequest, VoteResponse,
};
use super::PeerOracle;
use crate::config::ClusterConfig;
use crate::error::HaError;
use crate::events::ListenerRegistry;
use crate::task::TaskGroup;
use crate::transport::Transport;
use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Clone)]
pub struct ClusterCoordinator {
    config: ClusterConfig,
    registry: NodeRegistry,
    election: ElectionManager,
    transport: Arc<dyn Transport>,
    tasks: Arc<Mutex<Option<TaskGroup>>>,
    gossip_rounds: Arc<AtomicU64>,
}

impl ClusterCoordinator {
    pub fn new(
        local: Node,
        config: ClusterConfig,
        transport: Arc<dyn Transport>,
        listeners: ListenerRegistry,
    ) -> Self {
        let registry = NodeRegistry::new(local);
        let election = ElectionManager::new(registry.clone(), &config, transport.clone(), listeners);

        Self {
            config,
            registry,
            election,
            transport,
            tasks: Arc::new(Mutex::new(None)),
            gossip_rounds: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn node_id(&self) -> &str {
        self.registry.local_id()
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn election(&self) -> &ElectionManager {
        &self.election
    }

    pub fn register_node(&self, node_id: &str, hostname: &str, port: u16) -> Node {
        self.registry.register_node(node_id, hostname, port)
    }

    pub fn deregister_node(&self, node_id: &str) -> bool {
        self.registry.deregister_node(node_id)
    }

    /// Route an inbound message. Vote requests produce a reply.
    pub fn handle_message(&self, message: ClusterMessage) -> Option<ClusterMessage> {
        match message {
            ClusterMessage::Gossip(gossip) => {
                self.handle_gossip(&gossip);
                None
            }
            ClusterMessage::Heartbeat(heartbeat) => {
                self.handle_heartbeat(&heartbeat);
                None
            }
            ClusterMessage::VoteRequest(request) => {
                Some(ClusterMessage::VoteResponse(self.handle_vote_request(&request)))
            }
            ClusterMessage::VoteResponse(response) => {
                self.handle_vote_response(&response);
                None
            }
        }
    }

    pub fn handle_gossip(&self, message: &GossipMessage) -> usize {
        self.registry.handle_gossip(message)
    }

    pub fn handle_heartbeat(&self, heartbeat: &HeartbeatMessage) -> bool {
        let accepted = self.election.handle_heartbeat(heartbeat);
        if accepted {
            self.registry.touch(&heartbeat.leader_id);
        }
        accepted
    }

    pub fn handle_vote_request(&self, request: &VoteRequest) -> VoteResponse {
        self.registry.touch(&request.candidate_id);
        self.election.handle_vote_request(request)
    }

    pub fn handle_vote_response(&self, response: &VoteResponse) -> bool {
        self.registry.touch(&response.voter_id);
        self.election.handle_vote_response(response)
    }

    pub async fn start_election(&self) -> bool {
        self.election.start_election().await
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.election.leader_id()
    }

    pub fn is_leader(&self) -> bool {
        self.election.is_leader()
    }

    pub fn current_term(&self) -> u64 {
        self.election.current_term()
    }

    pub fn role(&self) -> NodeRole {
        self.election.role()
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.registry.nodes()
    }

    pub fn peers(&self) -> Vec<Node> {
        self.registry.peers()
    }

    pub fn gossip_rounds(&self) -> u64 {
        self.gossip_rounds.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ClusterSnapshot {
        let state = self.election.state();
        ClusterSnapshot {
            node_id: self.node_id().to_string(),
            role: state.role,
            term: state.current_term,
            leader_id: state.leader_id,
            voted_for: state.voted_for,
            nodes: self.registry.nodes(),
        }
    }

    /// Push our view to up to `gossip_fanout` random peers. Returns how many
    /// sends succeeded.
    pub async fn gossip_round(&self) -> Result<usize, HaError> {
        let targets = self.registry.select_gossip_targets(self.config.gossip_fanout);
        self.gossip_rounds.fetch_add(1, Ordering::Relaxed);
        if targets.is_empty() {
            return Ok(0);
        }

        let message = self.registry.build_gossip_message(self.current_term());
        let sends = targets.iter().map(|peer| {
            let message = message.clone();
            async move { (peer, self.transport.send_gossip(peer, message).await) }
        });

        let mut delivered = 0;
        let mut last_error = None;
        for (peer, result) in join_all(sends).await {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!(peer = %peer.node_id, error = %e, "Gossip send failed");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if delivered == 0 => Err(e),
            _ => Ok(delivered),
        }
    }

    pub fn reconcile_membership(&self) -> usize {
        self.registry
            .reconcile_stale(
                Utc::now(),
                self.config.suspect_timeout(),
                self.config.dead_timeout(),
            )
            .len()
    }

    pub fn is_running(&self) -> bool {
        self.tasks.lock().is_some()
    }

    /// Start the gossip, election and heartbeat loops.
    pub async fn start(&self) -> Result<(), HaError> {
        let group = {
            let mut tasks = self.tasks.lock();
            if tasks.is_some() {
                return Ok(());
            }
            let group = TaskGroup::new("cluster");
            *tasks = Some(group.clone());
            group
        };

        info!(node_id = %self.node_id(), "Starting cluster coordinator");
        let backoff = self.config.loop_error_backoff();

        let coordinator = self.clone();
        group.spawn_loop("gossip", self.config.gossip_interval(), backoff, move || {
            let coordinator = coordinator.clone();
            async move {
                coordinator.reconcile_membership();
                coordinator.gossip_round().await.map(|_| ())
            }
        });

        let coordinator = self.clone();
        group.spawn_loop(
            "election",
            self.config.election_check_interval(),
            backoff,
            move || {
                let coordinator = coordinator.clone();
                async move {
                    coordinator.election.check_election_timeout().await;
                    Ok(())
                }
            },
        );

        let coordinator = self.clone();
        group.spawn_loop(
            "heartbeat",
            self.config.heartbeat_interval(),
            backoff,
            move || {
                let coordinator = coordinator.clone();
                async move { coordinator.election.send_heartbeat().await }
            },
        );

        Ok(())
    }

    /// Cancel the background loops and wait for them to finish.
    pub async fn stop(&self) -> Result<(), HaError> {
        let group = self.tasks.lock().take();
        if let Some(group) = group {
            info!(node_id = %self.node_id(), "Stopping cluster coordinator");
            group.shutdown().await;
        }
        Ok(())
    }
}

impl PeerOracle for ClusterCoordinator {
    fn peer_count(&self) -> usize {
        self.registry.peer_count()
    }

    fn healthy_peer_count(&self) -> usize {
        self.registry.healthy_peer_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::NoopTransport;
    use std::time::Duration;

    fn fast_config() -> ClusterConfig {
        ClusterConfig {
            gossip_interval_ms: 20,
            election_timeout_min_ms: 50,
            election_timeout_max_ms: 80,
            heartbeat_timeout_ms: 20,
            election_check_interval_ms: 10,
            ..ClusterConfig::default()
        }
    }

    #[tokio::test]
    async fn test_coordinator_creation() {
        let coordinator = ClusterCoordinator::new(
            Node::new("a", "127.0.0.1", 7000),
            ClusterConfig::default(),
            Arc::new(NoopTransport),
            ListenerRegistry::new(),
        );

        assert_eq!(coordinator.node_id(), "a");
        assert_eq!(coordinator.role(), NodeRole::Follower);
        assert_eq!(coordinator.peer_count(), 0);
        assert_eq!(coordinator.nodes().len(), 1);
        assert!(!coordinator.is_running());
    }

    #[tokio::test]
    async fn test_handle_message_dispatch() {
        let coordinator = ClusterCoordinator::new(
            Node::new("a", "127.0.0.1", 7000),
            ClusterConfig::default(),
            Arc::new(NoopTransport),
            ListenerRegistry::new(),
        );
        coordinator.register_node("b", "127.0.0.1", 7001);

        let reply = coordinator.handle_message(ClusterMessage::VoteRequest(VoteRequest {
            candidate_id: "b".to_string(),
            term: 1,
        }));
        match reply {
            Some(ClusterMessage::VoteResponse(response)) => {
                assert!(response.granted);
                assert_eq!(response.voter_id, "a");
            }
            other => panic!("unexpected reply: {:?}", other),
        }

        let reply = coordinator.handle_message(ClusterMessage::Heartbeat(HeartbeatMessage {
            leader_id: "b".to_string(),
            term: 1,
            sent_at: Utc::now(),
        }));
        assert!(reply.is_none());
        assert_eq!(coordinator.leader_id().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_start_stop_single_node_becomes_leader() {
        let coordinator = ClusterCoordinator::new(
            Node::new("solo", "127.0.0.1", 7000),
            fast_config(),
            Arc::new(NoopTransport),
            ListenerRegistry::new(),
        );

        coordinator.start().await.unwrap();
        assert!(coordinator.is_running());
        // Second start is a no-op
        coordinator.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(coordinator.is_leader());
        assert!(coordinator.gossip_rounds() > 0);

        coordinator.stop().await.unwrap();
        assert!(!coordinator.is_running());

        let rounds = coordinator.gossip_rounds();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(coordinator.gossip_rounds(), rounds);
    }
}
