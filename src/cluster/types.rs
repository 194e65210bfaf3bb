//! Cluster Membership Types
//!
//! Core types for membership and leader election:
//! - Node identification and liveness status
//! - Gossip, heartbeat and vote messages
//! - Per-process election state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

pub type NodeId = String;

/// Liveness status of a known node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    /// Node was seen recently
    Healthy,
    /// Node missed its suspect deadline
    Suspect,
    /// Node missed its dead deadline
    Dead,
    /// Node status is unknown
    Unknown,
}

/// A known member of the cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: NodeId,
    pub hostname: String,
    pub port: u16,
    pub status: NodeStatus,
    pub last_seen: DateTime<Utc>,
}

impl Node {
    pub fn new(node_id: impl Into<NodeId>, hostname: impl Into<String>, port: u16) -> Self {
        Self {
            node_id: node_id.into(),
            hostname: hostname.into(),
            port,
            status: NodeStatus::Healthy,
            last_seen: Utc::now(),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

/// Node roles in leader election
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeRole {
    Follower,
    Candidate,
    Leader,
}

/// Election bookkeeping, one instance per process
#[derive(Debug, Clone)]
pub struct ElectionState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    pub leader_id: Option<NodeId>,
    pub role: NodeRole,
    pub election_deadline: Instant,
    /// Granted votes collected during the current candidacy
    pub votes_received: Vec<NodeId>,
}

impl ElectionState {
    pub fn new(election_deadline: Instant) -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            leader_id: None,
            role: NodeRole::Follower,
            election_deadline,
            votes_received: Vec::new(),
        }
    }
}

/// A node's view of the cluster, pushed to random peers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipMessage {
    pub sender_id: NodeId,
    pub term: u64,
    pub nodes: Vec<Node>,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    pub leader_id: NodeId,
    pub term: u64,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub candidate_id: NodeId,
    pub term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub voter_id: NodeId,
    pub term: u64,
    pub granted: bool,
}

/// Inbound messages dispatched by the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClusterMessage {
    Gossip(GossipMessage),
    Heartbeat(HeartbeatMessage),
    VoteRequest(VoteRequest),
    VoteResponse(VoteResponse),
}

/// Read-only view of cluster state for dashboards
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub node_id: NodeId,
    pub role: NodeRole,
    pub term: u64,
    pub leader_id: Option<NodeId>,
    pub voted_for: Option<NodeId>,
    pub nodes: Vec<Node>,
}
