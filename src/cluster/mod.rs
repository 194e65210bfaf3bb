//! Cluster Membership Module
//!
//! Provides cluster membership and coordination:
//! - Node registry with gossip dissemination
//! - Leader election (Raft-style terms and votes)
//! - A coordinator that owns both and their background loops

pub mod coordinator;
pub mod election;
pub mod registry;
pub mod types;

pub use coordinator::ClusterCoordinator;
pub use election::ElectionManager;
pub use registry::NodeRegistry;
pub use types::{
    ClusterMessage, ClusterSnapshot, ElectionState, GossipMessage, HeartbeatMessage, Node,
    NodeId, NodeRole, NodeStatus, VoteRequest, VoteResponse,
};

/// Read access to the peer set, for components that only need counts.
pub trait PeerOracle: Send + Sync {
    /// Known peers, excluding the local node.
    fn peer_count(&self) -> usize;

    fn healthy_peer_count(&self) -> usize {
        self.peer_count()
    }
}

/// A fixed peer count, for standalone use and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticPeers(pub usize);

impl PeerOracle for StaticPeers {
    fn peer_count(&self) -> usize {
        self.0
    }
}
