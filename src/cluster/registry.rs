//! Node registry and gossip dissemination.

use super::types::{GossipMessage, Node, NodeId, NodeStatus};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::seq::IndexedRandom;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Known peers and their last-seen status.
///
/// The local node is always present and always `Healthy`; everything
/// that talks about "peers" excludes it.
#[derive(Clone, Debug)]
pub struct NodeRegistry {
    local_id: NodeId,
    nodes: Arc<DashMap<NodeId, Node>>,
}

impl NodeRegistry {
    pub fn new(local: Node) -> Self {
        let nodes = DashMap::new();
        let local_id = local.node_id.clone();
        nodes.insert(local_id.clone(), local);
        Self {
            local_id,
            nodes: Arc::new(nodes),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Add or overwrite a node entry.
    pub fn register_node(&self, node_id: &str, hostname: &str, port: u16) -> Node {
        let node = Node::new(node_id, hostname, port);
        let previous = self.nodes.insert(node_id.to_string(), node.clone());
        if previous.is_none() {
            info!(node_id = %node_id, address = %node.address(), "Registered node");
        } else {
            debug!(node_id = %node_id, "Re-registered node");
        }
        node
    }

    /// Remove a node entry. The local node cannot be removed.
    pub fn deregister_node(&self, node_id: &str) -> bool {
        if node_id == self.local_id {
            return false;
        }
        let removed = self.nodes.remove(node_id).is_some();
        if removed {
            info!(node_id = %node_id, "Deregistered node");
        }
        removed
    }

    pub fn get(&self, node_id: &str) -> Option<Node> {
        self.nodes.get(node_id).map(|n| n.value().clone())
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.iter().map(|n| n.value().clone()).collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    pub fn peers(&self) -> Vec<Node> {
        self.nodes()
            .into_iter()
            .filter(|n| n.node_id != self.local_id)
            .collect()
    }

    pub fn peer_count(&self) -> usize {
        self.nodes.len().saturating_sub(1)
    }

    pub fn healthy_peer_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.key() != &self.local_id && n.status == NodeStatus::Healthy)
            .count()
    }

    /// Record that a node was heard from directly.
    pub fn touch(&self, node_id: &str) {
        if let Some(mut node) = self.nodes.get_mut(node_id) {
            node.last_seen = Utc::now();
            node.status = NodeStatus::Healthy;
        }
    }

    pub fn set_status(&self, node_id: &str, status: NodeStatus) -> bool {
        match self.nodes.get_mut(node_id) {
            Some(mut node) if node_id != self.local_id => {
                node.status = status;
                true
            }
            _ => false,
        }
    }

    /// Build a message carrying this node's full view of the cluster.
    pub fn build_gossip_message(&self, term: u64) -> GossipMessage {
        if let Some(mut local) = self.nodes.get_mut(&self.local_id) {
            local.last_seen = Utc::now();
            local.status = NodeStatus::Healthy;
        }

        GossipMessage {
            sender_id: self.local_id.clone(),
            term,
            nodes: self.nodes(),
            sent_at: Utc::now(),
        }
    }

    /// Pick up to `fanout` peers uniformly at random.
    pub fn select_gossip_targets(&self, fanout: usize) -> Vec<Node> {
        let peers = self.peers();
        let count = fanout.min(peers.len());
        let mut rng = rand::rng();
        peers.choose_multiple(&mut rng, count).cloned().collect()
    }

    /// Merge a peer's view into the local registry.
    ///
    /// Unknown nodes are registered; known nodes take the incoming status
    /// (last writer wins). Returns the number of newly discovered nodes.
    pub fn handle_gossip(&self, message: &GossipMessage) -> usize {
        let mut discovered = 0;

        for incoming in &message.nodes {
            if incoming.node_id == self.local_id {
                continue;
            }

            match self.nodes.get_mut(&incoming.node_id) {
                Some(mut existing) => {
                    existing.status = incoming.status;
                    existing.hostname = incoming.hostname.clone();
                    existing.port = incoming.port;
                    if incoming.last_seen > existing.last_seen {
                        existing.last_seen = incoming.last_seen;
                    }
                }
                None => {
                    debug!(
                        node_id = %incoming.node_id,
                        via = %message.sender_id,
                        "Discovered node via gossip"
                    );
                    self.nodes
                        .insert(incoming.node_id.clone(), incoming.clone());
                    discovered += 1;
                }
            }
        }

        // The sender is evidently alive, whatever the others thought of it
        if message.sender_id != self.local_id {
            if !self.nodes.contains_key(&message.sender_id) {
                if let Some(sender) = message.nodes.iter().find(|n| n.node_id == message.sender_id) {
                    self.nodes.insert(sender.node_id.clone(), sender.clone());
                    discovered += 1;
                }
            }
            self.touch(&message.sender_id);
        }

        if discovered > 0 {
            info!(
                discovered,
                from = %message.sender_id,
                known = self.nodes.len(),
                "Membership grew via gossip"
            );
        }

        discovered
    }

    /// Downgrade peers that have not been seen for a while. Entries are
    /// never purged here.
    pub fn reconcile_stale(
        &self,
        now: DateTime<Utc>,
        suspect_after: Duration,
        dead_after: Duration,
    ) -> Vec<(NodeId, NodeStatus)> {
        let mut changed = Vec::new();

        for mut node in self.nodes.iter_mut() {
            if node.node_id == self.local_id {
                continue;
            }

            let silent = (now - node.last_seen).to_std().unwrap_or(Duration::ZERO);
            let next = if silent >= dead_after {
                NodeStatus::Dead
            } else if silent >= suspect_after {
                NodeStatus::Suspect
            } else {
                continue;
            };

            if node.status != next && node.status != NodeStatus::Dead {
                node.status = next;
                changed.push((node.node_id.clone(), next));
            }
        }

        for (node_id, status) in &changed {
            info!(node_id = %node_id, ?status, "Peer liveness changed");
        }

        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(id: &str) -> NodeRegistry {
        NodeRegistry::new(Node::new(id, "127.0.0.1", 7000))
    }

    #[test]
    fn test_register_is_idempotent() {
        let reg = registry("a");
        reg.register_node("b", "10.0.0.2", 7001);
        reg.register_node("b", "10.0.0.3", 7002);

        assert_eq!(reg.peer_count(), 1);
        let b = reg.get("b").unwrap();
        assert_eq!(b.hostname, "10.0.0.3");
        assert_eq!(b.port, 7002);
    }

    #[test]
    fn test_local_node_cannot_be_deregistered() {
        let reg = registry("a");
        reg.register_node("b", "h", 1);
        assert!(!reg.deregister_node("a"));
        assert!(reg.deregister_node("b"));
        assert!(!reg.deregister_node("b"));
        assert_eq!(reg.peer_count(), 0);
    }

    #[test]
    fn test_gossip_targets_bounded_by_fanout() {
        let reg = registry("a");
        assert!(reg.select_gossip_targets(3).is_empty());

        for i in 0..10 {
            reg.register_node(&format!("n{}", i), "h", 7000 + i);
        }
        let targets = reg.select_gossip_targets(3);
        assert_eq!(targets.len(), 3);
        assert!(targets.iter().all(|t| t.node_id != "a"));

        let mut ids: Vec<_> = targets.iter().map(|t| t.node_id.clone()).collect();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn test_handle_gossip_discovers_and_merges() {
        let a = registry("a");
        let b = registry("b");
        b.register_node("c", "h", 3);
        b.set_status("c", NodeStatus::Suspect);

        let discovered = a.handle_gossip(&b.build_gossip_message(0));
        assert_eq!(discovered, 2);
        assert!(a.contains("b"));
        assert_eq!(a.get("c").unwrap().status, NodeStatus::Suspect);
        assert_eq!(a.get("b").unwrap().status, NodeStatus::Healthy);

        // Last writer wins on status
        b.set_status("c", NodeStatus::Healthy);
        assert_eq!(a.handle_gossip(&b.build_gossip_message(0)), 0);
        assert_eq!(a.get("c").unwrap().status, NodeStatus::Healthy);
    }

    #[test]
    fn test_gossip_never_overwrites_local_entry() {
        let a = registry("a");
        let b = registry("b");
        b.register_node("a", "elsewhere", 1);
        b.set_status("a", NodeStatus::Dead);

        a.handle_gossip(&b.build_gossip_message(0));
        let local = a.get("a").unwrap();
        assert_eq!(local.status, NodeStatus::Healthy);
        assert_eq!(local.hostname, "127.0.0.1");
    }

    #[test]
    fn test_reconcile_stale_marks_without_purging() {
        let reg = registry("a");
        reg.register_node("b", "h", 1);
        reg.register_node("c", "h", 2);

        let later = Utc::now() + chrono::Duration::seconds(20);
        let changed = reg.reconcile_stale(later, Duration::from_secs(15), Duration::from_secs(30));
        assert_eq!(changed.len(), 2);
        assert_eq!(reg.get("b").unwrap().status, NodeStatus::Suspect);

        let much_later = Utc::now() + chrono::Duration::seconds(60);
        reg.reconcile_stale(much_later, Duration::from_secs(15), Duration::from_secs(30));
        assert_eq!(reg.get("c").unwrap().status, NodeStatus::Dead);
        assert_eq!(reg.peer_count(), 2);
        assert_eq!(reg.healthy_peer_count(), 0);
        assert_eq!(reg.get("a").unwrap().status, NodeStatus::Healthy);
    }
}
