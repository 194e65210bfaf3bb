use ha_core::cluster::StaticPeers;
use ha_core::config::{ConsensusConfig, HaConfig, LockConfig};
use ha_core::events::{HaEvent, ListenerRegistry};
use ha_core::state::{ConsensusManager, LockManager, LockState, LockType, ProposalState};
use ha_core::{HaNode, NoopTransport};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[test_log::test(tokio::test)]
async fn test_contender_is_recorded() {
    let listeners = ListenerRegistry::new();
    let mut events = listeners.subscribe();
    let locks = LockManager::new(LockConfig::default(), listeners);

    assert!(locks.acquire_lock("k", LockType::Exclusive, "A"));
    assert!(!locks.acquire_lock("k", LockType::Exclusive, "B"));

    let lock = locks.get_lock("k").unwrap();
    assert_eq!(lock.owner_node, "A");
    assert_eq!(lock.state, LockState::Acquired);
    assert!(lock.contenders.contains("B"));

    // Renewal leaves the holder acquired and the contention on record
    assert!(locks.renew_lock("k", "A"));
    let lock = locks.get_lock("k").unwrap();
    assert_eq!(lock.state, LockState::Acquired);
    assert_eq!(locks.active_locks().len(), 1);

    // Only the successful acquire is announced
    let event = events.recv().await.unwrap();
    assert!(matches!(event.event, HaEvent::LockAcquired { ref lock } if lock.owner_node == "A"));
    assert!(events.try_recv().is_err());

    assert!(locks.release_lock("k", "A"));
    let event = events.recv().await.unwrap();
    assert!(matches!(event.event, HaEvent::LockReleased { .. }));
}

#[test_log::test(tokio::test)]
async fn test_lease_reclaimed_within_one_sweep() {
    let locks = LockManager::new(
        LockConfig {
            lock_timeout_ms: 100,
            sweep_interval_ms: 50,
        },
        ListenerRegistry::new(),
    );
    locks.start().await.unwrap();

    assert!(locks.acquire_lock("k", LockType::Exclusive, "A"));
    // Lease plus one sweep interval, with slack
    tokio::time::sleep(Duration::from_millis(250)).await;

    assert!(!locks.is_locked("k"));
    assert_eq!(locks.metrics().timed_out, 1);
    assert!(locks.acquire_lock("k", LockType::Exclusive, "B"));
    locks.stop().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_single_node_proposal_approved_on_creation() {
    let node = HaNode::new(HaConfig::default(), Arc::new(NoopTransport)).unwrap();
    let proposal = node
        .consensus()
        .create_proposal("replicas", json!({"count": 3}));

    assert_eq!(proposal.state, ProposalState::Approved);
    assert!(node.consensus().mark_proposal_applied(proposal.proposal_id));
    assert_eq!(node.consensus().metrics().consensual_updates, 1);
    assert!(node.snapshot().pending_proposals.is_empty());
}

#[test_log::test(tokio::test)]
async fn test_five_node_quorum() {
    let consensus = ConsensusManager::new(
        "n1",
        ConsensusConfig {
            threshold: 0.6,
            ..ConsensusConfig::default()
        },
        Arc::new(StaticPeers(4)),
        ListenerRegistry::new(),
    );

    let proposal = consensus.create_proposal("leader-lease", json!("n1"));
    let id = proposal.proposal_id;
    consensus.vote_on_proposal(id, true, "n2");
    consensus.vote_on_proposal(id, false, "n3");
    assert_eq!(consensus.get_proposal(id).unwrap().state, ProposalState::Pending);

    // n3 changes its mind: 3 of 5 for reaches 0.6
    consensus.vote_on_proposal(id, true, "n3");
    let proposal = consensus.get_proposal(id).unwrap();
    assert_eq!(proposal.state, ProposalState::Approved);
    assert!(proposal.votes_against.is_empty());
}
