//! Per-key quorum voting on proposed state mutations.
//!
//! This is not log replication: each proposal is decided on its own by
//! counting votes against the number of known participants.

use crate::cluster::PeerOracle;
use crate::config::ConsensusConfig;
use crate::error::HaError;
use crate::events::{HaEvent, ListenerRegistry};
use crate::task::TaskGroup;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProposalState {
    Pending,
    Approved,
    Rejected,
    Applied,
    /// Undecided when `proposal_timeout` ran out
    Timeout,
}

impl ProposalState {
    /// No further transition is possible
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProposalState::Pending | ProposalState::Approved)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusProposal {
    pub proposal_id: Uuid,
    pub key: String,
    pub value: serde_json::Value,
    pub proposer_node: String,
    pub votes_for: BTreeSet<String>,
    pub votes_against: BTreeSet<String>,
    pub consensus_threshold: f64,
    pub state: ProposalState,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl ConsensusProposal {
    /// `votes_for / participants >= threshold`
    pub fn check_consensus(&self, participants: usize) -> bool {
        ratio(self.votes_for.len(), participants) >= self.consensus_threshold
    }

    /// `votes_against / participants >= 1 - threshold`
    pub fn check_rejection(&self, participants: usize) -> bool {
        ratio(self.votes_against.len(), participants) >= 1.0 - self.consensus_threshold
    }
}

fn ratio(votes: usize, participants: usize) -> f64 {
    votes as f64 / participants.max(1) as f64
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsensusMetrics {
    pub proposals_created: u64,
    pub approved: u64,
    pub rejected: u64,
    pub timed_out: u64,
    pub consensual_updates: u64,
    pub pending: usize,
}

#[derive(Debug, Default)]
struct Counters {
    proposals_created: AtomicU64,
    approved: AtomicU64,
    rejected: AtomicU64,
    timed_out: AtomicU64,
    consensual_updates: AtomicU64,
}

#[derive(Clone)]
pub struct ConsensusManager {
    node_id: String,
    config: ConsensusConfig,
    peers: Arc<dyn PeerOracle>,
    proposals: Arc<DashMap<Uuid, ConsensusProposal>>,
    listeners: ListenerRegistry,
    counters: Arc<Counters>,
    tasks: Arc<Mutex<Option<TaskGroup>>>,
}

impl ConsensusManager {
    pub fn new(
        node_id: impl Into<String>,
        config: ConsensusConfig,
        peers: Arc<dyn PeerOracle>,
        listeners: ListenerRegistry,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            config,
            peers,
            proposals: Arc::new(DashMap::new()),
            listeners,
            counters: Arc::new(Counters::default()),
            tasks: Arc::new(Mutex::new(None)),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Local node plus known peers
    pub fn participants(&self) -> usize {
        self.peers.peer_count() + 1
    }

    /// Propose `value` for `key`. The proposer votes for it immediately, so
    /// with no peers the proposal is approved on creation.
    pub fn create_proposal(&self, key: &str, value: serde_json::Value) -> ConsensusProposal {
        let mut proposal = ConsensusProposal {
            proposal_id: Uuid::new_v4(),
            key: key.to_string(),
            value,
            proposer_node: self.node_id.clone(),
            votes_for: BTreeSet::from([self.node_id.clone()]),
            votes_against: BTreeSet::new(),
            consensus_threshold: self.config.threshold,
            state: ProposalState::Pending,
            created_at: Utc::now(),
            decided_at: None,
        };
        self.counters.proposals_created.fetch_add(1, Ordering::Relaxed);
        info!(proposal_id = %proposal.proposal_id, key = %key, "Proposal created");

        let decided = self.decide(&mut proposal);
        self.proposals.insert(proposal.proposal_id, proposal.clone());
        if decided {
            self.announce(&proposal);
        }
        proposal
    }

    /// Record `voter`'s vote. Re-voting moves the voter between the for and
    /// against sets. Returns false for unknown or already decided proposals.
    pub fn vote_on_proposal(&self, proposal_id: Uuid, approve: bool, voter: &str) -> bool {
        let (decided, snapshot) = {
            let Some(mut proposal) = self.proposals.get_mut(&proposal_id) else {
                debug!(proposal_id = %proposal_id, voter = %voter, "Vote for unknown proposal");
                return false;
            };
            if proposal.state != ProposalState::Pending {
                debug!(
                    proposal_id = %proposal_id,
                    state = ?proposal.state,
                    "Vote ignored: proposal already decided"
                );
                return false;
            }

            if approve {
                proposal.votes_against.remove(voter);
                proposal.votes_for.insert(voter.to_string());
            } else {
                proposal.votes_for.remove(voter);
                proposal.votes_against.insert(voter.to_string());
            }

            let decided = self.decide(&mut proposal);
            (decided, proposal.clone())
        };

        if decided {
            self.announce(&snapshot);
        }
        true
    }

    /// Move a pending proposal to APPROVED or REJECTED if the votes allow it.
    fn decide(&self, proposal: &mut ConsensusProposal) -> bool {
        let participants = self.participants();
        let state = if proposal.check_consensus(participants) {
            ProposalState::Approved
        } else if proposal.check_rejection(participants) {
            ProposalState::Rejected
        } else {
            return false;
        };

        proposal.state = state;
        proposal.decided_at = Some(Utc::now());
        true
    }

    fn announce(&self, proposal: &ConsensusProposal) {
        match proposal.state {
            ProposalState::Approved => {
                self.counters.approved.fetch_add(1, Ordering::Relaxed);
                info!(
                    proposal_id = %proposal.proposal_id,
                    key = %proposal.key,
                    votes_for = proposal.votes_for.len(),
                    "Consensus reached"
                );
                self.listeners.emit(HaEvent::ConsensusReached {
                    proposal: proposal.clone(),
                });
            }
            ProposalState::Rejected => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                info!(
                    proposal_id = %proposal.proposal_id,
                    key = %proposal.key,
                    votes_against = proposal.votes_against.len(),
                    "Proposal rejected"
                );
            }
            _ => {}
        }
    }

    /// Confirm that an approved proposal has been durably applied.
    pub fn mark_proposal_applied(&self, proposal_id: Uuid) -> bool {
        let applied = {
            let Some(mut proposal) = self.proposals.get_mut(&proposal_id) else {
                return false;
            };
            if proposal.state != ProposalState::Approved {
                warn!(
                    proposal_id = %proposal_id,
                    state = ?proposal.state,
                    "Only approved proposals can be applied"
                );
                return false;
            }
            proposal.state = ProposalState::Applied;
            proposal.clone()
        };

        self.counters.consensual_updates.fetch_add(1, Ordering::Relaxed);
        info!(proposal_id = %proposal_id, key = %applied.key, "Proposal applied");
        self.listeners.emit(HaEvent::ProposalApplied { proposal: applied });
        true
    }

    /// Time out undecided proposals and drop old decided ones.
    pub fn expire_stale(&self, now: DateTime<Utc>) -> usize {
        let timeout = to_chrono(self.config.proposal_timeout());
        let retention = to_chrono(self.config.retention());
        let mut timed_out = 0;

        for mut proposal in self.proposals.iter_mut() {
            if proposal.state == ProposalState::Pending && now - proposal.created_at >= timeout {
                proposal.state = ProposalState::Timeout;
                proposal.decided_at = Some(now);
                timed_out += 1;
                info!(
                    proposal_id = %proposal.proposal_id,
                    key = %proposal.key,
                    "Proposal timed out undecided"
                );
            }
        }

        // Approved proposals nobody confirmed go after retention too
        self.proposals.retain(|_, p| {
            let expired = p.decided_at.is_some_and(|decided| now - decided >= retention);
            if expired && p.state == ProposalState::Approved {
                warn!(
                    proposal_id = %p.proposal_id,
                    key = %p.key,
                    "Dropping approved proposal that was never applied"
                );
            }
            !(expired && p.state != ProposalState::Pending)
        });

        self.counters
            .timed_out
            .fetch_add(timed_out as u64, Ordering::Relaxed);
        timed_out
    }

    pub fn get_proposal(&self, proposal_id: Uuid) -> Option<ConsensusProposal> {
        self.proposals.get(&proposal_id).map(|p| p.clone())
    }

    pub fn pending_proposals(&self) -> Vec<ConsensusProposal> {
        let mut pending: Vec<ConsensusProposal> = self
            .proposals
            .iter()
            .filter(|p| p.state == ProposalState::Pending)
            .map(|p| p.clone())
            .collect();
        pending.sort_by_key(|p| p.created_at);
        pending
    }

    pub fn metrics(&self) -> ConsensusMetrics {
        ConsensusMetrics {
            proposals_created: self.counters.proposals_created.load(Ordering::Relaxed),
            approved: self.counters.approved.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            consensual_updates: self.counters.consensual_updates.load(Ordering::Relaxed),
            pending: self.pending_proposals().len(),
        }
    }

    pub async fn start(&self) -> Result<(), HaError> {
        let group = {
            let mut tasks = self.tasks.lock();
            if tasks.is_some() {
                return Ok(());
            }
            let group = TaskGroup::new("consensus");
            *tasks = Some(group.clone());
            group
        };

        let manager = self.clone();
        group.spawn_loop(
            "proposal-sweep",
            self.config.sweep_interval(),
            Duration::from_secs(1),
            move || {
                let manager = manager.clone();
                async move {
                    manager.expire_stale(Utc::now());
                    Ok(())
                }
            },
        );
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), HaError> {
        let group = self.tasks.lock().take();
        if let Some(group) = group {
            group.shutdown().await;
        }
        Ok(())
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
