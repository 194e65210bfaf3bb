//! Raft-style leader election.
//!
//! Majority is judged against the locally known peer count. Vote solicitation
//! is handed to the transport; if it routes responses back, they are tallied
//! by `handle_vote_response`.

use super::registry::NodeRegistry;
use super::types::{ElectionState, HeartbeatMessage, NodeId, NodeRole, VoteRequest, VoteResponse};
use crate::config::{ClusterConfig, MAX_DURATION_MS};
use crate::error::HaError;
use crate::events::{HaEvent, ListenerRegistry};
use crate::transport::Transport;
use chrono::Utc;
use parking_lot::RwLock;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct ElectionManager {
    node_id: NodeId,
    timeout_range: (Duration, Duration),
    registry: NodeRegistry,
    state: Arc<RwLock<ElectionState>>,
    transport: Arc<dyn Transport>,
    listeners: ListenerRegistry,
    elections_started: Arc<AtomicU64>,
}

impl ElectionManager {
    pub fn new(
        registry: NodeRegistry,
        config: &ClusterConfig,
        transport: Arc<dyn Transport>,
        listeners: ListenerRegistry,
    ) -> Self {
        let timeout_range = config.election_timeout_range();
        let deadline = deadline_after(random_timeout(timeout_range));

        Self {
            node_id: registry.local_id().to_string(),
            timeout_range,
            registry,
            state: Arc::new(RwLock::new(ElectionState::new(deadline))),
            transport,
            listeners,
            elections_started: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn state(&self) -> ElectionState {
        self.state.read().clone()
    }

    pub fn current_term(&self) -> u64 {
        self.state.read().current_term
    }

    pub fn role(&self) -> NodeRole {
        self.state.read().role
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.state.read().leader_id.clone()
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.state.read().voted_for.clone()
    }

    pub fn is_leader(&self) -> bool {
        self.state.read().role == NodeRole::Leader
    }

    pub fn elections_started(&self) -> u64 {
        self.elections_started.load(Ordering::Relaxed)
    }

    /// Votes needed out of `peers + 1`.
    pub fn majority(&self) -> usize {
        (self.registry.peer_count() + 1) / 2 + 1
    }

    fn reset_deadline(&self, state: &mut ElectionState) {
        state.election_deadline = deadline_after(random_timeout(self.timeout_range));
    }

    fn step_down(&self, state: &mut ElectionState, term: u64) {
        if state.role != NodeRole::Follower {
            info!(node_id = %self.node_id, term, "Stepping down to follower");
        }
        state.current_term = term;
        state.voted_for = None;
        state.leader_id = None;
        state.role = NodeRole::Follower;
        state.votes_received.clear();
    }

    fn become_leader(&self, state: &mut ElectionState) -> u64 {
        state.role = NodeRole::Leader;
        state.leader_id = Some(self.node_id.clone());
        info!(
            node_id = %self.node_id,
            term = state.current_term,
            votes = state.votes_received.len(),
            "Became leader"
        );
        state.current_term
    }

    fn announce_leader(&self, term: u64) {
        self.listeners.emit(HaEvent::LeaderElected {
            node_id: self.node_id.clone(),
            term,
        });
    }

    /// Become a candidate for the next term. Returns whether this node is
    /// leader once the call completes.
    pub async fn start_election(&self) -> bool {
        let (request, won) = {
            let mut state = self.state.write();
            if state.role == NodeRole::Leader {
                return true;
            }

            state.current_term += 1;
            state.role = NodeRole::Candidate;
            state.voted_for = Some(self.node_id.clone());
            state.leader_id = None;
            state.votes_received = vec![self.node_id.clone()];
            self.reset_deadline(&mut state);
            self.elections_started.fetch_add(1, Ordering::Relaxed);

            info!(
                node_id = %self.node_id,
                term = state.current_term,
                peers = self.registry.peer_count(),
                "Starting election"
            );

            let won = if state.votes_received.len() >= self.majority() {
                Some(self.become_leader(&mut state))
            } else {
                None
            };

            (
                VoteRequest {
                    candidate_id: self.node_id.clone(),
                    term: state.current_term,
                },
                won,
            )
        };

        if let Some(term) = won {
            self.announce_leader(term);
            return true;
        }

        if let Err(e) = self.transport.send_vote_request(request).await {
            warn!(node_id = %self.node_id, error = %e, "Failed to solicit votes");
        }

        self.is_leader()
    }

    /// Grant iff the requester's term is not behind ours and we have not
    /// voted for someone else in that term.
    pub fn handle_vote_request(&self, request: &VoteRequest) -> VoteResponse {
        let mut state = self.state.write();

        if request.term < state.current_term {
            debug!(
                candidate = %request.candidate_id,
                term = request.term,
                current_term = state.current_term,
                "Rejecting vote request for stale term"
            );
            return VoteResponse {
                voter_id: self.node_id.clone(),
                term: state.current_term,
                granted: false,
            };
        }

        if request.term > state.current_term {
            self.step_down(&mut state, request.term);
        }

        let granted = match &state.voted_for {
            None => true,
            Some(existing) => existing == &request.candidate_id,
        };

        if granted {
            state.voted_for = Some(request.candidate_id.clone());
            self.reset_deadline(&mut state);
            debug!(candidate = %request.candidate_id, term = request.term, "Granted vote");
        } else {
            debug!(
                candidate = %request.candidate_id,
                term = request.term,
                voted_for = ?state.voted_for,
                "Already voted this term"
            );
        }

        VoteResponse {
            voter_id: self.node_id.clone(),
            term: state.current_term,
            granted,
        }
    }

    /// Tally a vote for the current candidacy. Returns true if this response
    /// made the node leader.
    pub fn handle_vote_response(&self, response: &VoteResponse) -> bool {
        let won = {
            let mut state = self.state.write();

            if response.term > state.current_term {
                self.step_down(&mut state, response.term);
                return false;
            }

            if state.role != NodeRole::Candidate
                || response.term != state.current_term
                || !response.granted
            {
                return false;
            }

            if !state.votes_received.contains(&response.voter_id) {
                state.votes_received.push(response.voter_id.clone());
            }

            if state.votes_received.len() >= self.majority() {
                Some(self.become_leader(&mut state))
            } else {
                None
            }
        };

        match won {
            Some(term) => {
                self.announce_leader(term);
                true
            }
            None => false,
        }
    }

    /// Accept a heartbeat whose term is not behind ours.
    pub fn handle_heartbeat(&self, heartbeat: &HeartbeatMessage) -> bool {
        if heartbeat.leader_id == self.node_id {
            return false;
        }

        let mut state = self.state.write();
        if heartbeat.term < state.current_term {
            debug!(
                leader = %heartbeat.leader_id,
                term = heartbeat.term,
                current_term = state.current_term,
                "Rejecting heartbeat from stale term"
            );
            return false;
        }

        if heartbeat.term > state.current_term {
            state.current_term = heartbeat.term;
            state.voted_for = None;
        }

        if state.leader_id.as_deref() != Some(heartbeat.leader_id.as_str()) {
            info!(
                leader = %heartbeat.leader_id,
                term = heartbeat.term,
                "Following new leader"
            );
        }

        state.role = NodeRole::Follower;
        state.leader_id = Some(heartbeat.leader_id.clone());
        state.votes_received.clear();
        self.reset_deadline(&mut state);
        true
    }

    pub fn election_due(&self) -> bool {
        let state = self.state.read();
        state.role != NodeRole::Leader && Instant::now() >= state.election_deadline
    }

    /// Start an election if the deadline has passed without a heartbeat.
    pub async fn check_election_timeout(&self) -> bool {
        if self.election_due() {
            info!(node_id = %self.node_id, "Election timeout elapsed");
            self.start_election().await
        } else {
            false
        }
    }

    pub async fn send_heartbeat(&self) -> Result<(), HaError> {
        let term = {
            let state = self.state.read();
            if state.role != NodeRole::Leader {
                return Ok(());
            }
            state.current_term
        };

        self.transport
            .send_heartbeat(HeartbeatMessage {
                leader_id: self.node_id.clone(),
                term,
                sent_at: Utc::now(),
            })
            .await
    }
}

/// `Instant::now() + timeout`, capped at the longest configurable interval
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_millis(MAX_DURATION_MS))
}

fn random_timeout((min, max): (Duration, Duration)) -> Duration {
    if max <= min {
        return min;
    }
    rand::rng().random_range(min..=max)
}
