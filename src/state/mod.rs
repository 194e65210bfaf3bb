//! Distributed state coordination: lease locks and quorum proposals.

pub mod consensus;
pub mod locks;

pub use consensus::{ConsensusManager, ConsensusMetrics, ConsensusProposal, ProposalState};
pub use locks::{Lock, LockManager, LockMetrics, LockState, LockType};
