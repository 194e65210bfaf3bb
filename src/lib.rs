pub mod cli;
pub mod cluster;
pub mod config;
pub mod error;
pub mod events;
pub mod failover;
pub mod logging;
pub mod node;
pub mod state;
pub mod task;
pub mod transport;

// Re-export common types
pub use cluster::{ClusterCoordinator, PeerOracle, StaticPeers};
pub use config::HaConfig;
pub use error::HaError;
pub use events::{HaEvent, HaListener, ListenerRegistry};
pub use failover::FailoverManager;
pub use node::{HaNode, HaSnapshot};
pub use state::{ConsensusManager, LockManager};
pub use transport::{InMemoryNetwork, NoopTransport, Transport};
