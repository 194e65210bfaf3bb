//! Failover Orchestration Module
//!
//! - Cascade detection over recent component failures
//! - A prioritized, concurrency-capped recovery executor
//! - The manager that ties failures, cascades and recoveries together

pub mod cascade;
pub mod manager;
pub mod recovery;
pub mod types;

pub use cascade::{CascadeDetector, CascadeUpdate};
pub use manager::{ComponentStatus, FailoverManager};
pub use recovery::{DefaultRecoveryHandler, ExecutorStats, RecoveryExecutor, RecoveryHandler};
pub use types::{
    CascadeEvent, CascadeLevel, ComponentHealth, FailoverMetrics, HealthSource, RecoveryAction,
    RecoveryOperation, RecoveryState, RecoveryStrategy,
};
