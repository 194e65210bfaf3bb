use crate::error::HaError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use uuid::Uuid;

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryStrategy {
    Restart,
    Reconnect,
    Failover,
    Migrate,
    ScaleUp,
    Isolate,
}

/// A request to recover one component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAction {
    pub component_id: String,
    pub strategy: RecoveryStrategy,
    /// 1 (lowest) to 10 (highest)
    pub priority: u8,
    /// Total attempt budget
    pub max_retries: u32,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub reason: String,
}

impl RecoveryAction {
    pub fn new(
        component_id: impl Into<String>,
        strategy: RecoveryStrategy,
        priority: u8,
        max_retries: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            component_id: component_id.into(),
            strategy,
            priority: priority.clamp(MIN_PRIORITY, MAX_PRIORITY),
            max_retries: max_retries.max(1),
            timeout,
            reason: String::new(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryState {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    RolledBack,
    Timeout,
}

impl RecoveryState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RecoveryState::Pending | RecoveryState::InProgress)
    }
}

/// Tracked execution of one queued action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryOperation {
    pub operation_id: Uuid,
    pub action: RecoveryAction,
    pub state: RecoveryState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RecoveryOperation {
    pub fn new(action: RecoveryAction) -> Self {
        Self {
            operation_id: Uuid::new_v4(),
            action,
            state: RecoveryState::Pending,
            attempts: 0,
            last_error: None,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.completed_at? - self.started_at?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CascadeLevel {
    Component,
    Service,
    Cluster,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeEvent {
    pub cascade_id: Uuid,
    pub initial_component: String,
    pub cascade_level: CascadeLevel,
    pub affected_components: BTreeSet<String>,
    pub detected_at: DateTime<Utc>,
    pub last_failure_at: DateTime<Utc>,
    pub is_active: bool,
}

/// One component's health as reported by a [`HealthSource`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub component_id: String,
    pub name: String,
    pub healthy: bool,
    pub error: Option<String>,
}

impl ComponentHealth {
    pub fn up(component_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            component_id: component_id.into(),
            name: name.into(),
            healthy: true,
            error: None,
        }
    }

    pub fn down(
        component_id: impl Into<String>,
        name: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            component_id: component_id.into(),
            name: name.into(),
            healthy: false,
            error: Some(error.into()),
        }
    }
}

/// Supplies component up/down signals.
#[async_trait]
pub trait HealthSource: Send + Sync {
    async fn poll(&self) -> Result<Vec<ComponentHealth>, HaError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailoverMetrics {
    pub total_failures: u64,
    pub total_recoveries: u64,
    pub successful_recoveries: u64,
    pub failed_recoveries: u64,
    pub timed_out_recoveries: u64,
    pub total_cascades: u64,
    pub active_cascades: usize,
    pub average_recovery_ms: f64,
    pub uptime_percentage: f64,
    pub tracked_components: usize,
    pub isolated_components: Vec<String>,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
