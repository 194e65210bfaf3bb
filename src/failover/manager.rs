//! Failover manager
//!
//! The failure-facing API. Turns component failures into recovery actions,
//! escalates correlated failures into cascades and tracks per-component
//! downtime for the uptime figure.

use super::cascade::{CascadeDetector, CascadeUpdate};
use super::recovery::{RecoveryExecutor, RecoveryHandler};
use super::types::{
    CascadeEvent, ComponentHealth, FailoverMetrics, HealthSource, RecoveryAction,
    RecoveryOperation, RecoveryState, RecoveryStrategy, MAX_PRIORITY,
};
use crate::cluster::PeerOracle;
use crate::config::FailoverConfig;
use crate::error::HaError;
use crate::events::{HaEvent, ListenerRegistry};
use crate::task::TaskGroup;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Priority of an ISOLATE chosen because a component hit the failure threshold
const THRESHOLD_ISOLATE_PRIORITY: u8 = 8;
const RESTART_BASE_PRIORITY: u8 = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentStatus {
    pub component_id: String,
    pub name: String,
    pub healthy: bool,
    pub isolated: bool,
    pub failures: u64,
    pub last_error: Option<String>,
    pub down_since: Option<DateTime<Utc>>,
    /// Closed downtime windows, in milliseconds
    pub downtime_ms: i64,
}

impl ComponentStatus {
    fn new(component_id: &str, name: &str) -> Self {
        Self {
            component_id: component_id.to_string(),
            name: name.to_string(),
            healthy: true,
            isolated: false,
            failures: 0,
            last_error: None,
            down_since: None,
            downtime_ms: 0,
        }
    }

    fn downtime_at(&self, now: DateTime<Utc>) -> i64 {
        let open = self
            .down_since
            .map(|since| (now - since).num_milliseconds().max(0))
            .unwrap_or(0);
        self.downtime_ms + open
    }

    fn close_downtime(&mut self, now: DateTime<Utc>) {
        if let Some(since) = self.down_since.take() {
            self.downtime_ms += (now - since).num_milliseconds().max(0);
        }
        self.healthy = true;
    }
}

#[derive(Clone)]
pub struct FailoverManager {
    config: FailoverConfig,
    detector: CascadeDetector,
    executor: RecoveryExecutor,
    cluster: Option<Arc<dyn PeerOracle>>,
    health_source: Arc<RwLock<Option<Arc<dyn HealthSource>>>>,
    components: Arc<DashMap<String, ComponentStatus>>,
    listeners: ListenerRegistry,
    total_failures: Arc<AtomicU64>,
    started_at: DateTime<Utc>,
    tasks: Arc<Mutex<Option<TaskGroup>>>,
}

impl FailoverManager {
    pub fn new(
        config: FailoverConfig,
        handler: Arc<dyn RecoveryHandler>,
        cluster: Option<Arc<dyn PeerOracle>>,
        listeners: ListenerRegistry,
    ) -> Self {
        Self {
            detector: CascadeDetector::new(config.clone()),
            executor: RecoveryExecutor::new(config.clone(), handler, listeners.clone()),
            config,
            cluster,
            health_source: Arc::new(RwLock::new(None)),
            components: Arc::new(DashMap::new()),
            listeners,
            total_failures: Arc::new(AtomicU64::new(0)),
            started_at: Utc::now(),
            tasks: Arc::new(Mutex::new(None)),
        }
    }

    /// Attach the health source polled by the background health loop.
    pub fn set_health_source(&self, source: Arc<dyn HealthSource>) {
        *self.health_source.write() = Some(source);
    }

    pub fn detector(&self) -> &CascadeDetector {
        &self.detector
    }

    pub fn executor(&self) -> &RecoveryExecutor {
        &self.executor
    }

    /// Track a component that is currently up.
    pub fn register_component(&self, component_id: &str, name: &str) {
        self.components
            .entry(component_id.to_string())
            .or_insert_with(|| ComponentStatus::new(component_id, name));
    }

    /// Handle a failure report and queue the recovery it calls for. Returns
    /// the id of the recovery operation for this component.
    pub fn on_component_failure(&self, component_id: &str, name: &str, error: &str) -> Uuid {
        self.on_component_failure_at(component_id, name, error, Utc::now())
    }

    fn on_component_failure_at(
        &self,
        component_id: &str,
        name: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Uuid {
        {
            let mut status = self
                .components
                .entry(component_id.to_string())
                .or_insert_with(|| ComponentStatus::new(component_id, name));
            status.healthy = false;
            status.failures += 1;
            status.last_error = Some(error.to_string());
            if status.down_since.is_none() {
                status.down_since = Some(now);
            }
        }
        self.total_failures.fetch_add(1, Ordering::Relaxed);

        warn!(component_id = %component_id, name = %name, error = %error, "Component failure");
        self.listeners.emit(HaEvent::FailureDetected {
            component_id: component_id.to_string(),
            error: error.to_string(),
        });

        self.detector.record_failure(component_id, now);
        let failure_count =
            self.detector
                .failure_count(component_id, self.config.failure_window(), now);

        let action = self.choose_action(component_id, failure_count);
        let operation_id = self.executor.queue_action(action);

        match self.detector.detect_cascading_failure(component_id, now) {
            Some(CascadeUpdate::Detected(cascade)) => {
                self.listeners.emit(HaEvent::CascadeDetected {
                    cascade: cascade.clone(),
                });
                for action in self.detector.recovery_actions_for(&cascade) {
                    self.executor.queue_action(action);
                }
            }
            Some(CascadeUpdate::Extended {
                cascade,
                component_id,
            }) => {
                self.executor
                    .queue_action(self.detector.isolate_action(&component_id, &cascade));
            }
            None => {}
        }

        operation_id
    }

    /// RESTART below the failure threshold, ISOLATE at or above it as long
    /// as the cluster still has a healthy peer to take over.
    fn choose_action(&self, component_id: &str, failure_count: usize) -> RecoveryAction {
        let restart = |reason: String| {
            let priority = (RESTART_BASE_PRIORITY as usize + failure_count).min(MAX_PRIORITY as usize);
            RecoveryAction::new(
                component_id,
                RecoveryStrategy::Restart,
                priority as u8,
                self.config.default_max_retries,
                self.config.default_timeout(),
            )
            .with_reason(reason)
        };

        if failure_count < self.config.failure_threshold {
            return restart(format!("{} failures in window", failure_count));
        }

        if !self.can_isolate() {
            warn!(
                component_id = %component_id,
                failure_count,
                "Failure threshold reached but no healthy peer remains; restarting instead of isolating"
            );
            return restart(format!(
                "{} failures in window, isolation unsafe",
                failure_count
            ));
        }

        RecoveryAction::new(
            component_id,
            RecoveryStrategy::Isolate,
            THRESHOLD_ISOLATE_PRIORITY,
            self.config.default_max_retries,
            self.config.default_timeout(),
        )
        .with_reason(format!("failure threshold reached ({})", failure_count))
    }

    fn can_isolate(&self) -> bool {
        self.cluster
            .as_ref()
            .map_or(true, |cluster| cluster.healthy_peer_count() > 0)
    }

    /// Mark a component healthy again. Returns false if it was not down.
    pub fn on_component_recovered(&self, component_id: &str) -> bool {
        let Some(mut status) = self.components.get_mut(component_id) else {
            return false;
        };
        if status.healthy {
            return false;
        }
        status.close_downtime(Utc::now());
        info!(component_id = %component_id, "Component recovered");
        true
    }

    /// Apply a finished recovery to the component it targeted.
    pub fn handle_completed(&self, operation: &RecoveryOperation) {
        if operation.state != RecoveryState::Succeeded {
            return;
        }
        let Some(mut status) = self.components.get_mut(&operation.action.component_id) else {
            return;
        };
        let now = operation.completed_at.unwrap_or_else(Utc::now);
        status.close_downtime(now);
        if operation.action.strategy == RecoveryStrategy::Isolate {
            status.isolated = true;
            info!(component_id = %status.component_id, "Component isolated");
        }
    }

    /// Feed one health report through the failure and recovery paths.
    /// Only transitions count; a component that stays down is not re-reported.
    pub fn apply_health(&self, report: &[ComponentHealth]) {
        for health in report {
            let was_healthy = self
                .components
                .get(&health.component_id)
                .map(|s| s.healthy);

            match (health.healthy, was_healthy) {
                (true, None) => self.register_component(&health.component_id, &health.name),
                (true, Some(false)) => {
                    self.on_component_recovered(&health.component_id);
                }
                (false, None) | (false, Some(true)) => {
                    self.on_component_failure(
                        &health.component_id,
                        &health.name,
                        health.error.as_deref().unwrap_or("health check failed"),
                    );
                }
                _ => {}
            }
        }
    }

    pub async fn poll_health(&self) -> Result<(), HaError> {
        let source = self.health_source.read().clone();
        let Some(source) = source else {
            return Ok(());
        };
        let report = source.poll().await?;
        debug!(components = report.len(), "Health report received");
        self.apply_health(&report);
        Ok(())
    }

    pub fn component(&self, component_id: &str) -> Option<ComponentStatus> {
        self.components.get(component_id).map(|s| s.clone())
    }

    pub fn components(&self) -> Vec<ComponentStatus> {
        let mut components: Vec<ComponentStatus> =
            self.components.iter().map(|s| s.clone()).collect();
        components.sort_by(|a, b| a.component_id.cmp(&b.component_id));
        components
    }

    pub fn isolated_components(&self) -> Vec<String> {
        let mut isolated: Vec<String> = self
            .components
            .iter()
            .filter(|s| s.isolated)
            .map(|s| s.component_id.clone())
            .collect();
        isolated.sort();
        isolated
    }

    pub fn active_cascades(&self) -> Vec<CascadeEvent> {
        self.detector.active_cascades()
    }

    pub fn failure_count(&self, component_id: &str) -> usize {
        self.detector
            .failure_count(component_id, self.config.failure_window(), Utc::now())
    }

    pub fn uptime_percentage(&self) -> f64 {
        self.uptime_percentage_at(Utc::now())
    }

    fn uptime_percentage_at(&self, now: DateTime<Utc>) -> f64 {
        let tracked = self.components.len();
        let elapsed_ms = (now - self.started_at).num_milliseconds();
        if tracked == 0 || elapsed_ms <= 0 {
            return 100.0;
        }
        let downtime: i64 = self.components.iter().map(|s| s.downtime_at(now)).sum();
        let ratio = downtime as f64 / (tracked as f64 * elapsed_ms as f64);
        (100.0 * (1.0 - ratio)).clamp(0.0, 100.0)
    }

    pub fn metrics(&self) -> FailoverMetrics {
        let stats = self.executor.stats();
        FailoverMetrics {
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_recoveries: stats.queued,
            successful_recoveries: stats.succeeded,
            failed_recoveries: stats.failed,
            timed_out_recoveries: stats.timed_out,
            total_cascades: self.detector.total_cascades(),
            active_cascades: self.detector.active_cascades().len(),
            average_recovery_ms: stats.average_recovery_ms,
            uptime_percentage: self.uptime_percentage(),
            tracked_components: self.components.len(),
            isolated_components: self.isolated_components(),
        }
    }

    pub async fn start(&self) -> Result<(), HaError> {
        let group = {
            let mut tasks = self.tasks.lock();
            if tasks.is_some() {
                return Ok(());
            }
            let group = TaskGroup::new("failover");
            *tasks = Some(group.clone());
            group
        };

        info!(
            max_concurrent = self.config.max_concurrent_recoveries,
            "Starting failover manager"
        );
        self.executor.start().await?;
        let backoff = self.config.retry_backoff();

        let manager = self.clone();
        let mut completed = self.executor.subscribe_completed();
        group.spawn(async move {
            loop {
                match completed.recv().await {
                    Ok(operation) => manager.handle_completed(&operation),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Recovery completion stream lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let manager = self.clone();
        group.spawn_loop(
            "health-poll",
            self.config.health_check_interval(),
            backoff,
            move || {
                let manager = manager.clone();
                async move { manager.poll_health().await }
            },
        );

        let manager = self.clone();
        group.spawn_loop(
            "cascade-monitor",
            self.config.monitor_interval(),
            backoff,
            move || {
                let manager = manager.clone();
                async move {
                    manager.detector.deactivate_quiescent(Utc::now());
                    Ok(())
                }
            },
        );

        let manager = self.clone();
        group.spawn_loop(
            "recovery-monitor",
            self.config.monitor_interval(),
            backoff,
            move || {
                let manager = manager.clone();
                async move {
                    let pruned = manager.executor.prune_completed(Utc::now());
                    if pruned > 0 {
                        debug!(pruned, "Pruned completed recovery operations");
                    }
                    Ok(())
                }
            },
        );

        Ok(())
    }

    pub async fn stop(&self) -> Result<(), HaError> {
        let group = self.tasks.lock().take();
        if let Some(group) = group {
            info!("Stopping failover manager");
            group.shutdown().await;
        }
        self.executor.stop().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::StaticPeers;
    use crate::failover::recovery::DefaultRecoveryHandler;
    use async_trait::async_trait;
    use std::time::Duration;

    fn manager(cluster: Option<Arc<dyn PeerOracle>>) -> FailoverManager {
        FailoverManager::new(
            FailoverConfig::default(),
            Arc::new(DefaultRecoveryHandler),
            cluster,
            ListenerRegistry::new(),
        )
    }

    #[test]
    fn test_restart_priority_grows_with_failures() {
        let failover = manager(None);
        let now = Utc::now();

        let first = failover.on_component_failure_at("db", "database", "refused", now);
        let op = failover.executor().get_operation(first).unwrap();
        assert_eq!(op.action.strategy, RecoveryStrategy::Restart);
        assert_eq!(op.action.priority, 5);

        let metrics = failover.metrics();
        assert_eq!(metrics.total_failures, 1);
        assert_eq!(metrics.tracked_components, 1);
        assert!(!failover.component("db").unwrap().healthy);
    }

    #[test]
    fn test_isolate_at_threshold() {
        let failover = manager(Some(Arc::new(StaticPeers(2))));
        let now = Utc::now();

        let mut last = Uuid::nil();
        for _ in 0..5 {
            last = failover.on_component_failure_at("db", "database", "refused", now);
        }
        let op = failover.executor().get_operation(last).unwrap();
        assert_eq!(op.action.strategy, RecoveryStrategy::Isolate);
        assert_eq!(op.action.priority, THRESHOLD_ISOLATE_PRIORITY);
    }

    #[test]
    fn test_no_healthy_peer_falls_back_to_restart() {
        let failover = manager(Some(Arc::new(StaticPeers(0))));
        let now = Utc::now();

        let mut last = Uuid::nil();
        for _ in 0..5 {
            last = failover.on_component_failure_at("db", "database", "refused", now);
        }
        let op = failover.executor().get_operation(last).unwrap();
        assert_eq!(op.action.strategy, RecoveryStrategy::Restart);
    }

    #[test]
    fn test_cascade_queues_isolation_for_all_affected() {
        let failover = manager(None);
        let now = Utc::now();
        for id in ["a", "b", "c"] {
            failover.on_component_failure_at(id, id, "down", now);
        }

        assert_eq!(failover.active_cascades().len(), 1);
        let isolations: Vec<_> = failover
            .executor()
            .operations()
            .into_iter()
            .filter(|op| op.action.strategy == RecoveryStrategy::Isolate)
            .collect();
        assert_eq!(isolations.len(), 3);
        assert!(isolations.iter().all(|op| op.action.priority == MAX_PRIORITY));

        // A fourth failure extends the same cascade
        failover.on_component_failure_at("d", "d", "down", now);
        assert_eq!(failover.metrics().total_cascades, 1);
        assert_eq!(
            failover.active_cascades()[0].affected_components.len(),
            4
        );
    }

    #[test]
    fn test_uptime_accounts_for_downtime() {
        let failover = manager(None);
        let start = failover.started_at;
        failover.register_component("api", "api");
        failover.on_component_failure_at("db", "database", "down", start);

        // db down for the whole elapsed time, api up: 50%
        let later = start + chrono::Duration::seconds(10);
        let uptime = failover.uptime_percentage_at(later);
        assert!((uptime - 50.0).abs() < 0.01, "uptime was {}", uptime);

        assert!(failover.on_component_recovered("db"));
        assert!(!failover.on_component_recovered("db"));
        assert!(failover.component("db").unwrap().healthy);
    }

    #[tokio::test]
    async fn test_successful_recovery_closes_downtime() {
        let failover = manager(None);
        failover.start().await.unwrap();
        let mut completed = failover.executor().subscribe_completed();

        let id = failover.on_component_failure("db", "database", "down");
        let op = completed.recv().await.unwrap();
        assert_eq!(op.operation_id, id);
        assert_eq!(op.state, RecoveryState::Succeeded);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = failover.component("db").unwrap();
        assert!(status.healthy);
        assert!(status.down_since.is_none());
        assert_eq!(failover.metrics().successful_recoveries, 1);

        failover.stop().await.unwrap();
    }

    struct FlappingSource {
        polls: AtomicU64,
    }

    #[async_trait]
    impl HealthSource for FlappingSource {
        async fn poll(&self) -> Result<Vec<ComponentHealth>, HaError> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![if n == 1 {
                ComponentHealth::down("db", "database", "health check failed")
            } else {
                ComponentHealth::up("db", "database")
            }])
        }
    }

    #[tokio::test]
    async fn test_health_poll_reports_transitions_only() {
        let failover = manager(None);
        failover.set_health_source(Arc::new(FlappingSource {
            polls: AtomicU64::new(0),
        }));

        failover.poll_health().await.unwrap();
        assert!(failover.component("db").unwrap().healthy);
        assert_eq!(failover.metrics().total_failures, 0);

        failover.poll_health().await.unwrap();
        assert!(!failover.component("db").unwrap().healthy);
        assert_eq!(failover.metrics().total_failures, 1);

        failover.poll_health().await.unwrap();
        assert!(failover.component("db").unwrap().healthy);
        assert_eq!(failover.metrics().total_failures, 1);
    }
}
