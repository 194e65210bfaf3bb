use async_trait::async_trait;
use ha_core::cluster::StaticPeers;
use ha_core::config::FailoverConfig;
use ha_core::error::HaError;
use ha_core::events::{HaEvent, ListenerRegistry};
use ha_core::failover::{
    CascadeLevel, FailoverManager, RecoveryAction, RecoveryExecutor, RecoveryHandler,
    RecoveryOperation, RecoveryState, RecoveryStrategy,
};
use std::sync::Arc;
use std::time::Duration;

struct AlwaysFails;

#[async_trait]
impl RecoveryHandler for AlwaysFails {
    fn supports(&self, _strategy: RecoveryStrategy) -> bool {
        true
    }

    async fn execute(&self, _action: &RecoveryAction) -> Result<bool, HaError> {
        Ok(false)
    }

    async fn rollback(&self, _operation: &RecoveryOperation) -> Result<bool, HaError> {
        Ok(true)
    }
}

#[test_log::test(tokio::test)]
async fn test_cascade_threshold_creates_exactly_one() {
    let listeners = ListenerRegistry::new();
    let mut events = listeners.subscribe();
    let failover = FailoverManager::new(
        FailoverConfig::default(),
        Arc::new(AlwaysFails),
        Some(Arc::new(StaticPeers(2))),
        listeners,
    );

    failover.on_component_failure("db", "database", "connection refused");
    failover.on_component_failure("cache", "cache", "timeout");
    assert!(failover.active_cascades().is_empty());

    failover.on_component_failure("queue", "queue", "broker gone");
    let cascades = failover.active_cascades();
    assert_eq!(cascades.len(), 1);
    assert_eq!(cascades[0].cascade_level, CascadeLevel::Service);
    assert_eq!(cascades[0].initial_component, "db");

    let mut detected = 0;
    let mut failures = 0;
    while let Ok(event) = events.try_recv() {
        match event.event {
            HaEvent::CascadeDetected { .. } => detected += 1,
            HaEvent::FailureDetected { .. } => failures += 1,
            _ => {}
        }
    }
    assert_eq!(detected, 1);
    assert_eq!(failures, 3);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_retry_bound_marks_failed() {
    let listeners = ListenerRegistry::new();
    let mut events = listeners.subscribe();
    let executor = RecoveryExecutor::new(
        FailoverConfig::default(),
        Arc::new(AlwaysFails),
        listeners,
    );
    executor.start().await.unwrap();

    let id = executor.queue_action(RecoveryAction::new(
        "db",
        RecoveryStrategy::Reconnect,
        6,
        3,
        Duration::from_secs(2),
    ));

    let mut completed = None;
    while completed.is_none() {
        if let HaEvent::RecoveryCompleted {
            operation_id,
            success,
        } = events.recv().await.unwrap().event
        {
            assert_eq!(operation_id, id);
            completed = Some(success);
        }
    }
    assert_eq!(completed, Some(false));

    let op = executor.get_operation(id).unwrap();
    assert_eq!(op.attempts, 3);
    assert_eq!(op.state, RecoveryState::Failed);
    assert_eq!(op.last_error.as_deref(), Some("handler reported failure"));
    executor.stop().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_isolation_marks_component() {
    let failover = FailoverManager::new(
        FailoverConfig {
            failure_threshold: 2,
            ..FailoverConfig::default()
        },
        Arc::new(ha_core::failover::DefaultRecoveryHandler),
        Some(Arc::new(StaticPeers(1))),
        ListenerRegistry::new(),
    );
    failover.start().await.unwrap();
    let mut completed = failover.executor().subscribe_completed();

    failover.on_component_failure("db", "database", "crash");
    failover.on_component_failure("db", "database", "crash");

    let mut isolated = false;
    while !isolated {
        let op = completed.recv().await.unwrap();
        isolated = op.action.strategy == RecoveryStrategy::Isolate;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(failover.isolated_components(), vec!["db".to_string()]);
    let metrics = failover.metrics();
    assert_eq!(metrics.total_failures, 2);
    assert_eq!(metrics.isolated_components, vec!["db".to_string()]);
    failover.stop().await.unwrap();
}
