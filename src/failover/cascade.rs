//! Correlates near-simultaneous component failures into cascade events.

use super::types::{CascadeEvent, CascadeLevel, RecoveryAction, RecoveryStrategy, MAX_PRIORITY};
use crate::config::FailoverConfig;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Affected components at which a cascade counts as cluster-wide
const CLUSTER_CASCADE_SIZE: usize = 5;

/// Result of feeding one failure to the detector.
#[derive(Debug, Clone, PartialEq)]
pub enum CascadeUpdate {
    /// A new cascade was opened
    Detected(CascadeEvent),
    /// The active cascade absorbed a component it did not cover yet
    Extended {
        cascade: CascadeEvent,
        component_id: String,
    },
}

#[derive(Debug, Default)]
struct DetectorState {
    /// (time, component) in arrival order
    failures: VecDeque<(DateTime<Utc>, String)>,
    cascades: Vec<CascadeEvent>,
    total_cascades: u64,
}

#[derive(Debug, Clone)]
pub struct CascadeDetector {
    config: FailoverConfig,
    state: Arc<Mutex<DetectorState>>,
}

impl CascadeDetector {
    pub fn new(config: FailoverConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(DetectorState::default())),
        }
    }

    pub fn record_failure(&self, component_id: &str, at: DateTime<Utc>) {
        let horizon = window_start(at, self.config.failure_window().max(self.config.cascade_window()));
        let mut state = self.state.lock();
        state.failures.push_back((at, component_id.to_string()));
        while state.failures.front().is_some_and(|(t, _)| *t < horizon) {
            state.failures.pop_front();
        }
    }

    /// Failures of `component_id` within `window` before `now`.
    pub fn failure_count(&self, component_id: &str, window: Duration, now: DateTime<Utc>) -> usize {
        let since = window_start(now, window);
        self.state
            .lock()
            .failures
            .iter()
            .filter(|(t, id)| *t >= since && id == component_id)
            .count()
    }

    pub fn classify(&self, affected: usize) -> CascadeLevel {
        if affected >= self.config.critical_cascade_size {
            CascadeLevel::Critical
        } else if affected >= CLUSTER_CASCADE_SIZE {
            CascadeLevel::Cluster
        } else if affected >= self.config.cascade_threshold_depth {
            CascadeLevel::Service
        } else {
            CascadeLevel::Component
        }
    }

    /// Decide whether the failure of `component_id` at `now`, together with
    /// other recent failures, forms or extends a cascade. The failure must
    /// already have been recorded.
    pub fn detect_cascading_failure(
        &self,
        component_id: &str,
        now: DateTime<Utc>,
    ) -> Option<CascadeUpdate> {
        let since = window_start(now, self.config.cascade_window());
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if let Some(active) = state.cascades.iter_mut().find(|c| c.is_active) {
            active.last_failure_at = now;
            if !active.affected_components.insert(component_id.to_string()) {
                return None;
            }
            let level = self.classify(active.affected_components.len());
            if level > active.cascade_level {
                warn!(
                    cascade_id = %active.cascade_id,
                    from = ?active.cascade_level,
                    to = ?level,
                    "Cascade escalated"
                );
                active.cascade_level = level;
            }
            debug!(
                cascade_id = %active.cascade_id,
                component_id = %component_id,
                affected = active.affected_components.len(),
                "Cascade extended"
            );
            return Some(CascadeUpdate::Extended {
                cascade: active.clone(),
                component_id: component_id.to_string(),
            });
        }

        let mut initial = None;
        let mut affected = BTreeSet::new();
        for (t, id) in state.failures.iter().filter(|(t, _)| *t >= since && *t <= now) {
            if initial.is_none() {
                initial = Some((*t, id.clone()));
            }
            affected.insert(id.clone());
        }

        if affected.len() < self.config.cascade_threshold_depth {
            return None;
        }

        let (started, initial_component) =
            initial.unwrap_or_else(|| (now, component_id.to_string()));
        let cascade = CascadeEvent {
            cascade_id: Uuid::new_v4(),
            initial_component,
            cascade_level: self.classify(affected.len()),
            affected_components: affected,
            detected_at: started,
            last_failure_at: now,
            is_active: true,
        };
        state.total_cascades += 1;
        state.cascades.push(cascade.clone());

        warn!(
            cascade_id = %cascade.cascade_id,
            initial = %cascade.initial_component,
            level = ?cascade.cascade_level,
            affected = cascade.affected_components.len(),
            "Cascading failure detected"
        );
        Some(CascadeUpdate::Detected(cascade))
    }

    /// Close cascades with no failure for `cascade_quiescence` and forget
    /// closed ones past `operation_retention`.
    pub fn deactivate_quiescent(&self, now: DateTime<Utc>) -> Vec<CascadeEvent> {
        let quiescence = to_chrono(self.config.cascade_quiescence());
        let retention = to_chrono(self.config.operation_retention());
        let mut state = self.state.lock();
        let mut closed = Vec::new();

        for cascade in state.cascades.iter_mut().filter(|c| c.is_active) {
            if now - cascade.last_failure_at >= quiescence {
                cascade.is_active = false;
                info!(
                    cascade_id = %cascade.cascade_id,
                    affected = cascade.affected_components.len(),
                    "Cascade quiesced"
                );
                closed.push(cascade.clone());
            }
        }

        state
            .cascades
            .retain(|c| c.is_active || now - c.last_failure_at < retention);
        closed
    }

    /// Containment actions for every component a cascade covers.
    pub fn recovery_actions_for(&self, cascade: &CascadeEvent) -> Vec<RecoveryAction> {
        cascade
            .affected_components
            .iter()
            .map(|component_id| self.isolate_action(component_id, cascade))
            .collect()
    }

    pub fn isolate_action(&self, component_id: &str, cascade: &CascadeEvent) -> RecoveryAction {
        RecoveryAction::new(
            component_id,
            RecoveryStrategy::Isolate,
            MAX_PRIORITY,
            self.config.default_max_retries,
            self.config.default_timeout(),
        )
        .with_reason(format!(
            "cascade {} ({:?})",
            cascade.cascade_id, cascade.cascade_level
        ))
    }

    pub fn active_cascades(&self) -> Vec<CascadeEvent> {
        self.state
            .lock()
            .cascades
            .iter()
            .filter(|c| c.is_active)
            .cloned()
            .collect()
    }

    pub fn cascades(&self) -> Vec<CascadeEvent> {
        self.state.lock().cascades.clone()
    }

    pub fn total_cascades(&self) -> u64 {
        self.state.lock().total_cascades
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// `now - window`, clamped to the earliest representable time
fn window_start(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(to_chrono(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fail(detector: &CascadeDetector, id: &str, at: DateTime<Utc>) -> Option<CascadeUpdate> {
        detector.record_failure(id, at);
        detector.detect_cascading_failure(id, at)
    }

    #[test]
    fn test_cascade_threshold() {
        let detector = CascadeDetector::new(FailoverConfig::default());
        let now = Utc::now();

        assert!(fail(&detector, "a", now).is_none());
        assert!(fail(&detector, "b", now).is_none());
        // Repeat failures of the same component do not count twice
        assert!(fail(&detector, "b", now).is_none());
        assert_eq!(detector.total_cascades(), 0);

        match fail(&detector, "c", now) {
            Some(CascadeUpdate::Detected(cascade)) => {
                assert_eq!(cascade.initial_component, "a");
                assert_eq!(cascade.cascade_level, CascadeLevel::Service);
                assert_eq!(cascade.affected_components.len(), 3);
            }
            other => panic!("expected a new cascade, got {:?}", other),
        }
        assert_eq!(detector.total_cascades(), 1);
        assert_eq!(detector.active_cascades().len(), 1);
    }

    #[test]
    fn test_failures_outside_window_do_not_correlate() {
        let detector = CascadeDetector::new(FailoverConfig::default());
        let now = Utc::now();

        fail(&detector, "a", now - chrono::Duration::seconds(10));
        fail(&detector, "b", now - chrono::Duration::seconds(8));
        assert!(fail(&detector, "c", now).is_none());
        assert_eq!(detector.failure_count("a", Duration::from_secs(600), now), 1);
    }

    #[test]
    fn test_active_cascade_is_extended_and_escalates() {
        let detector = CascadeDetector::new(FailoverConfig::default());
        let now = Utc::now();
        for id in ["a", "b", "c"] {
            fail(&detector, id, now);
        }

        for (i, id) in ["d", "e"].into_iter().enumerate() {
            match fail(&detector, id, now) {
                Some(CascadeUpdate::Extended { cascade, component_id }) => {
                    assert_eq!(component_id, id);
                    assert_eq!(cascade.affected_components.len(), 4 + i);
                }
                other => panic!("expected extension, got {:?}", other),
            }
        }
        // Already covered
        assert!(fail(&detector, "a", now).is_none());

        let active = detector.active_cascades();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].cascade_level, CascadeLevel::Cluster);
        assert_eq!(detector.total_cascades(), 1);
    }

    #[test]
    fn test_oversized_windows_do_not_overflow() {
        let detector = CascadeDetector::new(FailoverConfig {
            failure_window_secs: 10_000_000_000_000,
            cascade_window_ms: u64::MAX,
            ..FailoverConfig::default()
        });
        let now = Utc::now();

        assert!(fail(&detector, "db", now).is_none());
        assert_eq!(detector.failure_count("db", Duration::MAX, now), 1);
        assert!(fail(&detector, "cache", now).is_none());
        assert!(matches!(
            fail(&detector, "queue", now),
            Some(CascadeUpdate::Detected(_))
        ));
    }

    #[test]
    fn test_classification() {
        let detector = CascadeDetector::new(FailoverConfig::default());
        assert_eq!(detector.classify(2), CascadeLevel::Component);
        assert_eq!(detector.classify(3), CascadeLevel::Service);
        assert_eq!(detector.classify(4), CascadeLevel::Service);
        assert_eq!(detector.classify(5), CascadeLevel::Cluster);
        assert_eq!(detector.classify(10), CascadeLevel::Critical);
    }

    #[test]
    fn test_quiescence_closes_cascade() {
        let detector = CascadeDetector::new(FailoverConfig::default());
        let now = Utc::now();
        for id in ["a", "b", "c"] {
            fail(&detector, id, now);
        }

        assert!(detector
            .deactivate_quiescent(now + chrono::Duration::seconds(30))
            .is_empty());
        let closed = detector.deactivate_quiescent(now + chrono::Duration::seconds(61));
        assert_eq!(closed.len(), 1);
        assert!(detector.active_cascades().is_empty());
        assert_eq!(detector.cascades().len(), 1);

        let forgotten = now + chrono::Duration::seconds(3601);
        detector.deactivate_quiescent(forgotten);
        assert!(detector.cascades().is_empty());
    }

    #[test]
    fn test_cascade_actions_isolate_at_max_priority() {
        let detector = CascadeDetector::new(FailoverConfig::default());
        let now = Utc::now();
        let mut cascade = None;
        for id in ["a", "b", "c"] {
            if let Some(CascadeUpdate::Detected(c)) = fail(&detector, id, now) {
                cascade = Some(c);
            }
        }

        let actions = detector.recovery_actions_for(&cascade.unwrap());
        assert_eq!(actions.len(), 3);
        assert!(actions
            .iter()
            .all(|a| a.strategy == RecoveryStrategy::Isolate && a.priority == MAX_PRIORITY));
    }
}
