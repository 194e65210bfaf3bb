//! Supervised background loops with explicit cancellation.

use crate::error::HaError;
use std::future::Future;
use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// A set of loops owned by one manager. `shutdown` cancels every loop and
/// waits for all of them to finish.
#[derive(Debug, Clone)]
pub struct TaskGroup {
    name: &'static str,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

impl TaskGroup {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            shutdown_token: CancellationToken::new(),
            task_tracker: TaskTracker::new(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Run `tick` every `period` until cancelled. A failing tick is logged
    /// and followed by `error_backoff` before the loop carries on.
    pub fn spawn_loop<F, Fut>(
        &self,
        task: &'static str,
        period: Duration,
        error_backoff: Duration,
        mut tick: F,
    ) where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), HaError>> + Send + 'static,
    {
        let token = self.shutdown_token.clone();
        let group = self.name;

        self.task_tracker.spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(group, task, ?period, "Background loop started");

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let result = tokio::select! {
                    _ = token.cancelled() => break,
                    result = tick() => result,
                };

                if let Err(e) = result {
                    warn!(group, task, error = %e, "Background loop iteration failed");
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = time::sleep(error_backoff) => {}
                    }
                }
            }

            debug!(group, task, "Background loop stopped");
        });
    }

    /// Spawn a one-off future that is cancelled together with the group.
    pub fn spawn<Fut>(&self, future: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.shutdown_token.clone();
        self.task_tracker.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = future => {}
            }
        });
    }

    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;
        debug!(group = self.name, "Task group stopped");
    }
}
