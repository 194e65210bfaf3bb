//! Lease locks on named resources.
//!
//! Locks are never queued: a conflicting request fails immediately and the
//! requester is recorded as a contender on the lock that blocked it. Leases
//! expire after `lock_timeout` and are reclaimed by a background sweep. No
//! fencing token is issued, so a holder that is slow rather than dead can
//! overlap with the next holder for at most one lease window.

use crate::config::LockConfig;
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
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockType {
    Exclusive,
    Shared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockState {
    Pending,
    Acquired,
    Contested,
    Released,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lock {
    pub lock_id: Uuid,
    pub key: String,
    pub lock_type: LockType,
    pub owner_node: String,
    pub state: LockState,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub contenders: BTreeSet<String>,
}

impl Lock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whether this lock blocks `owner` from taking `wanted` on the same key.
    fn conflicts_with(&self, wanted: LockType, owner: &str) -> bool {
        if self.owner_node == owner {
            return false;
        }
        matches!(
            (self.lock_type, wanted),
            (LockType::Exclusive, _) | (LockType::Shared, LockType::Exclusive)
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockMetrics {
    pub acquired: u64,
    pub released: u64,
    pub timed_out: u64,
    pub contentions: u64,
    pub active: usize,
}

#[derive(Debug, Default)]
struct Counters {
    acquired: AtomicU64,
    released: AtomicU64,
    timed_out: AtomicU64,
    contentions: AtomicU64,
}

#[derive(Clone)]
pub struct LockManager {
    config: LockConfig,
    /// Held locks per resource key
    locks: Arc<DashMap<String, Vec<Lock>>>,
    listeners: ListenerRegistry,
    counters: Arc<Counters>,
    tasks: Arc<Mutex<Option<TaskGroup>>>,
}

impl LockManager {
    pub fn new(config: LockConfig, listeners: ListenerRegistry) -> Self {
        Self {
            config,
            locks: Arc::new(DashMap::new()),
            listeners,
            counters: Arc::new(Counters::default()),
            tasks: Arc::new(Mutex::new(None)),
        }
    }

    /// `now + lock_timeout`, clamped to the latest representable time.
    fn lease_expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.config.lock_timeout())
            .ok()
            .and_then(|lease| now.checked_add_signed(lease))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Try to take `key` for `owner`. Returns the granted lock, or `None` if
    /// the key is held in a conflicting mode by another node.
    pub fn try_acquire(&self, key: &str, lock_type: LockType, owner: &str) -> Option<Lock> {
        self.try_acquire_at(key, lock_type, owner, Utc::now())
    }

    pub fn acquire_lock(&self, key: &str, lock_type: LockType, owner: &str) -> bool {
        self.try_acquire(key, lock_type, owner).is_some()
    }

    fn try_acquire_at(
        &self,
        key: &str,
        lock_type: LockType,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Option<Lock> {
        let (lock, renewed) = {
            let mut held = self.locks.entry(key.to_string()).or_default();
            // Expired leases do not block anyone, even before the sweep runs
            held.retain(|l| !l.is_expired(now));

            if let Some(blocker) = held.iter_mut().find(|l| l.conflicts_with(lock_type, owner)) {
                // The holder keeps its lease; the refused request is the contested one
                blocker.contenders.insert(owner.to_string());
                self.counters.contentions.fetch_add(1, Ordering::Relaxed);
                debug!(
                    key = %key,
                    owner = %owner,
                    holder = %blocker.owner_node,
                    "Lock contested"
                );
                return None;
            }

            match held
                .iter_mut()
                .find(|l| l.owner_node == owner && l.lock_type == lock_type)
            {
                Some(existing) => {
                    existing.expires_at = self.lease_expiry(now);
                    (existing.clone(), true)
                }
                None => {
                    let lock = Lock {
                        lock_id: Uuid::new_v4(),
                        key: key.to_string(),
                        lock_type,
                        owner_node: owner.to_string(),
                        state: LockState::Acquired,
                        acquired_at: now,
                        expires_at: self.lease_expiry(now),
                        contenders: BTreeSet::new(),
                    };
                    held.push(lock.clone());
                    (lock, false)
                }
            }
        };

        if renewed {
            debug!(key = %key, owner = %owner, "Lock lease renewed by re-acquire");
        } else {
            self.counters.acquired.fetch_add(1, Ordering::Relaxed);
            info!(key = %key, owner = %owner, lock_type = ?lock_type, "Lock acquired");
            self.listeners.emit(HaEvent::LockAcquired { lock: lock.clone() });
        }

        Some(lock)
    }

    /// Release the lock `owner` holds on `key`. Fails for anyone else.
    pub fn release_lock(&self, key: &str, owner: &str) -> bool {
        let released = {
            let Some(mut held) = self.locks.get_mut(key) else {
                return false;
            };
            match held.iter().position(|l| l.owner_node == owner) {
                Some(index) => {
                    let mut lock = held.remove(index);
                    lock.state = LockState::Released;
                    Some(lock)
                }
                None => None,
            }
        };
        self.locks.remove_if(key, |_, held| held.is_empty());

        match released {
            Some(lock) => {
                self.counters.released.fetch_add(1, Ordering::Relaxed);
                info!(key = %key, owner = %owner, "Lock released");
                self.listeners.emit(HaEvent::LockReleased { lock });
                true
            }
            None => {
                debug!(key = %key, owner = %owner, "Release refused: not the owner");
                false
            }
        }
    }

    /// Extend the owner's lease on `key`.
    pub fn renew_lock(&self, key: &str, owner: &str) -> bool {
        let now = Utc::now();

        let Some(mut held) = self.locks.get_mut(key) else {
            return false;
        };
        match held
            .iter_mut()
            .find(|l| l.owner_node == owner && !l.is_expired(now))
        {
            Some(lock) => {
                lock.expires_at = self.lease_expiry(now);
                true
            }
            None => false,
        }
    }

    /// Reclaim every lease that has run out by `now`.
    pub fn reclaim_expired(&self, now: DateTime<Utc>) -> Vec<Lock> {
        let mut reclaimed = Vec::new();

        for mut entry in self.locks.iter_mut() {
            let (expired, live): (Vec<Lock>, Vec<Lock>) =
                entry.drain(..).partition(|l| l.is_expired(now));
            *entry = live;
            reclaimed.extend(expired.into_iter().map(|mut l| {
                l.state = LockState::Timeout;
                l
            }));
        }
        self.locks.retain(|_, held| !held.is_empty());

        for lock in &reclaimed {
            self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
            info!(
                key = %lock.key,
                owner = %lock.owner_node,
                contenders = lock.contenders.len(),
                "Lock lease expired"
            );
        }

        reclaimed
    }

    pub fn get_lock(&self, key: &str) -> Option<Lock> {
        let now = Utc::now();
        self.locks
            .get(key)
            .and_then(|held| held.iter().find(|l| !l.is_expired(now)).cloned())
    }

    pub fn lock_holders(&self, key: &str) -> Vec<Lock> {
        let now = Utc::now();
        self.locks
            .get(key)
            .map(|held| held.iter().filter(|l| !l.is_expired(now)).cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.get_lock(key).is_some()
    }

    pub fn active_locks(&self) -> Vec<Lock> {
        let now = Utc::now();
        let mut locks: Vec<Lock> = self
            .locks
            .iter()
            .flat_map(|held| {
                held.iter()
                    .filter(|l| !l.is_expired(now))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        locks.sort_by(|a, b| a.key.cmp(&b.key).then(a.acquired_at.cmp(&b.acquired_at)));
        locks
    }

    pub fn metrics(&self) -> LockMetrics {
        LockMetrics {
            acquired: self.counters.acquired.load(Ordering::Relaxed),
            released: self.counters.released.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            contentions: self.counters.contentions.load(Ordering::Relaxed),
            active: self.active_locks().len(),
        }
    }

    pub async fn start(&self) -> Result<(), HaError> {
        let group = {
            let mut tasks = self.tasks.lock();
            if tasks.is_some() {
                return Ok(());
            }
            let group = TaskGroup::new("locks");
            *tasks = Some(group.clone());
            group
        };

        let manager = self.clone();
        group.spawn_loop(
            "lock-sweep",
            self.config.sweep_interval(),
            Duration::from_secs(1),
            move || {
                let manager = manager.clone();
                async move {
                    manager.reclaim_expired(Utc::now());
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
