//! Per-user cap on running jobs.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::domain::UserId;

/// Counts active jobs per user and refuses acquisition at the cap.
#[derive(Debug)]
pub struct ActiveJobRegistry {
    max_per_user: usize,
    counts: Mutex<HashMap<UserId, usize>>,
    violations: AtomicU64,
}

impl ActiveJobRegistry {
    pub fn new(max_per_user: usize) -> Self {
        Self {
            max_per_user: max_per_user.max(1),
            counts: Mutex::new(HashMap::new()),
            violations: AtomicU64::new(0),
        }
    }

    /// Take a slot for `user`. Returns `false` at the cap.
    pub fn try_acquire(&self, user: UserId) -> bool {
        let mut counts = self.counts.lock();
        let count = counts.entry(user).or_insert(0);
        if *count >= self.max_per_user {
            return false;
        }
        *count += 1;
        debug!(user_id = user, active = *count, "Acquired job slot");
        true
    }

    /// Return a slot. Releasing with no slot held is an invariant violation.
    pub fn release(&self, user: UserId) {
        let mut counts = self.counts.lock();
        match counts.get_mut(&user) {
            Some(count) if *count > 1 => {
                *count -= 1;
                debug!(user_id = user, active = *count, "Released job slot");
            }
            Some(_) => {
                counts.remove(&user);
                debug!(user_id = user, active = 0, "Released job slot");
            }
            None => {
                self.violations.fetch_add(1, Ordering::Relaxed);
                error!(user_id = user, "Job slot released without being held");
            }
        }
    }

    /// Scoped acquisition: the slot is released exactly once when the guard drops.
    pub fn try_acquire_guard(self: &Arc<Self>, user: UserId) -> Option<ActiveJobGuard> {
        self.try_acquire(user).then(|| ActiveJobGuard {
            registry: Arc::clone(self),
            user,
        })
    }

    pub fn active(&self, user: UserId) -> usize {
        self.counts.lock().get(&user).copied().unwrap_or(0)
    }

    pub fn total_active(&self) -> usize {
        self.counts.lock().values().sum()
    }

    /// Number of unmatched releases observed so far.
    pub fn violations(&self) -> u64 {
        self.violations.load(Ordering::Relaxed)
    }
}

/// Holds one slot for a user until dropped.
#[derive(Debug)]
pub struct ActiveJobGuard {
    registry: Arc<ActiveJobRegistry>,
    user: UserId,
}

impl ActiveJobGuard {
    pub fn user(&self) -> UserId {
        self.user
    }
}

impl Drop for ActiveJobGuard {
    fn drop(&mut self) {
        self.registry.release(self.user);
    }
}
