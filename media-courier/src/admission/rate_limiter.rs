//! Per-user sliding-window rate limiting of submission events.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::domain::UserId;

/// Idle users are pruned every this many calls.
const PRUNE_EVERY: u64 = 256;

/// Sliding-window limiter configuration.
#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    /// Maximum accepted events per window.
    pub limit: usize,
    pub window: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            limit: 6,
            window: Duration::from_secs(10),
        }
    }
}

/// Sliding-window limiter keyed by user.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    windows: Mutex<HashMap<UserId, VecDeque<Instant>>>,
    calls: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
            calls: AtomicU64::new(0),
        }
    }

    /// Record an event for `user` if the window has room.
    ///
    /// Returns `false` when the user already has `limit` events in the window.
    pub fn allow(&self, user: UserId) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock();

        if self.calls.fetch_add(1, Ordering::Relaxed) % PRUNE_EVERY == PRUNE_EVERY - 1 {
            self.prune_locked(&mut windows, now);
        }

        let window = windows.entry(user).or_default();
        while let Some(&oldest) = window.front() {
            if now.duration_since(oldest) >= self.config.window {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() >= self.config.limit {
            trace!(user_id = user, count = window.len(), "Rate limited");
            return false;
        }
        window.push_back(now);
        true
    }

    /// Drop users whose whole window has expired.
    pub fn prune(&self) {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        self.prune_locked(&mut windows, now);
    }

    fn prune_locked(&self, windows: &mut HashMap<UserId, VecDeque<Instant>>, now: Instant) {
        let before = windows.len();
        windows.retain(|_, w| {
            w.back()
                .is_some_and(|last| now.duration_since(*last) < self.config.window)
        });
        let removed = before - windows.len();
        if removed > 0 {
            debug!(removed, "Pruned idle rate-limit windows");
        }
    }

    /// Number of users currently tracked.
    pub fn tracked_users(&self) -> usize {
        self.windows.lock().len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}
