//! Short-lived, versioned per-user sessions binding button presses back to
//! concrete stream pairs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::domain::{FormatChoice, Platform, UserId};
use crate::{Error, Result};

#[derive(Debug)]
struct UserSession {
    url: String,
    platform: Platform,
    version: u64,
    choices: HashMap<String, Arc<FormatChoice>>,
    warned_risky: bool,
    created_at: Instant,
}

/// A choice resolved against a live session.
#[derive(Debug, Clone)]
pub struct SessionSelection {
    pub url: String,
    pub platform: Platform,
    pub version: u64,
    pub choice: Arc<FormatChoice>,
}

#[derive(Debug, Default)]
struct Inner {
    sessions: HashMap<UserId, UserSession>,
    /// Versions come from one counter shared by all users, so a pruned and
    /// recreated session never reuses an old version.
    next_version: u64,
}

/// One live session per user; a selection is valid only against the
/// version it was issued for.
#[derive(Debug)]
pub struct SessionCache {
    ttl: Duration,
    inner: Mutex<Inner>,
}

impl SessionCache {
    /// A zero `ttl` disables expiry.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Replace the user's session and return its version.
    pub fn new_session(
        &self,
        user: UserId,
        url: impl Into<String>,
        platform: Platform,
        choices: Vec<FormatChoice>,
    ) -> u64 {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.prune_locked(&mut inner, now);

        inner.next_version += 1;
        let version = inner.next_version;
        let choices = choices
            .into_iter()
            .map(|c| (c.choice_id.clone(), Arc::new(c)))
            .collect();
        inner.sessions.insert(
            user,
            UserSession {
                url: url.into(),
                platform,
                version,
                choices,
                warned_risky: false,
                created_at: now,
            },
        );
        debug!(user_id = user, version, "New session");
        version
    }

    /// Resolve a button press.
    ///
    /// Fails with [`Error::SessionExpired`] when there is no session, the
    /// version is stale or the choice is not part of it.
    pub fn resolve(&self, user: UserId, version: u64, choice_id: &str) -> Result<SessionSelection> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.prune_locked(&mut inner, now);

        let session = inner
            .sessions
            .get(&user)
            .filter(|s| s.version == version)
            .ok_or(Error::SessionExpired)?;
        let choice = session
            .choices
            .get(choice_id)
            .cloned()
            .ok_or(Error::SessionExpired)?;
        Ok(SessionSelection {
            url: session.url.clone(),
            platform: session.platform,
            version,
            choice,
        })
    }

    /// One-shot risk warning: `true` the first time it is asked for a
    /// session version, `false` afterwards.
    pub fn take_risk_warning(&self, user: UserId, version: u64) -> Result<bool> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.prune_locked(&mut inner, now);

        let session = inner
            .sessions
            .get_mut(&user)
            .filter(|s| s.version == version)
            .ok_or(Error::SessionExpired)?;
        let first = !session.warned_risky;
        session.warned_risky = true;
        Ok(first)
    }

    pub fn current_version(&self, user: UserId) -> Option<u64> {
        self.inner.lock().sessions.get(&user).map(|s| s.version)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn prune_locked(&self, inner: &mut Inner, now: Instant) {
        if self.ttl.is_zero() {
            return;
        }
        let ttl = self.ttl;
        inner
            .sessions
            .retain(|_, s| now.duration_since(s.created_at) <= ttl);
    }
}
