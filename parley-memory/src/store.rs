//! In-memory per-user session store.
//!
//! Sessions live in a concurrent map of per-user async mutexes. Holding a
//! [`SessionGuard`] serializes every read-modify-write of that user's buffer,
//! while different users never contend with each other. Nothing is persisted.

use crate::clock::Clock;
use crate::message::{Message, Role};
use crate::tokenizer::FallbackEstimator;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Exclusive access to one user's session.
pub type SessionGuard = OwnedMutexGuard<Session>;

type Slot = Arc<Mutex<Session>>;

/// Per-user conversation state.
#[derive(Debug, Clone)]
pub struct Session {
    /// Conversation history, oldest first. Excludes the system preamble.
    pub buffer: Vec<Message>,
    created_at: DateTime<Utc>,
    last_access: DateTime<Utc>,
    /// Set by the reaper once the slot has left the map.
    retired: bool,
}

impl Session {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            buffer: Vec::new(),
            created_at: now,
            last_access: now,
            retired: false,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_access(&self) -> DateTime<Utc> {
        self.last_access
    }

    /// Completed (user, assistant) rounds in the buffer.
    pub fn rounds(&self) -> usize {
        self.buffer
            .windows(2)
            .filter(|pair| pair[0].role == Role::User && pair[1].role == Role::Assistant)
            .count()
    }

    /// Idle time at `now`; zero if the clock went backwards.
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_access).to_std().unwrap_or_default()
    }
}

/// Read-only view of a session for the `/stats` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub messages: usize,
    pub rounds: usize,
    pub chars: usize,
    pub estimated_tokens: usize,
    pub age: Duration,
    pub idle: Duration,
}

/// The session is locked by a request in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("session is busy")]
pub struct SessionBusy;

/// Owned session store with an injected clock.
pub struct SessionStore {
    sessions: DashMap<String, Slot>,
    clock: Arc<dyn Clock>,
}

impl SessionStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: DashMap::new(),
            clock,
        }
    }

    /// Current time according to the store's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn slot(&self, user_id: &str) -> Slot {
        if let Some(existing) = self.sessions.get(user_id) {
            return Arc::clone(existing.value());
        }
        let now = self.clock.now();
        let entry = self
            .sessions
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Session::new(now))));
        Arc::clone(entry.value())
    }

    /// Lock the user's session, creating it if needed, and refresh its
    /// last-access time.
    ///
    /// Waits while another task holds the same user's session.
    pub async fn touch(&self, user_id: &str) -> SessionGuard {
        loop {
            let slot = self.slot(user_id);
            let mut guard = slot.lock_owned().await;
            if guard.retired {
                // reaped while we were waiting; the map has moved on
                continue;
            }
            guard.last_access = self.clock.now();
            return guard;
        }
    }

    /// Empty the user's buffer. Returns how many messages were dropped.
    pub async fn clear(&self, user_id: &str) -> usize {
        let mut guard = self.touch(user_id).await;
        let dropped = guard.buffer.len();
        guard.buffer.clear();
        tracing::info!(user_id = %user_id, dropped, "Session cleared");
        dropped
    }

    /// Size and age of the user's session without refreshing it.
    ///
    /// Does not wait for a reply in progress: a locked session reports
    /// [`SessionBusy`]. `Ok(None)` means the user has no session.
    pub fn stats(
        &self,
        user_id: &str,
        estimator: &FallbackEstimator,
    ) -> Result<Option<SessionStats>, SessionBusy> {
        let Some(slot) = self.sessions.get(user_id).map(|s| Arc::clone(s.value())) else {
            return Ok(None);
        };
        let guard = slot.try_lock().map_err(|_| SessionBusy)?;
        if guard.retired {
            return Ok(None);
        }

        let now = self.clock.now();
        Ok(Some(SessionStats {
            messages: guard.buffer.len(),
            rounds: guard.rounds(),
            chars: guard.buffer.iter().map(Message::char_len).sum(),
            estimated_tokens: estimator.count_messages(&guard.buffer),
            age: (now - guard.created_at).to_std().unwrap_or_default(),
            idle: guard.idle_for(now),
        }))
    }

    /// Remove every session idle for longer than `ttl` at `now`.
    ///
    /// Sessions locked by an in-flight request are in use and are skipped.
    /// Returns the number of sessions removed.
    pub fn reap(&self, now: DateTime<Utc>, ttl: Duration) -> usize {
        let slots: Vec<(String, Slot)> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut removed = 0;
        for (user_id, slot) in slots {
            let Ok(mut guard) = slot.try_lock() else {
                continue;
            };
            if guard.retired || guard.idle_for(now) <= ttl {
                continue;
            }

            guard.retired = true;
            self.sessions
                .remove_if(&user_id, |_, current| Arc::ptr_eq(current, &slot));
            removed += 1;
            tracing::debug!(user_id = %user_id, "Reaped idle session");
        }

        if removed > 0 {
            tracing::info!(removed, remaining = self.sessions.len(), "Reaped idle sessions");
        }
        removed
    }

    /// [`reap`](Self::reap) at the clock's current time.
    pub fn reap_idle(&self, ttl: Duration) -> usize {
        self.reap(self.clock.now(), ttl)
    }

    /// Whether the user currently has a session.
    pub fn contains(&self, user_id: &str) -> bool {
        self.sessions.contains_key(user_id)
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("sessions", &self.sessions.len())
            .finish()
    }
}
