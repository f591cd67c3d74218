//! UI-session state that never reaches the ledger.
//!
//! A long-running front end keeps one of each of these per process:
//! - `ClearGate`: the per-user double-press confirmation for clearing data
//! - `TransientMessages`: acknowledgements to retract or delete later
//!
//! Time is always passed in, so expiry is explicit and testable.

use crate::Timestamp;
use chrono::Duration;
use std::collections::HashMap;
use uuid::Uuid;

// ============================================================================
// TTL store
// ============================================================================

/// Values keyed by user id that expire after a fixed time
#[derive(Debug)]
pub struct TtlStore<V> {
    entries: HashMap<String, (V, Timestamp)>,
}

impl<V> Default for TtlStore<V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<V> TtlStore<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` until `now + ttl`, replacing any previous value
    pub fn insert(&mut self, key: impl Into<String>, value: V, now: Timestamp, ttl: Duration) {
        self.entries.insert(key.into(), (value, now + ttl));
    }

    /// Remove and return the value if it is still live
    pub fn take(&mut self, key: &str, now: Timestamp) -> Option<V> {
        match self.entries.remove(key) {
            Some((value, expires_at)) if now < expires_at => Some(value),
            _ => None,
        }
    }

    /// Drop everything that has expired, returning how many entries went
    pub fn evict_expired(&mut self, now: Timestamp) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, (_, expires_at)| now < *expires_at);
        before - self.entries.len()
    }
}

// ============================================================================
// Clear confirmation
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClearDecision {
    /// First press: ask the user to press again
    Armed,
    /// Second press inside the window: go ahead and delete
    Confirmed,
}

/// Requires two presses within a window before data is cleared
#[derive(Debug)]
pub struct ClearGate {
    armed: TtlStore<()>,
    window: Duration,
}

impl ClearGate {
    pub fn new(window: Duration) -> Self {
        Self {
            armed: TtlStore::new(),
            window,
        }
    }

    /// Register a press by `user_id`
    pub fn press(&mut self, user_id: &str, now: Timestamp) -> ClearDecision {
        let expired = self.armed.evict_expired(now);
        if expired > 0 {
            tracing::debug!("{} clear confirmations timed out", expired);
        }

        if self.armed.take(user_id, now).is_some() {
            ClearDecision::Confirmed
        } else {
            self.armed.insert(user_id, (), now, self.window);
            ClearDecision::Armed
        }
    }
}

// ============================================================================
// Transient messages
// ============================================================================

/// An acknowledgement shown to a user that the front end will remove
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackedMessage {
    pub message_id: Uuid,
    pub user_id: String,
    /// When to delete it on a timer; `None` keeps it until the user acts again
    pub delete_at: Option<Timestamp>,
}

/// Per-user list of messages awaiting removal
#[derive(Debug, Default)]
pub struct TransientMessages {
    by_user: HashMap<String, Vec<TrackedMessage>>,
}

impl TransientMessages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a new message, optionally scheduling its deletion
    pub fn track(&mut self, user_id: &str, now: Timestamp, delay: Option<Duration>) -> TrackedMessage {
        let message = TrackedMessage {
            message_id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            delete_at: delay.map(|d| now + d),
        };
        self.by_user
            .entry(user_id.to_string())
            .or_default()
            .push(message.clone());
        message
    }

    /// Everything still shown to `user_id`; removing them is the caller's job
    pub fn take_user(&mut self, user_id: &str) -> Vec<TrackedMessage> {
        self.by_user.remove(user_id).unwrap_or_default()
    }

    /// Messages whose scheduled deletion time has arrived
    pub fn take_due(&mut self, now: Timestamp) -> Vec<TrackedMessage> {
        let mut due = Vec::new();
        for messages in self.by_user.values_mut() {
            let (ready, keep): (Vec<_>, Vec<_>) = messages
                .drain(..)
                .partition(|m| m.delete_at.is_some_and(|at| at <= now));
            *messages = keep;
            due.extend(ready);
        }
        self.by_user.retain(|_, messages| !messages.is_empty());
        due
    }
}
