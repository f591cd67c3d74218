//! Sleep-state reconciliation engine.
//!
//! The engine keeps no state of its own. Each operation runs as one
//! [`LedgerStore::transact`] critical section:
//!
//! 1. Reload the ledger
//! 2. Heal anomalies for the user involved (asleep > 150h, awake > 200h)
//! 3. Apply the requested transition, if its precondition holds
//! 4. Persist, if anything changed
//!
//! Anomaly corrections are persisted even when the requested transition is
//! then rejected, so the self-healed state never depends on who asked.

use crate::types::{anomalous_awake_after, anomalous_sleep_after};
use crate::{Error, Ledger, LedgerStore, Result, SleepRecord, Timestamp, UserSleepState};
use std::str::FromStr;

/// Allowed distance between a sleep and the user's average for auto-wake
pub const AUTO_WAKE_WINDOW_MINUTES: f64 = 60.0;

// ============================================================================
// Resolved status
// ============================================================================

/// A user's status as shown to everyone
#[derive(Clone, Debug, PartialEq)]
pub enum ResolvedStatus {
    /// The user has never used the tracker (or cleared their data)
    NeverTracked,
    Tracked(UserStatus),
}

impl ResolvedStatus {
    pub fn as_tracked(&self) -> Option<&UserStatus> {
        match self {
            ResolvedStatus::Tracked(status) => Some(status),
            ResolvedStatus::NeverTracked => None,
        }
    }

    pub fn is_sleeping(&self) -> bool {
        self.as_tracked().is_some_and(|s| s.is_sleeping)
    }
}

/// Derived status for a tracked user
#[derive(Clone, Debug, PartialEq)]
pub struct UserStatus {
    pub user_id: String,
    pub is_sleeping: bool,
    /// The open session's start while asleep, else the latest valid record's
    pub last_sleep_start: Option<Timestamp>,
    /// End of the latest valid record
    pub last_sleep_end: Option<Timestamp>,
    pub average_sleep_minutes: f64,
    /// Raw state, for elapsed-time rendering
    pub state: UserSleepState,
}

impl UserStatus {
    fn from_state(user_id: &str, state: &UserSleepState) -> Self {
        let latest = state.latest_valid_record();
        let last_sleep_start = if state.is_sleeping {
            state.sleep_start
        } else {
            latest.map(|r| r.sleep_start)
        };

        Self {
            user_id: user_id.to_string(),
            is_sleeping: state.is_sleeping,
            last_sleep_start,
            last_sleep_end: latest.map(|r| r.sleep_end),
            average_sleep_minutes: state.average_sleep_minutes(),
            state: state.clone(),
        }
    }
}

/// A repair applied while resolving status
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Correction {
    /// Asleep for more than 150 hours: the session was closed at `now`
    AnomalousSleep { record: SleepRecord },
    /// Awake for more than 200 hours: the last wake time was forgotten
    AnomalousAwake { cleared_wake: Timestamp },
}

/// Status plus the repairs it took to get there, in the order applied
#[derive(Clone, Debug, PartialEq)]
pub struct Resolution {
    pub status: ResolvedStatus,
    pub corrections: Vec<Correction>,
}

impl Resolution {
    /// True when resolving wrote to the ledger
    pub fn corrected(&self) -> bool {
        !self.corrections.is_empty()
    }
}

// ============================================================================
// Transitions
// ============================================================================

/// Status values accepted by the admin override
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SleepStatus {
    Sleep,
    Wake,
}

impl FromStr for SleepStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "sleep" => Ok(SleepStatus::Sleep),
            "wake" => Ok(SleepStatus::Wake),
            _ => Err(Error::InvalidStatusValue(s.to_string())),
        }
    }
}

/// Who is asking for an override
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    pub privileged: bool,
}

impl Actor {
    pub fn new(id: impl Into<String>, privileged: bool) -> Self {
        Self {
            id: id.into(),
            privileged,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransitionKind {
    FellAsleep,
    WokeUp { record: SleepRecord },
}

/// A state change that was applied
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    pub user_id: String,
    pub kind: TransitionKind,
    pub at: Timestamp,
    /// Repairs applied before the transition
    pub corrections: Vec<Correction>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClearOutcome {
    Cleared,
    /// Nothing was stored for the user
    NoData,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PresenceOutcome {
    /// Presence only drives users who have used the tracker before
    Untracked,
    AutoSlept,
    AutoWoke { record: SleepRecord },
    Unchanged,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PresenceReport {
    pub outcome: PresenceOutcome,
    pub corrections: Vec<Correction>,
}

// ============================================================================
// Pure ledger operations
// ============================================================================

/// Heal anomalous state for one user in place
fn heal(user_id: &str, state: &mut UserSleepState, now: Timestamp) -> Result<Vec<Correction>> {
    let mut corrections = Vec::new();

    if let (true, Some(start)) = (state.is_sleeping, state.sleep_start) {
        if now - start > anomalous_sleep_after() {
            let record = state.close_session(now, false)?;
            tracing::warn!(
                "User {} has been asleep for {} minutes, waking them automatically",
                user_id,
                record.duration_minutes
            );
            corrections.push(Correction::AnomalousSleep { record });
        }
    }

    // Runs after the sleep repair too, so a stale wake time left from
    // before that session is cleared in the same pass.
    if !state.is_sleeping {
        if let Some(wake) = state.sleep_end {
            if now - wake > anomalous_awake_after() {
                state.sleep_end = None;
                tracing::warn!(
                    "User {} has been awake since {}, resetting their wake time",
                    user_id,
                    wake
                );
                corrections.push(Correction::AnomalousAwake { cleared_wake: wake });
            }
        }
    }

    Ok(corrections)
}

/// Resolve a user's status against `now`, healing anomalies in the ledger
///
/// Callers already inside a transaction use this directly; everyone else
/// goes through [`Reconciler::resolve_status`].
pub fn resolve_in_place(ledger: &mut Ledger, user_id: &str, now: Timestamp) -> Result<Resolution> {
    let Some(state) = ledger.get_user_mut(user_id) else {
        return Ok(Resolution {
            status: ResolvedStatus::NeverTracked,
            corrections: Vec::new(),
        });
    };

    let corrections = heal(user_id, state, now)?;
    Ok(Resolution {
        status: ResolvedStatus::Tracked(UserStatus::from_state(user_id, state)),
        corrections,
    })
}

fn begin_sleep_in(ledger: &mut Ledger, user_id: &str, now: Timestamp) -> Result<Transition> {
    let state = ledger.entry(user_id);
    let corrections = heal(user_id, state, now)?;

    if state.is_sleeping {
        return Err(Error::AlreadySleeping {
            user_id: user_id.to_string(),
        });
    }

    state.fall_asleep(now);
    tracing::info!("User {} fell asleep at {}", user_id, now);

    Ok(Transition {
        user_id: user_id.to_string(),
        kind: TransitionKind::FellAsleep,
        at: now,
        corrections,
    })
}

fn end_sleep_in(ledger: &mut Ledger, user_id: &str, now: Timestamp) -> Result<Transition> {
    let not_sleeping = || Error::NotSleeping {
        user_id: user_id.to_string(),
    };

    let state = ledger.get_user_mut(user_id).ok_or_else(not_sleeping)?;
    let corrections = heal(user_id, state, now)?;

    if !state.is_sleeping {
        return Err(not_sleeping());
    }

    let record = state.close_session(now, true)?;
    tracing::info!(
        "User {} woke up at {} after {} minutes",
        user_id,
        now,
        record.duration_minutes
    );

    Ok(Transition {
        user_id: user_id.to_string(),
        kind: TransitionKind::WokeUp { record },
        at: now,
        corrections,
    })
}

fn presence_in(
    ledger: &mut Ledger,
    user_id: &str,
    went_offline: bool,
    now: Timestamp,
) -> Result<PresenceReport> {
    let Some(state) = ledger.get_user_mut(user_id) else {
        return Ok(PresenceReport {
            outcome: PresenceOutcome::Untracked,
            corrections: Vec::new(),
        });
    };

    let corrections = heal(user_id, state, now)?;

    let outcome = match (went_offline, state.is_sleeping, state.sleep_start) {
        (true, false, _) => {
            state.fall_asleep(now);
            tracing::info!("User {} went offline, marking them asleep", user_id);
            PresenceOutcome::AutoSlept
        }
        (false, true, Some(start)) => {
            let elapsed = (now - start).num_seconds() as f64 / 60.0;
            let average = state.average_sleep_minutes();
            let lower = average - AUTO_WAKE_WINDOW_MINUTES;
            let upper = average + AUTO_WAKE_WINDOW_MINUTES;

            if average > 0.0 && (lower..=upper).contains(&elapsed) {
                let record = state.close_session(now, true)?;
                tracing::info!(
                    "User {} came online after {} minutes (average {:.0}), waking them",
                    user_id,
                    record.duration_minutes,
                    average
                );
                PresenceOutcome::AutoWoke { record }
            } else {
                tracing::debug!(
                    "User {} came online after {:.0} minutes, outside [{:.0}, {:.0}]",
                    user_id,
                    elapsed,
                    lower,
                    upper
                );
                PresenceOutcome::Unchanged
            }
        }
        _ => PresenceOutcome::Unchanged,
    };

    Ok(PresenceReport {
        outcome,
        corrections,
    })
}

// ============================================================================
// Reconciler
// ============================================================================

/// Engine operations bound to a ledger store
pub struct Reconciler<S> {
    store: S,
}

impl<S: LedgerStore> Reconciler<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Current status for one user, persisting any anomaly correction first
    pub fn resolve_status(&self, user_id: &str, now: Timestamp) -> Result<Resolution> {
        self.store
            .transact(|ledger| resolve_in_place(ledger, user_id, now))?
    }

    /// Resolve every tracked user in one transaction, in user id order
    pub fn resolve_all(&self, now: Timestamp) -> Result<Vec<Resolution>> {
        self.store.transact(|ledger| {
            let ids: Vec<String> = ledger.iter().map(|(id, _)| id.to_string()).collect();
            ids.iter()
                .map(|id| resolve_in_place(ledger, id, now))
                .collect::<Result<Vec<_>>>()
        })?
    }

    pub fn begin_sleep(&self, user_id: &str, now: Timestamp) -> Result<Transition> {
        self.store
            .transact(|ledger| begin_sleep_in(ledger, user_id, now))?
    }

    pub fn end_sleep(&self, user_id: &str, now: Timestamp) -> Result<Transition> {
        self.store
            .transact(|ledger| end_sleep_in(ledger, user_id, now))?
    }

    /// Privileged override of another user's status
    pub fn set_status(
        &self,
        user_id: &str,
        status: &str,
        now: Timestamp,
        actor: &Actor,
    ) -> Result<Transition> {
        if !actor.privileged {
            tracing::warn!(
                "Actor {} tried to set {}'s status without privilege",
                actor.id,
                user_id
            );
            return Err(Error::Forbidden {
                actor_id: actor.id.clone(),
            });
        }

        let status: SleepStatus = status.parse()?;
        tracing::info!("Actor {} sets {} to {:?}", actor.id, user_id, status);
        match status {
            SleepStatus::Sleep => self.begin_sleep(user_id, now),
            SleepStatus::Wake => self.end_sleep(user_id, now),
        }
    }

    /// Delete everything stored for a user
    pub fn clear_user_data(&self, user_id: &str) -> Result<ClearOutcome> {
        let removed = self.store.transact(|ledger| ledger.delete_user(user_id))?;
        if removed {
            tracing::info!("Cleared all sleep data for user {}", user_id);
            Ok(ClearOutcome::Cleared)
        } else {
            tracing::debug!("No sleep data to clear for user {}", user_id);
            Ok(ClearOutcome::NoData)
        }
    }

    /// React to a user going offline or coming back online
    pub fn on_presence_change(
        &self,
        user_id: &str,
        went_offline: bool,
        now: Timestamp,
    ) -> Result<PresenceReport> {
        self.store
            .transact(|ledger| presence_in(ledger, user_id, went_offline, now))?
    }
}
