//! Front-end facing event dispatch.
//!
//! A chat bot (or the CLI shell) feeds [`UserAction`]s and
//! [`PresenceEvent`]s into a [`Tracker`]. The tracker routes them to the
//! engine, applies the clear confirmation, and keeps track of which
//! acknowledgements should be removed later.

use crate::config::UiConfig;
use crate::engine::{
    Actor, ClearOutcome, PresenceReport, Reconciler, Resolution, Transition,
};
use crate::session::{ClearDecision, ClearGate, TrackedMessage, TransientMessages};
use crate::summary::{build_summary, Member, SummaryRow};
use crate::{Error, LedgerStore, Result, Timestamp};
use chrono::Duration;
use std::collections::HashSet;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActionKind {
    BeginSleep,
    EndSleep,
    Query,
    /// Privileged override of `user_id`'s status by `actor_id`
    AdminSet { status: String },
    ClearData,
}

/// An explicit action taken through the UI
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserAction {
    pub kind: ActionKind,
    /// The user whose state is affected
    pub user_id: String,
    /// The user who pressed the button or ran the command
    pub actor_id: String,
    pub now: Timestamp,
}

impl UserAction {
    /// An action a user takes on their own behalf
    pub fn own(kind: ActionKind, user_id: impl Into<String>, now: Timestamp) -> Self {
        let user_id = user_id.into();
        Self {
            kind,
            actor_id: user_id.clone(),
            user_id,
            now,
        }
    }
}

/// A user's platform presence flipped
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PresenceEvent {
    pub user_id: String,
    pub went_offline: bool,
    pub now: Timestamp,
}

/// What a successful action produced
#[derive(Clone, Debug, PartialEq)]
pub enum ActionOutcome {
    Status(Resolution),
    Transition(Transition),
    /// First clear press; waiting for the second
    ClearPending,
    Cleared(ClearOutcome),
}

/// Acknowledgement for an action
#[derive(Debug)]
pub enum TransitionResult {
    Success(ActionOutcome),
    /// Rejected because of the user's state or input
    Conflict(Error),
    /// Storage or environment failure
    Error(Error),
}

impl TransitionResult {
    fn from_result(result: Result<ActionOutcome>) -> Self {
        match result {
            Ok(outcome) => TransitionResult::Success(outcome),
            Err(e) if e.is_conflict() => TransitionResult::Conflict(e),
            Err(e) => TransitionResult::Error(e),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TransitionResult::Success(_))
    }
}

/// Everything the front end needs to show and tidy up after an action
#[derive(Debug)]
pub struct Response {
    pub result: TransitionResult,
    /// Earlier acknowledgements for this user to remove now
    pub retracted: Vec<TrackedMessage>,
    /// Handle for the acknowledgement of this action
    pub message: TrackedMessage,
}

/// Engine plus the UI-session state of one front end
pub struct Tracker<S> {
    engine: Reconciler<S>,
    clear_gate: ClearGate,
    messages: TransientMessages,
    admins: HashSet<String>,
    message_delay: Duration,
    clear_result_delay: Duration,
}

impl<S: LedgerStore> Tracker<S> {
    pub fn new(engine: Reconciler<S>, admins: impl IntoIterator<Item = String>, ui: &UiConfig) -> Self {
        Self {
            engine,
            clear_gate: ClearGate::new(ui.clear_confirm_window()),
            messages: TransientMessages::new(),
            admins: admins.into_iter().collect(),
            message_delay: ui.transient_message_delay(),
            clear_result_delay: ui.clear_result_delay(),
        }
    }

    pub fn engine(&self) -> &Reconciler<S> {
        &self.engine
    }

    pub fn is_admin(&self, actor_id: &str) -> bool {
        self.admins.contains(actor_id)
    }

    /// Route an action to the engine and track its acknowledgement
    pub fn handle_action(&mut self, action: &UserAction) -> Response {
        let retracted = self.messages.take_user(&action.actor_id);
        let result = TransitionResult::from_result(self.apply(action));

        // Confirmations of a state change disappear on a timer; everything
        // else stays until the user acts again.
        let delay = match &result {
            TransitionResult::Success(ActionOutcome::Transition(_)) => Some(self.message_delay),
            TransitionResult::Success(ActionOutcome::Cleared(_)) => Some(self.clear_result_delay),
            _ => None,
        };
        let message = self.messages.track(&action.actor_id, action.now, delay);

        Response {
            result,
            retracted,
            message,
        }
    }

    fn apply(&mut self, action: &UserAction) -> Result<ActionOutcome> {
        let user_id = action.user_id.as_str();
        let now = action.now;

        match &action.kind {
            ActionKind::BeginSleep => self
                .engine
                .begin_sleep(user_id, now)
                .map(ActionOutcome::Transition),
            ActionKind::EndSleep => self
                .engine
                .end_sleep(user_id, now)
                .map(ActionOutcome::Transition),
            ActionKind::Query => self
                .engine
                .resolve_status(user_id, now)
                .map(ActionOutcome::Status),
            ActionKind::AdminSet { status } => {
                let actor = Actor::new(&action.actor_id, self.is_admin(&action.actor_id));
                self.engine
                    .set_status(user_id, status, now, &actor)
                    .map(ActionOutcome::Transition)
            }
            ActionKind::ClearData
                if action.actor_id != action.user_id && !self.is_admin(&action.actor_id) =>
            {
                Err(Error::Forbidden {
                    actor_id: action.actor_id.clone(),
                })
            }
            ActionKind::ClearData => match self.clear_gate.press(user_id, now) {
                ClearDecision::Armed => {
                    tracing::debug!("Clear armed for user {}", user_id);
                    Ok(ActionOutcome::ClearPending)
                }
                ClearDecision::Confirmed => self
                    .engine
                    .clear_user_data(user_id)
                    .map(ActionOutcome::Cleared),
            },
        }
    }

    pub fn handle_presence(&mut self, event: &PresenceEvent) -> Result<PresenceReport> {
        self.engine
            .on_presence_change(&event.user_id, event.went_offline, event.now)
    }

    /// Acknowledgements whose deletion timer has fired
    pub fn due_deletions(&mut self, now: Timestamp) -> Vec<TrackedMessage> {
        self.messages.take_due(now)
    }

    pub fn summary(&self, members: &[Member], now: Timestamp) -> Result<Vec<SummaryRow>> {
        build_summary(&self.engine, members, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ResolvedStatus, TransitionKind};
    use crate::ledger::MemoryLedgerStore;
    use chrono::DateTime;

    fn t0() -> Timestamp {
        DateTime::parse_from_rfc3339("2024-01-15T23:00:00+09:00").unwrap()
    }

    fn tracker() -> Tracker<MemoryLedgerStore> {
        Tracker::new(
            Reconciler::new(MemoryLedgerStore::new()),
            vec!["admin".to_string()],
            &UiConfig::default(),
        )
    }

    fn act(tracker: &mut Tracker<MemoryLedgerStore>, kind: ActionKind, user: &str, now: Timestamp) -> Response {
        tracker.handle_action(&UserAction::own(kind, user, now))
    }

    #[test]
    fn test_sleep_and_wake_through_tracker() {
        let mut tracker = tracker();
        let response = act(&mut tracker, ActionKind::BeginSleep, "a", t0());
        assert!(response.result.is_success());
        assert_eq!(
            response.message.delete_at,
            Some(t0() + Duration::minutes(2))
        );

        let wake = t0() + Duration::hours(8);
        let response = act(&mut tracker, ActionKind::EndSleep, "a", wake);
        match response.result {
            TransitionResult::Success(ActionOutcome::Transition(t)) => {
                assert!(matches!(t.kind, TransitionKind::WokeUp { .. }))
            }
            other => panic!("expected wake, got {:?}", other),
        }
        // The sleep acknowledgement is retracted when the user acts again
        assert_eq!(response.retracted.len(), 1);
    }

    #[test]
    fn test_conflicts_are_classified() {
        let mut tracker = tracker();
        let response = act(&mut tracker, ActionKind::EndSleep, "a", t0());
        assert!(matches!(
            response.result,
            TransitionResult::Conflict(Error::NotSleeping { .. })
        ));
        assert_eq!(response.message.delete_at, None);
    }

    #[test]
    fn test_query_unknown_user() {
        let mut tracker = tracker();
        let response = act(&mut tracker, ActionKind::Query, "a", t0());
        match response.result {
            TransitionResult::Success(ActionOutcome::Status(resolution)) => {
                assert_eq!(resolution.status, ResolvedStatus::NeverTracked)
            }
            other => panic!("expected status, got {:?}", other),
        }
    }

    #[test]
    fn test_admin_set_checks_privilege() {
        let mut tracker = tracker();
        let denied = tracker.handle_action(&UserAction {
            kind: ActionKind::AdminSet {
                status: "sleep".into(),
            },
            user_id: "a".into(),
            actor_id: "b".into(),
            now: t0(),
        });
        assert!(matches!(
            denied.result,
            TransitionResult::Conflict(Error::Forbidden { .. })
        ));

        let allowed = tracker.handle_action(&UserAction {
            kind: ActionKind::AdminSet {
                status: "sleep".into(),
            },
            user_id: "a".into(),
            actor_id: "admin".into(),
            now: t0(),
        });
        assert!(allowed.result.is_success());
        assert!(tracker
            .engine()
            .resolve_status("a", t0())
            .unwrap()
            .status
            .is_sleeping());
    }

    #[test]
    fn test_clear_requires_double_press() {
        let mut tracker = tracker();
        act(&mut tracker, ActionKind::BeginSleep, "a", t0());

        let first = act(&mut tracker, ActionKind::ClearData, "a", t0());
        assert!(matches!(
            first.result,
            TransitionResult::Success(ActionOutcome::ClearPending)
        ));
        assert!(tracker.engine().store().load().unwrap().contains("a"));

        let second = act(
            &mut tracker,
            ActionKind::ClearData,
            "a",
            t0() + Duration::seconds(5),
        );
        assert!(matches!(
            second.result,
            TransitionResult::Success(ActionOutcome::Cleared(ClearOutcome::Cleared))
        ));
        assert_eq!(
            second.message.delete_at,
            Some(t0() + Duration::seconds(10))
        );
        assert!(!tracker.engine().store().load().unwrap().contains("a"));
    }

    #[test]
    fn test_clear_after_timeout_rearms() {
        let mut tracker = tracker();
        act(&mut tracker, ActionKind::BeginSleep, "a", t0());
        act(&mut tracker, ActionKind::ClearData, "a", t0());

        let late = act(
            &mut tracker,
            ActionKind::ClearData,
            "a",
            t0() + Duration::seconds(11),
        );
        assert!(matches!(
            late.result,
            TransitionResult::Success(ActionOutcome::ClearPending)
        ));
        assert!(tracker.engine().store().load().unwrap().contains("a"));
    }

    #[test]
    fn test_clear_without_data_reports_no_data() {
        let mut tracker = tracker();
        act(&mut tracker, ActionKind::ClearData, "a", t0());
        let second = act(&mut tracker, ActionKind::ClearData, "a", t0());
        assert!(matches!(
            second.result,
            TransitionResult::Success(ActionOutcome::Cleared(ClearOutcome::NoData))
        ));
    }

    #[test]
    fn test_clear_for_someone_else_needs_admin() {
        let mut tracker = tracker();
        act(&mut tracker, ActionKind::BeginSleep, "a", t0());

        let clear_as = |actor: &str| UserAction {
            kind: ActionKind::ClearData,
            user_id: "a".into(),
            actor_id: actor.into(),
            now: t0(),
        };

        let denied = tracker.handle_action(&clear_as("b"));
        assert!(matches!(
            denied.result,
            TransitionResult::Conflict(Error::Forbidden { .. })
        ));

        tracker.handle_action(&clear_as("admin"));
        let second = tracker.handle_action(&clear_as("admin"));
        assert!(matches!(
            second.result,
            TransitionResult::Success(ActionOutcome::Cleared(ClearOutcome::Cleared))
        ));
    }

    #[test]
    fn test_due_deletions() {
        let mut tracker = tracker();
        act(&mut tracker, ActionKind::BeginSleep, "a", t0());
        assert!(tracker.due_deletions(t0() + Duration::minutes(1)).is_empty());
        assert_eq!(tracker.due_deletions(t0() + Duration::minutes(2)).len(), 1);
    }

    #[test]
    fn test_presence_through_tracker() {
        let mut tracker = tracker();
        act(&mut tracker, ActionKind::BeginSleep, "a", t0());
        act(&mut tracker, ActionKind::EndSleep, "a", t0() + Duration::hours(8));

        let report = tracker
            .handle_presence(&PresenceEvent {
                user_id: "a".into(),
                went_offline: true,
                now: t0() + Duration::hours(20),
            })
            .unwrap();
        assert_eq!(report.outcome, crate::engine::PresenceOutcome::AutoSlept);
    }
}
