//! Core domain types for sleep tracking.
//!
//! - `SleepRecord`: one completed sleep session
//! - `UserSleepState`: current state plus history for a single user
//! - `Ledger`: every tracked user, keyed by platform user id
//!
//! Everything here is pure data. Loading and saving live in [`crate::ledger`],
//! and the rules that move users between states live in [`crate::engine`].

use crate::{Error, Result};
use chrono::{DateTime, Duration, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// All timestamps carry an explicit offset and are normalised to one zone
pub type Timestamp = DateTime<FixedOffset>;

/// Sessions this long or longer are kept but never averaged
pub const OUTLIER_RECORD_MINUTES: i64 = 200 * 60;

/// A sleep still open after this long is closed automatically
pub fn anomalous_sleep_after() -> Duration {
    Duration::hours(150)
}

/// A wake time older than this is forgotten
pub fn anomalous_awake_after() -> Duration {
    Duration::hours(200)
}

/// Current wall-clock time in `zone`
pub fn now_in(zone: &FixedOffset) -> Timestamp {
    Utc::now().with_timezone(zone)
}

/// Parse an RFC 3339 timestamp and move it into `zone`
pub fn parse_timestamp(s: &str, zone: &FixedOffset) -> Result<Timestamp> {
    DateTime::parse_from_rfc3339(s.trim())
        .map(|t| t.with_timezone(zone))
        .map_err(|e| Error::Other(format!("Invalid timestamp {:?}: {}", s, e)))
}

/// Whole minutes between two instants, truncated
pub fn minutes_between(start: Timestamp, end: Timestamp) -> i64 {
    (end - start).num_minutes()
}

// ============================================================================
// Sleep Records
// ============================================================================

/// A completed sleep session
///
/// `duration_minutes` is fixed when the record is created and never
/// recomputed from the timestamps.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SleepRecord {
    pub sleep_start: Timestamp,
    pub sleep_end: Timestamp,
    pub duration_minutes: i64,
}

impl SleepRecord {
    /// Close a session that ran from `sleep_start` to `sleep_end`
    pub fn new(sleep_start: Timestamp, sleep_end: Timestamp) -> Result<Self> {
        if sleep_end < sleep_start {
            return Err(Error::EndBeforeStart {
                start: sleep_start.to_rfc3339(),
                end: sleep_end.to_rfc3339(),
            });
        }
        Ok(Self {
            sleep_start,
            sleep_end,
            duration_minutes: minutes_between(sleep_start, sleep_end),
        })
    }

    /// Records of 200 hours or more are anomalies
    pub fn is_outlier(&self) -> bool {
        self.duration_minutes >= OUTLIER_RECORD_MINUTES
    }
}

// ============================================================================
// Per-user State
// ============================================================================

/// Current sleep state and history for one user
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct UserSleepState {
    #[serde(default)]
    pub is_sleeping: bool,

    /// Present iff `is_sleeping`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sleep_start: Option<Timestamp>,

    /// Last wake time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sleep_end: Option<Timestamp>,

    /// Append-only, oldest first
    #[serde(default)]
    pub sleep_records: Vec<SleepRecord>,
}

impl UserSleepState {
    /// Records that count toward the average
    pub fn valid_records(&self) -> impl Iterator<Item = &SleepRecord> {
        self.sleep_records.iter().filter(|r| !r.is_outlier())
    }

    /// Mean duration of non-outlier records, or zero without any
    pub fn average_sleep_minutes(&self) -> f64 {
        let (total, count) = self
            .valid_records()
            .fold((0i64, 0usize), |(total, count), r| {
                (total + r.duration_minutes, count + 1)
            });
        if count == 0 {
            0.0
        } else {
            total as f64 / count as f64
        }
    }

    pub fn latest_valid_record(&self) -> Option<&SleepRecord> {
        self.valid_records().last()
    }

    /// Start sleeping at `now`
    pub(crate) fn fall_asleep(&mut self, now: Timestamp) {
        self.is_sleeping = true;
        self.sleep_start = Some(now);
    }

    /// Close the open session at `now` and return the new record
    ///
    /// `record_wake` controls whether `sleep_end` moves to `now`. Anomaly
    /// correction closes the session without recording a wake time.
    pub(crate) fn close_session(&mut self, now: Timestamp, record_wake: bool) -> Result<SleepRecord> {
        let start = self.sleep_start.ok_or_else(|| {
            Error::Other("open sleep session has no start time".into())
        })?;
        let record = SleepRecord::new(start, now)?;
        self.sleep_records.push(record.clone());
        self.is_sleeping = false;
        self.sleep_start = None;
        if record_wake {
            self.sleep_end = Some(now);
        }
        Ok(record)
    }

    fn normalize(&mut self, zone: &FixedOffset) {
        self.sleep_start = self.sleep_start.map(|t| t.with_timezone(zone));
        self.sleep_end = self.sleep_end.map(|t| t.with_timezone(zone));
        for record in &mut self.sleep_records {
            record.sleep_start = record.sleep_start.with_timezone(zone);
            record.sleep_end = record.sleep_end.with_timezone(zone);
        }
    }

    /// Describe the first broken invariant, if any
    fn check_invariants(&self) -> std::result::Result<(), String> {
        match (self.is_sleeping, self.sleep_start.is_some()) {
            (true, false) => return Err("is_sleeping without sleep_start".into()),
            (false, true) => return Err("sleep_start set while awake".into()),
            _ => {}
        }
        for (i, record) in self.sleep_records.iter().enumerate() {
            if record.sleep_end < record.sleep_start {
                return Err(format!("record {} ends before it starts", i));
            }
            if record.duration_minutes < 0 {
                return Err(format!("record {} has a negative duration", i));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Ledger
// ============================================================================

/// Every tracked user, keyed by platform user id
///
/// Serialises as a bare JSON object so the on-disk document is the
/// mapping itself.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct Ledger {
    users: BTreeMap<String, UserSleepState>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_user(&self, user_id: &str) -> Option<&UserSleepState> {
        self.users.get(user_id)
    }

    pub fn get_user_mut(&mut self, user_id: &str) -> Option<&mut UserSleepState> {
        self.users.get_mut(user_id)
    }

    /// Fetch a user's state, creating an empty entry if they are untracked
    pub fn entry(&mut self, user_id: &str) -> &mut UserSleepState {
        self.users.entry(user_id.to_string()).or_default()
    }

    pub fn upsert_user(&mut self, user_id: impl Into<String>, state: UserSleepState) {
        self.users.insert(user_id.into(), state);
    }

    /// Remove a user and all of their history
    ///
    /// Returns `false` when the user was not tracked.
    pub fn delete_user(&mut self, user_id: &str) -> bool {
        self.users.remove(user_id).is_some()
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.users.contains_key(user_id)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Tracked users in id order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &UserSleepState)> {
        self.users.iter().map(|(id, state)| (id.as_str(), state))
    }

    /// Shift every timestamp into `zone` without changing the instants
    pub fn normalize(&mut self, zone: &FixedOffset) {
        for state in self.users.values_mut() {
            state.normalize(zone);
        }
    }

    /// Check the per-user invariants, naming the offending user on failure
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        for (user_id, state) in &self.users {
            state
                .check_invariants()
                .map_err(|reason| format!("user {}: {}", user_id, reason))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jst() -> FixedOffset {
        FixedOffset::east_opt(9 * 3600).unwrap()
    }

    fn at(s: &str) -> Timestamp {
        DateTime::parse_from_rfc3339(s).unwrap()
    }

    fn record(start: &str, minutes: i64) -> SleepRecord {
        let start = at(start);
        SleepRecord::new(start, start + Duration::minutes(minutes)).unwrap()
    }

    #[test]
    fn test_parse_timestamp_normalizes() {
        let t = parse_timestamp("2024-01-15T14:00:00Z", &jst()).unwrap();
        assert_eq!(t.to_rfc3339(), "2024-01-15T23:00:00+09:00");
        assert!(parse_timestamp("yesterday", &jst()).is_err());
    }

    #[test]
    fn test_record_duration_truncates() {
        let start = at("2024-01-15T23:00:00+09:00");
        let end = start + Duration::seconds(7 * 3600 + 59);
        let record = SleepRecord::new(start, end).unwrap();
        assert_eq!(record.duration_minutes, 420);
    }

    #[test]
    fn test_record_rejects_reversed_range() {
        let start = at("2024-01-15T23:00:00+09:00");
        let result = SleepRecord::new(start, start - Duration::minutes(1));
        assert!(matches!(result, Err(Error::EndBeforeStart { .. })));
    }

    #[test]
    fn test_average_ignores_outliers() {
        let mut state = UserSleepState::default();
        state.sleep_records.push(record("2024-01-01T23:00:00+09:00", 420));
        state.sleep_records.push(record("2024-01-02T23:00:00+09:00", 480));
        assert_eq!(state.average_sleep_minutes(), 450.0);

        state
            .sleep_records
            .push(record("2024-01-03T23:00:00+09:00", OUTLIER_RECORD_MINUTES));
        assert_eq!(state.average_sleep_minutes(), 450.0);
        assert_eq!(state.sleep_records.len(), 3);
        assert_eq!(state.latest_valid_record().unwrap().duration_minutes, 480);
    }

    #[test]
    fn test_average_is_zero_without_valid_records() {
        let mut state = UserSleepState::default();
        assert_eq!(state.average_sleep_minutes(), 0.0);

        state
            .sleep_records
            .push(record("2024-01-01T23:00:00+09:00", OUTLIER_RECORD_MINUTES + 5));
        assert_eq!(state.average_sleep_minutes(), 0.0);
        assert!(state.latest_valid_record().is_none());
    }

    #[test]
    fn test_ledger_user_operations() {
        let mut ledger = Ledger::new();
        assert!(ledger.get_user("1").is_none());

        let mut state = UserSleepState::default();
        state.fall_asleep(at("2024-01-15T23:00:00+09:00"));
        ledger.upsert_user("1", state.clone());

        assert_eq!(ledger.get_user("1"), Some(&state));
        assert!(ledger.delete_user("1"));
        assert!(!ledger.delete_user("1"));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_ledger_serializes_as_plain_mapping() {
        let mut ledger = Ledger::new();
        ledger.upsert_user("123", UserSleepState::default());

        let json = serde_json::to_value(&ledger).unwrap();
        assert!(json.get("123").is_some());
        assert_eq!(json["123"]["is_sleeping"], false);
        assert!(json["123"].get("sleep_start").is_none());
    }

    #[test]
    fn test_parses_python_isoformat_documents() {
        let json = r#"{
            "42": {
                "sleep_records": [
                    {
                        "sleep_start": "2024-01-15T23:10:05.123456+09:00",
                        "sleep_end": "2024-01-16T07:00:00.000001+09:00",
                        "duration_minutes": 469
                    }
                ],
                "is_sleeping": false,
                "sleep_end": "2024-01-16T07:00:00.000001+09:00"
            }
        }"#;
        let ledger: Ledger = serde_json::from_str(json).unwrap();
        let user = ledger.get_user("42").unwrap();
        assert_eq!(user.sleep_records[0].duration_minutes, 469);
        assert!(ledger.check_invariants().is_ok());
    }

    #[test]
    fn test_normalize_keeps_instants() {
        let mut ledger = Ledger::new();
        let mut state = UserSleepState::default();
        let utc_start = at("2024-01-15T14:00:00+00:00");
        state.fall_asleep(utc_start);
        ledger.upsert_user("1", state);

        ledger.normalize(&jst());
        let start = ledger.get_user("1").unwrap().sleep_start.unwrap();
        assert_eq!(start, utc_start);
        assert_eq!(start.offset(), &jst());
        assert_eq!(start.to_rfc3339(), "2024-01-15T23:00:00+09:00");
    }

    #[test]
    fn test_invariant_violations_are_reported() {
        let mut ledger = Ledger::new();
        ledger.upsert_user(
            "7",
            UserSleepState {
                is_sleeping: true,
                ..Default::default()
            },
        );
        let err = ledger.check_invariants().unwrap_err();
        assert!(err.contains("user 7"));
    }
}
