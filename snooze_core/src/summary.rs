//! All-members status summary.
//!
//! Turns resolved statuses into display rows for every member who has used
//! the tracker, and splits the rendered rows into chunks that fit a chat
//! message field.

use crate::engine::{Reconciler, UserStatus};
use crate::types::anomalous_awake_after;
use crate::{LedgerStore, Result, Timestamp};
use chrono::Duration;
use std::collections::HashMap;

/// Largest text a single summary field may hold
pub const FIELD_CHAR_LIMIT: usize = 1024;

const NO_RECORD: &str = "No record";
const BLOCK_SEPARATOR: &str = "\n\n";

/// Platform presence of a member
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Presence {
    Online,
    Idle,
    DoNotDisturb,
    #[default]
    Offline,
}

impl Presence {
    pub fn icon(self) -> &'static str {
        match self {
            Presence::Online => "🟢",
            Presence::Idle => "🟠",
            Presence::DoNotDisturb => "🔴",
            Presence::Offline => "⚪",
        }
    }
}

/// A server member as the platform reports them
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Member {
    pub user_id: String,
    pub display_name: String,
    pub presence: Presence,
}

impl Member {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>, presence: Presence) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            presence,
        }
    }
}

/// One member's line in the summary
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SummaryRow {
    pub target_user_id: String,
    pub display_name: String,
    pub sleep_icon: &'static str,
    pub status_text: &'static str,
    pub elapsed_display: String,
    pub last_sleep_start_display: String,
    pub last_sleep_end_display: String,
    pub average_display: String,
    pub presence_icon: &'static str,
}

/// Build rows for every member present in the ledger, sorted by name
///
/// Resolving runs the same anomaly healing as any other status read.
pub fn build_summary<S: LedgerStore>(
    engine: &Reconciler<S>,
    members: &[Member],
    now: Timestamp,
) -> Result<Vec<SummaryRow>> {
    let statuses: HashMap<String, UserStatus> = engine
        .resolve_all(now)?
        .into_iter()
        .filter_map(|r| r.status.as_tracked().cloned())
        .map(|s| (s.user_id.clone(), s))
        .collect();

    let mut tracked: Vec<&Member> = members
        .iter()
        .filter(|m| statuses.contains_key(&m.user_id))
        .collect();
    tracked.sort_by_key(|m| m.display_name.to_lowercase());

    Ok(tracked
        .into_iter()
        .filter_map(|m| statuses.get(&m.user_id).map(|s| summary_row(m, s, now)))
        .collect())
}

/// Display row for one resolved member
pub fn summary_row(member: &Member, status: &UserStatus, now: Timestamp) -> SummaryRow {
    let (sleep_icon, status_text) = if status.is_sleeping {
        ("😴", "Sleeping")
    } else {
        ("☀️", "Awake")
    };

    SummaryRow {
        target_user_id: member.user_id.clone(),
        display_name: member.display_name.clone(),
        sleep_icon,
        status_text,
        elapsed_display: elapsed_display(status, now),
        last_sleep_start_display: format_timestamp(status.last_sleep_start, now),
        last_sleep_end_display: format_timestamp(status.last_sleep_end, now),
        average_display: format_average(status.average_sleep_minutes),
        presence_icon: member.presence.icon(),
    }
}

/// "(7h 5m asleep)" / "(2h 0m awake)", or empty when there is nothing to time
fn elapsed_display(status: &UserStatus, now: Timestamp) -> String {
    match (status.is_sleeping, status.state.sleep_start, status.state.sleep_end) {
        (true, Some(start), _) => format!("({} asleep)", format_duration(now - start)),
        (false, _, Some(wake)) if now - wake < anomalous_awake_after() => {
            format!("({} awake)", format_duration(now - wake))
        }
        _ => String::new(),
    }
}

/// Whole hours and leftover minutes, e.g. "7h 5m"
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.num_seconds().max(0);
    format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
}

/// Render in the same zone as `now`
fn format_timestamp(ts: Option<Timestamp>, now: Timestamp) -> String {
    ts.map(|t| t.with_timezone(now.offset()).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| NO_RECORD.to_string())
}

fn format_average(minutes: f64) -> String {
    if minutes > 0.0 {
        let whole = minutes.floor() as i64;
        format!("{}h {}m", whole / 60, whole % 60)
    } else {
        NO_RECORD.to_string()
    }
}

/// Multi-line block for one row
pub fn render_row(row: &SummaryRow) -> String {
    let mut headline = format!("{} {} {}", row.display_name, row.sleep_icon, row.status_text);
    if !row.elapsed_display.is_empty() {
        headline.push(' ');
        headline.push_str(&row.elapsed_display);
    }
    format!(
        "{} {}\n  Went to bed: {}\n  Woke up: {}\n  Average sleep: {}",
        headline,
        row.presence_icon,
        row.last_sleep_start_display,
        row.last_sleep_end_display,
        row.average_display
    )
}

pub fn render_rows(rows: &[SummaryRow]) -> Vec<String> {
    rows.iter().map(render_row).collect()
}

/// Join blocks with blank lines, splitting so no chunk exceeds `limit` chars
///
/// A single block longer than `limit` still gets a chunk of its own.
pub fn chunk_blocks(blocks: &[String], limit: usize) -> Vec<String> {
    if blocks.is_empty() {
        return Vec::new();
    }

    let joined = blocks.join(BLOCK_SEPARATOR);
    if joined.chars().count() <= limit {
        return vec![joined];
    }

    let sep_len = BLOCK_SEPARATOR.chars().count();
    let mut chunks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_len = 0;

    for block in blocks {
        let len = block.chars().count() + sep_len;
        if current_len + len > limit && !current.is_empty() {
            chunks.push(current.join(BLOCK_SEPARATOR));
            current.clear();
            current_len = 0;
        }
        current.push(block);
        current_len += len;
    }
    if !current.is_empty() {
        chunks.push(current.join(BLOCK_SEPARATOR));
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedgerStore;
    use chrono::DateTime;

    fn t0() -> Timestamp {
        DateTime::parse_from_rfc3339("2024-01-15T23:00:00+09:00").unwrap()
    }

    fn engine() -> Reconciler<MemoryLedgerStore> {
        Reconciler::new(MemoryLedgerStore::new())
    }

    #[test]
    fn test_summary_only_lists_tracked_members_sorted() {
        let engine = engine();
        engine.begin_sleep("1", t0()).unwrap();
        engine.begin_sleep("3", t0()).unwrap();

        let members = vec![
            Member::new("1", "zoe", Presence::Offline),
            Member::new("2", "Mallory", Presence::Online),
            Member::new("3", "Alice", Presence::Idle),
        ];

        let rows = build_summary(&engine, &members, t0() + Duration::minutes(65)).unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.target_user_id.as_str()).collect();
        assert_eq!(ids, vec!["3", "1"]);
        assert_eq!(rows[0].presence_icon, "🟠");
        assert_eq!(rows[0].elapsed_display, "(1h 5m asleep)");
        assert_eq!(rows[0].last_sleep_start_display, "2024-01-15 23:00");
        assert_eq!(rows[0].last_sleep_end_display, NO_RECORD);
        assert_eq!(rows[0].average_display, NO_RECORD);
    }

    #[test]
    fn test_summary_row_for_awake_user() {
        let engine = engine();
        engine.begin_sleep("1", t0()).unwrap();
        engine.end_sleep("1", t0() + Duration::minutes(455)).unwrap();

        let members = vec![Member::new("1", "bob", Presence::Online)];
        let now = t0() + Duration::minutes(455 + 130);
        let rows = build_summary(&engine, &members, now).unwrap();

        let row = &rows[0];
        assert_eq!(row.sleep_icon, "☀️");
        assert_eq!(row.status_text, "Awake");
        assert_eq!(row.elapsed_display, "(2h 10m awake)");
        assert_eq!(row.last_sleep_end_display, "2024-01-16 06:35");
        assert_eq!(row.average_display, "7h 35m");
    }

    #[test]
    fn test_summary_heals_stale_sleep() {
        let engine = engine();
        engine.begin_sleep("1", t0()).unwrap();

        let members = vec![Member::new("1", "bob", Presence::Offline)];
        let rows = build_summary(&engine, &members, t0() + Duration::hours(151)).unwrap();
        assert_eq!(rows[0].status_text, "Awake");
        assert_eq!(rows[0].elapsed_display, "");
        assert!(!engine.store().load().unwrap().get_user("1").unwrap().is_sleeping);
    }

    #[test]
    fn test_average_display_floors() {
        assert_eq!(format_average(0.0), NO_RECORD);
        assert_eq!(format_average(450.9), "7h 30m");
        assert_eq!(format_duration(Duration::seconds(3599)), "0h 59m");
    }

    #[test]
    fn test_render_row() {
        let row = SummaryRow {
            target_user_id: "1".into(),
            display_name: "bob".into(),
            sleep_icon: "😴",
            status_text: "Sleeping",
            elapsed_display: "(1h 0m asleep)".into(),
            last_sleep_start_display: "2024-01-15 23:00".into(),
            last_sleep_end_display: NO_RECORD.into(),
            average_display: "7h 0m".into(),
            presence_icon: "⚪",
        };
        let text = render_row(&row);
        assert!(text.starts_with("bob 😴 Sleeping (1h 0m asleep) ⚪\n"));
        assert!(text.ends_with("Average sleep: 7h 0m"));
    }

    #[test]
    fn test_chunking_respects_limit() {
        let blocks: Vec<String> = (0..10).map(|i| format!("{}{}", i, "x".repeat(99))).collect();
        let chunks = chunk_blocks(&blocks, 350);

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 350, "chunk too long: {}", chunk.len());
        }
        let rejoined = chunks.join(BLOCK_SEPARATOR);
        assert_eq!(rejoined, blocks.join(BLOCK_SEPARATOR));
    }

    #[test]
    fn test_chunking_small_input_is_single_chunk() {
        let blocks = vec!["a".to_string(), "b".to_string()];
        assert_eq!(chunk_blocks(&blocks, FIELD_CHAR_LIMIT), vec!["a\n\nb".to_string()]);
        assert!(chunk_blocks(&[], FIELD_CHAR_LIMIT).is_empty());
    }
}
