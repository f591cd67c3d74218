#![forbid(unsafe_code)]

//! Core domain model and business logic for the Snooze sleep tracker.
//!
//! This crate provides:
//! - Domain types (sleep records, per-user state, the ledger)
//! - Ledger persistence (atomic JSON document with file locking)
//! - The reconciliation engine (status resolution, transitions, presence)
//! - All-members summary rendering
//! - UI-session state and event dispatch for front ends

pub mod types;
pub mod error;
pub mod config;
pub mod logging;
pub mod ledger;
pub mod engine;
pub mod summary;
pub mod session;
pub mod events;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;
pub use config::Config;
pub use ledger::{JsonLedgerStore, LedgerStore, MemoryLedgerStore};
pub use engine::{
    resolve_in_place, Actor, ClearOutcome, Correction, PresenceOutcome, PresenceReport,
    Reconciler, Resolution, ResolvedStatus, SleepStatus, Transition, TransitionKind, UserStatus,
};
pub use summary::{build_summary, Member, Presence, SummaryRow};
pub use events::{ActionKind, ActionOutcome, PresenceEvent, Tracker, TransitionResult, UserAction};
