//! Error types for the snooze_core library.

use std::io;
use std::path::PathBuf;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for snooze_core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Ledger file exists but its content is not a well-formed ledger
    #[error("Ledger at {path:?} is corrupted: {reason}")]
    StorageCorruption { path: PathBuf, reason: String },

    /// Sleep was requested for a user who is already asleep
    #[error("User {user_id} is already sleeping")]
    AlreadySleeping { user_id: String },

    /// Wake was requested for a user who is not asleep
    #[error("User {user_id} is not sleeping")]
    NotSleeping { user_id: String },

    /// Admin override received something other than "sleep" or "wake"
    #[error("Invalid status value {0:?}: expected \"sleep\" or \"wake\"")]
    InvalidStatusValue(String),

    /// Caller lacks the privilege required for an override
    #[error("Actor {actor_id} is not allowed to change other users' status")]
    Forbidden { actor_id: String },

    /// A session would end before it started (clock went backwards)
    #[error("Sleep cannot end at {end} before it started at {start}")]
    EndBeforeStart { start: String, end: String },

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for errors caused by the user's current state or input rather
    /// than by storage or the environment.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::AlreadySleeping { .. }
                | Error::NotSleeping { .. }
                | Error::InvalidStatusValue(_)
                | Error::Forbidden { .. }
                | Error::EndBeforeStart { .. }
        )
    }
}
