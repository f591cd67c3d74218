//! Configuration file support for Snooze.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/snooze/config.toml`, or from
//! the file named by `SNOOZE_CONFIG` when that variable is set.

use crate::{Error, Result};
use chrono::{Duration, FixedOffset};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable that overrides the config file location
pub const CONFIG_ENV_VAR: &str = "SNOOZE_CONFIG";

/// File name of the ledger inside the data directory
pub const LEDGER_FILE_NAME: &str = "sleep_data.json";

/// Longest any UI timer may run
pub const MAX_UI_DELAY_SECS: i64 = 24 * 60 * 60;

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub clock: ClockConfig,

    #[serde(default)]
    pub access: AccessConfig,

    #[serde(default)]
    pub ui: UiConfig,
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// The single fixed zone every timestamp is normalised to
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClockConfig {
    #[serde(default = "default_utc_offset_minutes")]
    pub utc_offset_minutes: i32,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: default_utc_offset_minutes(),
        }
    }
}

/// Actors allowed to override other users' status
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct AccessConfig {
    #[serde(default)]
    pub admins: Vec<String>,
}

/// Timings for UI-session state
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UiConfig {
    #[serde(default = "default_clear_confirm_secs")]
    pub clear_confirm_secs: i64,

    #[serde(default = "default_transient_message_secs")]
    pub transient_message_secs: i64,

    #[serde(default = "default_clear_result_secs")]
    pub clear_result_secs: i64,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            clear_confirm_secs: default_clear_confirm_secs(),
            transient_message_secs: default_transient_message_secs(),
            clear_result_secs: default_clear_result_secs(),
        }
    }
}

/// Out-of-range values are clamped; `Config::validate` rejects them up front
fn ui_delay(secs: i64) -> Duration {
    Duration::seconds(secs.clamp(0, MAX_UI_DELAY_SECS))
}

impl UiConfig {
    pub fn clear_confirm_window(&self) -> Duration {
        ui_delay(self.clear_confirm_secs)
    }

    pub fn transient_message_delay(&self) -> Duration {
        ui_delay(self.transient_message_secs)
    }

    pub fn clear_result_delay(&self) -> Duration {
        ui_delay(self.clear_result_secs)
    }
}

// Default value functions
fn default_data_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| {
        std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(".local/share"))
            .unwrap_or_else(|| PathBuf::from("."))
    });
    base.join("snooze")
}

fn default_utc_offset_minutes() -> i32 {
    9 * 60
}

fn default_clear_confirm_secs() -> i64 {
    10
}

fn default_transient_message_secs() -> i64 {
    120
}

fn default_clear_result_secs() -> i64 {
    5
}

impl Config {
    /// Load configuration from `SNOOZE_CONFIG` or the standard config path
    pub fn load() -> Result<Self> {
        let config_path = std::env::var_os(CONFIG_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(Self::default_config_path);
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::info!(
                "No config file found at {:?}, using defaults",
                config_path
            );
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(|home| PathBuf::from(home).join(".config"))
                .unwrap_or_else(|| PathBuf::from("."))
        });
        base.join("snooze").join("config.toml")
    }

    /// Check values that serde cannot
    pub fn validate(&self) -> Result<()> {
        self.zone()?;
        if self.ui.clear_confirm_secs <= 0 || self.ui.clear_confirm_secs > MAX_UI_DELAY_SECS {
            return Err(Error::Config(format!(
                "ui.clear_confirm_secs must be between 1 and {}",
                MAX_UI_DELAY_SECS
            )));
        }
        for (name, secs) in [
            ("ui.transient_message_secs", self.ui.transient_message_secs),
            ("ui.clear_result_secs", self.ui.clear_result_secs),
        ] {
            if !(0..=MAX_UI_DELAY_SECS).contains(&secs) {
                return Err(Error::Config(format!(
                    "{} must be between 0 and {}",
                    name, MAX_UI_DELAY_SECS
                )));
            }
        }
        Ok(())
    }

    /// The fixed zone all timestamps are normalised to
    pub fn zone(&self) -> Result<FixedOffset> {
        self.clock
            .utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| {
                Error::Config(format!(
                    "clock.utc_offset_minutes {} is outside ±24h",
                    self.clock.utc_offset_minutes
                ))
            })
    }

    /// Location of the ledger document
    pub fn ledger_path(&self) -> PathBuf {
        self.data.data_dir.join(LEDGER_FILE_NAME)
    }

    pub fn is_admin(&self, actor_id: &str) -> bool {
        self.access.admins.iter().any(|a| a == actor_id)
    }
}
