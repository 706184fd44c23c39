//! Engine-wide configuration.

use crate::constants::{DEFAULT_MAX_AGE_DAYS, MAX_WINDOW_AGE_DAYS};
use crate::error::{Result, ThreadError};
use crate::filter::{FilterConfig, FilterPolicy};
use crate::record::BoardId;
use crate::scheduler::Window;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Settings shared by every board, plus per-board filter configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Build reply trees; when false every record is a root child.
    pub threading_enabled: bool,
    /// Show records the junk classifier marked.
    pub show_junk: bool,
    /// Window age used when a board is first opened.
    pub default_max_age_days: u32,
    /// Identities whose records count as self-authored.
    pub self_identities: HashSet<String>,
    /// Filter configuration per board.
    pub boards: HashMap<BoardId, FilterConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threading_enabled: true,
            show_junk: false,
            default_max_age_days: DEFAULT_MAX_AGE_DAYS,
            self_identities: HashSet::new(),
            boards: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Parses and validates a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&json)
    }

    /// Serializes the configuration as pretty-printed JSON.
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.default_max_age_days == 0 {
            return Err(ThreadError::config("default_max_age_days must be at least 1"));
        }
        if self.default_max_age_days > MAX_WINDOW_AGE_DAYS {
            return Err(ThreadError::config(format!(
                "default_max_age_days must not exceed {}",
                MAX_WINDOW_AGE_DAYS
            )));
        }
        Ok(())
    }

    /// Returns the filter configuration of a board, or the default one.
    pub fn filter_for(&self, board: &BoardId) -> FilterConfig {
        self.boards.get(board).cloned().unwrap_or_default()
    }

    /// Combines a board configuration with the engine-wide settings.
    pub fn policy(&self, config: FilterConfig) -> FilterPolicy {
        FilterPolicy {
            config,
            show_junk: self.show_junk,
            self_identities: self.self_identities.clone(),
        }
    }

    /// Returns the window used when no explicit window was requested.
    pub fn default_window(&self) -> Window {
        Window::days(self.default_max_age_days)
    }
}
