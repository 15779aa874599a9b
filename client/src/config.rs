//! Configuration management for the sync client.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Client configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Quiet interval before a burst of content edits is sent
    pub edit_debounce: Duration,
    /// Short delay for flag changes (pin, markdown, trash...)
    pub flag_delay: Duration,
    /// Quiet interval before the sync state is written to disk
    pub persist_delay: Duration,
    /// JSON snapshot location; state is not persisted when unset
    pub state_path: Option<PathBuf>,
    /// Add a welcome note on start
    pub welcome_note: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            edit_debounce: Duration::from_millis(2000),
            flag_delay: Duration::from_millis(10),
            persist_delay: Duration::from_millis(100),
            state_path: None,
            welcome_note: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let millis = |key: &'static str, default: Duration| match lookup(key) {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| ConfigError::InvalidDuration { key, value: raw }),
            None => Ok(default),
        };

        let welcome_note = match lookup("NOTESYNC_WELCOME_NOTE") {
            Some(raw) => match raw.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" | "" => false,
                _ => {
                    return Err(ConfigError::InvalidBool {
                        key: "NOTESYNC_WELCOME_NOTE",
                        value: raw,
                    })
                }
            },
            None => defaults.welcome_note,
        };

        Ok(Self {
            edit_debounce: millis("NOTESYNC_EDIT_DEBOUNCE_MS", defaults.edit_debounce)?,
            flag_delay: millis("NOTESYNC_FLAG_DELAY_MS", defaults.flag_delay)?,
            persist_delay: millis("NOTESYNC_PERSIST_DELAY_MS", defaults.persist_delay)?,
            state_path: lookup("NOTESYNC_STATE_PATH")
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
            welcome_note,
        })
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} must be a number of milliseconds, got '{value}'")]
    InvalidDuration { key: &'static str, value: String },

    #[error("{key} must be true or false, got '{value}'")]
    InvalidBool { key: &'static str, value: String },
}
