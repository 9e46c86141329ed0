//! Recovery and environment configuration.
//!
//! This module loads the settings that control how an environment is opened
//! and recovered from environment variables.
//!
//! # Environment Variables
//!
//! - `TREELOG_ENVIRONMENT_PATH`: Environment file to open (default: `./data/treelog.db`)
//! - `TREELOG_CHECKPOINT_SCAN_LIMIT`: Records to inspect while looking for a
//!   checkpoint, 0 for no limit (default: `0`)
//! - `TREELOG_ALLOW_PARTIAL_RECOVERY`: Excise damaged subtrees instead of
//!   failing (default: `false`)
//! - `TREELOG_CHECKPOINT_AFTER_RECOVERY`: Take a checkpoint once recovery
//!   succeeds (default: `true`)
//!
//! # Invariants
//!
//! - Boolean settings only accept `true` or `false` (trimmed, any case)
//! - `checkpoint_scan_limit` is a non-negative integer

use std::path::PathBuf;

/// Settings for one recovery run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryConfig {
    /// Maximum number of records the checkpoint search inspects before
    /// falling back to recovery from the start of the log. 0 means no limit.
    pub checkpoint_scan_limit: u64,
    /// Excise subtrees that cannot be applied or validated instead of
    /// failing. Corrupt logs and conflicting roots stay fatal.
    pub allow_partial_recovery: bool,
    /// Take a checkpoint after a successful recovery.
    pub checkpoint_after_recovery: bool,
}

/// Where the environment lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentConfig {
    /// Path of the environment file. The log sits next to it.
    pub path: PathBuf,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

const CHECKPOINT_SCAN_LIMIT_VAR: &str = "TREELOG_CHECKPOINT_SCAN_LIMIT";
const ALLOW_PARTIAL_RECOVERY_VAR: &str = "TREELOG_ALLOW_PARTIAL_RECOVERY";
const CHECKPOINT_AFTER_RECOVERY_VAR: &str = "TREELOG_CHECKPOINT_AFTER_RECOVERY";
const ENVIRONMENT_PATH_VAR: &str = "TREELOG_ENVIRONMENT_PATH";

impl RecoveryConfig {
    /// Default checkpoint scan limit (unbounded).
    pub const DEFAULT_CHECKPOINT_SCAN_LIMIT: u64 = 0;
    /// Default partial recovery setting.
    pub const DEFAULT_ALLOW_PARTIAL_RECOVERY: bool = false;
    /// Default post-recovery checkpoint setting.
    pub const DEFAULT_CHECKPOINT_AFTER_RECOVERY: bool = true;

    /// Load configuration from environment variables.
    ///
    /// Unset variables fall back to the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to a value that does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let checkpoint_scan_limit = Self::load_scan_limit(lookup(CHECKPOINT_SCAN_LIMIT_VAR))?;
        let allow_partial_recovery = load_bool(
            ALLOW_PARTIAL_RECOVERY_VAR,
            lookup(ALLOW_PARTIAL_RECOVERY_VAR),
            Self::DEFAULT_ALLOW_PARTIAL_RECOVERY,
        )?;
        let checkpoint_after_recovery = load_bool(
            CHECKPOINT_AFTER_RECOVERY_VAR,
            lookup(CHECKPOINT_AFTER_RECOVERY_VAR),
            Self::DEFAULT_CHECKPOINT_AFTER_RECOVERY,
        )?;

        Ok(Self {
            checkpoint_scan_limit,
            allow_partial_recovery,
            checkpoint_after_recovery,
        })
    }

    /// Parse the scan limit.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is set but not a non-negative integer.
    fn load_scan_limit(value: Option<String>) -> Result<u64, ConfigError> {
        match value {
            Some(value) => value
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidValue {
                    name: CHECKPOINT_SCAN_LIMIT_VAR.to_string(),
                    message: format!("'{value}' is not a non-negative integer"),
                }),
            None => Ok(Self::DEFAULT_CHECKPOINT_SCAN_LIMIT),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            checkpoint_scan_limit: Self::DEFAULT_CHECKPOINT_SCAN_LIMIT,
            allow_partial_recovery: Self::DEFAULT_ALLOW_PARTIAL_RECOVERY,
            checkpoint_after_recovery: Self::DEFAULT_CHECKPOINT_AFTER_RECOVERY,
        }
    }
}

impl EnvironmentConfig {
    /// Default environment file.
    pub const DEFAULT_PATH: &'static str = "./data/treelog.db";

    /// Load configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            path: Self::load_path(std::env::var(ENVIRONMENT_PATH_VAR).ok()),
        }
    }

    /// Returns the default if not set.
    fn load_path(value: Option<String>) -> PathBuf {
        value
            .filter(|path| !path.is_empty())
            .map_or_else(|| PathBuf::from(Self::DEFAULT_PATH), PathBuf::from)
    }
}

/// Parse a `true`/`false` setting, falling back to `default` when unset.
fn load_bool(name: &str, value: Option<String>, default: bool) -> Result<bool, ConfigError> {
    let Some(value) = value else {
        return Ok(default);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            name: name.to_string(),
            message: format!("'{value}' is not a boolean (expected true or false)"),
        }),
    }
}
