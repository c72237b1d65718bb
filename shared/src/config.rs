//! # Configuration for the Local DID Record Store
//!
//! This module handles configuration loading and validation,
//! supporting both environment variables and serialized configuration.
//! It also owns the on-disk layout: every path the store touches is
//! derived here from the root directory.

use crate::constants::*;
use crate::error::{StoreError, StoreResult};
use crate::types::RecordStatus;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

// =============================================================================
// STORE CONFIGURATION
// =============================================================================

/// Configuration for a record store rooted at one directory
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    /// Root directory (`~/.dids` by default)
    pub root_dir: PathBuf,

    /// DID method documents are generated for
    pub method: String,

    /// Ledger mode (e.g. "test", "live", "dev")
    pub mode: String,

    /// Locking policy
    pub lock: LockConfig,

    /// Ledger registrar configuration
    pub ledger: LedgerConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let root_dir = dirs::home_dir()
            .map(|home| home.join(DEFAULT_STORE_DIR))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_DIR));

        Self {
            root_dir,
            method: DEFAULT_METHOD.into(),
            mode: DEFAULT_MODE.into(),
            lock: LockConfig::default(),
            ledger: LedgerConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Create a configuration rooted at `root_dir` with default policy
    pub fn with_root(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> StoreResult<Self> {
        let mut config = Self::default();

        if let Ok(home) = env::var(ENV_STORE_HOME) {
            config.root_dir = PathBuf::from(home);
        }

        if let Ok(method) = env::var(ENV_METHOD) {
            config.method = method;
        }

        if let Ok(mode) = env::var(ENV_MODE) {
            config.mode = mode;
        }

        if let Ok(endpoint) = env::var(ENV_LEDGER_ENDPOINT) {
            config.ledger.endpoint = Some(endpoint);
        }

        if let Ok(host) = env::var(ENV_LEDGER_HOST) {
            config.ledger.host = Some(host);
        }

        if let Some(retries) = parse_env(ENV_LOCK_RETRIES)? {
            config.lock.retries = retries;
        }

        if let Some(delay) = parse_env(ENV_LOCK_RETRY_MS)? {
            config.lock.retry_delay_ms = delay;
        }

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> StoreResult<()> {
        if self.method.is_empty()
            || !self
                .method
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        {
            return Err(StoreError::Configuration(format!(
                "method '{}' must be lowercase letters and digits",
                self.method
            )));
        }

        if self.mode.is_empty() || self.mode.starts_with('.') || self.mode.contains(['/', '\\']) {
            return Err(StoreError::Configuration(format!(
                "mode '{}' is not a valid directory name",
                self.mode
            )));
        }

        self.lock.validate()?;

        Ok(())
    }

    // =========================================================================
    // PATHS
    // =========================================================================

    /// Directory holding documents of one status for this method/mode
    pub fn documents_dir(&self, status: RecordStatus) -> PathBuf {
        documents_dir(&self.root_dir, &self.method, &self.mode, status)
    }

    /// Directory holding key material
    pub fn keys_dir(&self) -> PathBuf {
        self.root_dir.join(KEYS_DIR)
    }

    /// Directory holding metadata
    pub fn meta_dir(&self) -> PathBuf {
        self.root_dir.join(META_DIR)
    }

    /// Directory holding lock files
    pub fn locks_dir(&self) -> PathBuf {
        self.root_dir.join(LOCKS_DIR)
    }

    /// Path of the notes/config document
    pub fn config_path(&self) -> PathBuf {
        self.root_dir.join(CONFIG_FILE_NAME)
    }

    /// `<method>:<mode>` label recorded in the `ledger` note
    pub fn ledger_label(&self) -> String {
        format!("{}:{}", self.method, self.mode)
    }
}

/// Directory holding documents of one status for any method/mode
pub fn documents_dir(root: &Path, method: &str, mode: &str, status: RecordStatus) -> PathBuf {
    root.join(method_mode_dir(method, mode)).join(status.dir_name())
}

fn parse_env<T: FromStr>(name: &str) -> StoreResult<Option<T>> {
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| StoreError::Configuration(format!("{} has invalid value '{}'", name, value))),
        Err(_) => Ok(None),
    }
}

// =============================================================================
// LOCK CONFIGURATION
// =============================================================================

/// Lock retry policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockConfig {
    /// Maximum attempts before `LockTimeout`
    pub retries: u32,

    /// Delay between attempts in milliseconds
    pub retry_delay_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            retries: LOCK_RETRIES,
            retry_delay_ms: LOCK_RETRY_DELAY_MS,
        }
    }
}

impl LockConfig {
    /// Delay between attempts
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Validate lock policy
    pub fn validate(&self) -> StoreResult<()> {
        if self.retries == 0 {
            return Err(StoreError::Configuration(
                "lock retries must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// LEDGER CONFIGURATION
// =============================================================================

/// Ledger registrar configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerConfig {
    /// Base URL of the registrar (`None` disables remote operations)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Host recorded in `publishedHost` (defaults to the endpoint's host)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}
