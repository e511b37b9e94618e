//! YAML configuration for opening a permissions database.
//!
//! ```yaml
//! database: ./permissions.sqlite3
//! busy_timeout_ms: 5000
//! tables:
//!   players: Players
//!   tribes: Tribes
//!   groups: PermissionGroups
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{SqliteStore, TableNames, DEFAULT_BUSY_TIMEOUT};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PermissionsConfig {
    #[serde(default = "default_database")]
    pub database: PathBuf,
    #[serde(default)]
    pub tables: TableNames,
    /// How long a write waits on a locked database before failing.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_database() -> PathBuf {
    PathBuf::from("./permissions.sqlite3")
}

fn default_busy_timeout_ms() -> u64 {
    u64::try_from(DEFAULT_BUSY_TIMEOUT.as_millis()).unwrap_or(5_000)
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            tables: TableNames::default(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl PermissionsConfig {
    /// # Errors
    /// Returns [`ConfigError`] when the file cannot be read, is not valid
    /// YAML, or fails validation.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// # Errors
    /// Returns [`ConfigError`] for invalid YAML or values.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`ConfigError::Validation`] for an empty database path, a zero
    /// busy timeout, or invalid table names.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.as_os_str().is_empty() {
            return Err(ConfigError::Validation("database path is empty".to_string()));
        }
        if self.busy_timeout_ms == 0 {
            return Err(ConfigError::Validation("busy_timeout_ms must be positive".to_string()));
        }
        self.tables.validate().map_err(|err| ConfigError::Validation(err.to_string()))
    }

    #[must_use]
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Open the configured database and create any missing table.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or initialized.
    pub fn open_store(&self) -> anyhow::Result<SqliteStore> {
        let store =
            SqliteStore::open_with_timeout(&self.database, self.tables.clone(), self.busy_timeout())?;
        store.initialize()?;
        Ok(store)
    }
}
