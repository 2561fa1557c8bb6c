use serde::{Deserialize, Serialize};
use sojourn_core::{SojournError, SojournResult};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings for opening a session store.
///
/// ```toml
/// database_path = "./data/sessions.db"
/// lock_timeout_ms = 5000
/// busy_timeout_ms = 5000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite file. `None` keeps the database in memory.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    /// Max wait for a row lock before an append fails as transient.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// SQLite busy handler timeout.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            lock_timeout_ms: default_lock_timeout_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl StoreConfig {
    /// Config for a file-backed database with default timeouts.
    pub fn with_database_path(path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> SojournResult<Self> {
        let config: StoreConfig =
            toml::from_str(s).map_err(|e| SojournError::Config(format!("Invalid store config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML config file.
    pub async fn load(path: &Path) -> SojournResult<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            SojournError::Config(format!(
                "Failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Reject zero lock timeouts and empty paths.
    pub fn validate(&self) -> SojournResult<()> {
        if self.lock_timeout_ms == 0 {
            return Err(SojournError::Config(
                "lock_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if matches!(&self.database_path, Some(p) if p.as_os_str().is_empty()) {
            return Err(SojournError::Config(
                "database_path must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Row lock wait bound.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// SQLite busy handler timeout.
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}
