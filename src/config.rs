// src/config.rs

//! Front end configuration
//!
//! Loaded from TOML. Repository order in the file is resolution priority and
//! is never re-sorted. Unknown keys are rejected.
//!
//! ```toml
//! db_path = "/var/lib/pacman"
//! diagnostic_log = "/tmp/pacflow-engine.log"
//!
//! [events]
//! capacity = 256
//! drain_timeout_secs = 30
//!
//! [exclusive]
//! repository = "desktop"
//! groups = ["cinnamon", "mate", "mate-extra"]
//!
//! [[repository]]
//! name = "core"
//! ```

use crate::error::{Error, Result};
use crate::transaction::TransactionOptions;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Default package database directory
pub const DEFAULT_DB_PATH: &str = "/var/lib/pacman";

/// Default number of events buffered between engine and consumer
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Default time to wait for the consumer to drain the queue on a fatal error
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Raw engine log; disabled when unset
    #[serde(default)]
    pub diagnostic_log: Option<PathBuf>,

    #[serde(default)]
    pub events: EventConfig,

    /// Packages that must come from one designated repository
    #[serde(default)]
    pub exclusive: Option<ExclusiveSource>,

    /// Options applied when a caller does not pass its own
    #[serde(default)]
    pub options: TransactionOptions,

    /// Sync repositories in priority order
    #[serde(default, rename = "repository")]
    pub repositories: Vec<RepositoryConfig>,
}

/// Event channel sizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EventConfig {
    pub capacity: usize,
    pub drain_timeout_secs: u64,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_EVENT_CAPACITY,
            drain_timeout_secs: DEFAULT_DRAIN_TIMEOUT_SECS,
        }
    }
}

impl EventConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// A sync repository definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepositoryConfig {
    pub name: String,
}

impl RepositoryConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
        }
    }
}

/// Exclusive-source rule
///
/// Members of `groups`, as defined by `repository`, resolve only from
/// `repository` regardless of priority order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExclusiveSource {
    pub repository: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(DEFAULT_DB_PATH)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            diagnostic_log: None,
            events: EventConfig::default(),
            exclusive: None,
            options: TransactionOptions::default(),
            repositories: Vec::new(),
        }
    }
}

impl Config {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::Config(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }

        debug!("Loading configuration from {}", path.display());
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.repositories.is_empty() {
            return Err(Error::Config("No repositories configured".to_string()));
        }

        let mut seen = HashSet::new();
        for repo in &self.repositories {
            if repo.name.trim().is_empty() {
                return Err(Error::Config("Repository with an empty name".to_string()));
            }
            if !seen.insert(repo.name.as_str()) {
                return Err(Error::Config(format!(
                    "Repository {} is defined more than once",
                    repo.name
                )));
            }
        }

        if self.events.capacity == 0 {
            return Err(Error::Config(
                "Event queue capacity must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Repository names in priority order
    pub fn repository_order(&self) -> Vec<&str> {
        self.repositories.iter().map(|r| r.name.as_str()).collect()
    }
}
