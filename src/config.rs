//! Store configuration
//!
//! Loaded from a JSON file (every field optional) with environment overrides:
//! `CHURN_STORE_PATH` replaces the document path and `OUTBOX_ROOT` the outbox
//! root.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Environment variable overriding [`StoreConfig::document_path`].
pub const DOCUMENT_PATH_ENV: &str = "CHURN_STORE_PATH";

/// Environment variable overriding [`StoreConfig::outbox_root`].
pub const OUTBOX_ROOT_ENV: &str = "OUTBOX_ROOT";

/// Whether foreign-key orphans block writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForeignKeyPolicy {
    /// Orphans are reported by `validate_foreign_keys` only
    #[default]
    Diagnostic,
    /// Writes that leave an orphan in the written table fail with `ForeignKeyOrphan`
    Enforce,
}

/// Table store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Persisted document
    pub document_path: PathBuf,
    /// Root of the staged-batch outbox
    pub outbox_root: PathBuf,
    /// Persist every successful write before publishing it
    pub autosave: bool,
    /// Copy the previous document aside before each save
    pub snapshot_on_save: bool,
    /// Snapshots retained after rotation
    pub max_snapshots: usize,
    /// Bounded wait for the document lock
    pub lock_timeout_ms: u64,
    /// Ceiling for a delegated SQL query
    pub query_timeout_ms: u64,
    /// Foreign-key enforcement on the write path
    pub foreign_keys: ForeignKeyPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            document_path: PathBuf::from("dynamic_system_outputs/churn_database.json"),
            outbox_root: PathBuf::from("dynamic_system_outputs/outbox"),
            autosave: true,
            snapshot_on_save: false,
            max_snapshots: 10,
            lock_timeout_ms: 30_000,
            query_timeout_ms: 60_000,
            foreign_keys: ForeignKeyPolicy::Diagnostic,
        }
    }
}

impl StoreConfig {
    /// Load a JSON config file and apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the file cannot be read or parsed.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Ok(config.with_env_overrides())
    }

    /// Defaults with environment overrides applied.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `CHURN_STORE_PATH` / `OUTBOX_ROOT` if set and non-empty.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(path) = env_path(DOCUMENT_PATH_ENV) {
            self.document_path = path;
        }
        if let Some(root) = env_path(OUTBOX_ROOT_ENV) {
            self.outbox_root = root;
        }
        self
    }

    /// Lock wait budget.
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Query ceiling.
    #[must_use]
    pub const fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var_os(name)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}
