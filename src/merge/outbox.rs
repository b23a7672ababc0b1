//! Outbox: staged batches deposited by upstream pipelines
//!
//! Layout: `<root>/<pipeline>/experiment_<id>/<table>[.<part>].json`, each
//! file a JSON array of records. A batch's source id is its path relative to
//! the root (`churn/experiment_3/backtest_results.0001.json`), which is also
//! the order batches are merged in.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::OUTBOX_ROOT_ENV;
use crate::guard::MaterializedView;
use crate::merge::StagedBatch;
use crate::store::write_atomic;
use crate::value::Record;
use crate::{Error, Result};

/// Staging directory tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbox {
    root: PathBuf,
}

impl Outbox {
    /// Outbox rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Outbox rooted at `$OUTBOX_ROOT`, falling back to `default_root`.
    #[must_use]
    pub fn from_env(default_root: impl Into<PathBuf>) -> Self {
        std::env::var_os(OUTBOX_ROOT_ENV)
            .filter(|v| !v.is_empty())
            .map_or_else(|| Self::new(default_root), Self::new)
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one experiment's batches for `pipeline`.
    #[must_use]
    pub fn experiment_dir(&self, pipeline: &str, experiment_id: i64) -> PathBuf {
        self.root
            .join(pipeline)
            .join(format!("experiment_{experiment_id}"))
    }

    /// Read every staged batch of an experiment, grouped by target table.
    /// A missing directory yields no batches.
    ///
    /// # Errors
    ///
    /// Returns `InvalidBatch` naming the file if a batch is not a JSON array
    /// of flat records, or `Io` if the directory cannot be read.
    pub fn staged_batches(
        &self,
        pipeline: &str,
        experiment_id: i64,
    ) -> Result<BTreeMap<String, Vec<StagedBatch>>> {
        let dir = self.experiment_dir(pipeline, experiment_id);
        let mut grouped: BTreeMap<String, Vec<StagedBatch>> = BTreeMap::new();
        if !dir.is_dir() {
            tracing::debug!(dir = %dir.display(), "no outbox directory");
            return Ok(grouped);
        }

        let mut files: Vec<PathBuf> = fs::read_dir(&dir)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<std::io::Result<_>>()?;
        files.retain(|p| p.is_file() && p.extension().is_some_and(|e| e == "json"));
        files.sort();

        for path in files {
            let Some(table) = table_name(&path) else {
                continue;
            };
            let source = self.source_id(&path);
            let bytes = fs::read(&path)?;
            let records: Vec<Record> =
                serde_json::from_slice(&bytes).map_err(|e| Error::InvalidBatch {
                    batch: source.clone(),
                    reason: e.to_string(),
                })?;
            tracing::debug!(batch = %source, table = %table, records = records.len(), "staged batch read");
            grouped
                .entry(table)
                .or_default()
                .push(StagedBatch::new(source, records));
        }
        Ok(grouped)
    }

    /// Write every table of `view` to the experiment's outbox directory as
    /// `<table>.json`, each file replaced atomically.
    ///
    /// # Errors
    ///
    /// Returns `Io` if a file cannot be written.
    pub fn export_view(
        &self,
        view: &MaterializedView,
        pipeline: &str,
        experiment_id: i64,
    ) -> Result<Vec<PathBuf>> {
        let dir = self.experiment_dir(pipeline, experiment_id);
        let mut written = Vec::with_capacity(view.len());
        for guarded in view.tables() {
            let path = dir.join(format!("{}.json", guarded.name()));
            let payload = serde_json::to_vec_pretty(guarded.table().records())
                .map_err(|e| Error::InvalidInput(format!("table '{}': {e}", guarded.name())))?;
            write_atomic(&path, &payload)?;
            tracing::info!(
                path = %path.display(),
                rows = guarded.table().len(),
                excluded = guarded.excluded(),
                "guarded table exported"
            );
            written.push(path);
        }
        Ok(written)
    }

    fn source_id(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// `backtest_results.0001.json` → `backtest_results`.
fn table_name(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let table = name.split('.').next()?;
    (!table.is_empty()).then(|| table.to_string())
}
