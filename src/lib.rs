//! # churn-store: Leakage-Guarded Analytical Store for Churn Pipelines
//!
//! churn-store keeps every table of a churn / survival analysis pipeline in
//! one JSON document, merges staged pipeline outputs into it, and answers SQL
//! only through a leakage guard that hides every row observed after an
//! experiment's cutoff.
//!
//! ## Design Principles
//!
//! - **One source of truth**: a single document, written atomically, readable
//!   as a consistent snapshot while a writer is active
//! - **All or nothing**: a write that fails validation changes nothing, in
//!   memory or on disk
//! - **No look-ahead**: queries and exports see only what was knowable at the
//!   declared cutoff plus horizon
//! - **Bring your own engine**: SQL runs in a pluggable [`query::SqlEngine`]
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use churn_store::Database;
//!
//! let db = Database::builder()
//!     .document_path("dynamic_system_outputs/churn_database.json")
//!     .build()?;
//!
//! // Merge one experiment's staged pipeline outputs
//! let reports = db.import_outbox("churn", 3)?;
//! for report in &reports {
//!     println!("{}: +{} rows", report.table, report.added);
//! }
//!
//! println!("{:?}", db.table_statistics());
//! db.close()?;
//! # Ok::<(), churn_store::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod config;
pub mod error;
pub mod experiment;
pub mod guard;
pub mod logging;
pub mod merge;
pub mod period;
pub mod query;
pub mod schema;
pub mod store;
pub mod value;

use std::path::PathBuf;
use std::sync::Arc;

use arrow::record_batch::RecordBatch;

pub use error::{Error, Result};

use config::StoreConfig;
use experiment::ExperimentStore;
use guard::{LeakageGuard, LeakageScope};
use merge::outbox::Outbox;
use merge::{ImportMode, ImportReport, StagedBatch};
use query::{QueryOverlay, SqlEngine};
use schema::SchemaRegistry;
use store::{ForeignKeyReport, SchemaReport, TableStatistics, TableStore};
use value::{Record, Value};

/// Column that scopes outbox imports to one experiment's rows.
const EXPERIMENT_COLUMN: &str = "experiment_id";

/// Database instance
pub struct Database {
    store: TableStore,
    overlay: Option<QueryOverlay>,
    outbox: Outbox,
    closed: bool,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("store", &self.store)
            .field("overlay", &self.overlay)
            .field("outbox", &self.outbox.root())
            .finish()
    }
}

impl Database {
    /// Create a new database builder
    #[must_use]
    pub fn builder() -> DatabaseBuilder {
        DatabaseBuilder::default()
    }

    /// Underlying table store.
    #[must_use]
    pub fn store(&self) -> &TableStore {
        &self.store
    }

    /// Outbox the database imports from and exports to.
    #[must_use]
    pub const fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Experiment operations.
    #[must_use]
    pub fn experiments(&self) -> ExperimentStore<'_> {
        ExperimentStore::new(&self.store)
    }

    /// Merge staged batches into `target`; `replace` selects replace-mode
    /// (later record wins) over append-mode.
    ///
    /// # Errors
    ///
    /// See [`TableStore::import_union`].
    pub fn import_union(
        &self,
        target: &str,
        batches: Vec<StagedBatch>,
        replace: bool,
    ) -> Result<ImportReport> {
        self.store
            .import_union(target, batches, &ImportMode::from_replace(replace))
    }

    /// Merge staged batches into `target` with an explicit mode.
    ///
    /// # Errors
    ///
    /// See [`TableStore::import_union`].
    pub fn import_with_mode(
        &self,
        target: &str,
        batches: Vec<StagedBatch>,
        mode: &ImportMode,
    ) -> Result<ImportReport> {
        self.store.import_union(target, batches, mode)
    }

    /// Import every batch staged for an experiment.
    ///
    /// Tables carrying an `experiment_id` column replace only that
    /// experiment's rows; other tables are replace-merged whole. Tables are
    /// imported in name order and each import is atomic on its own.
    ///
    /// # Errors
    ///
    /// Returns `InvalidBatch` for unreadable batches, or the first import
    /// failure. Tables imported before the failure stay imported.
    pub fn import_outbox(&self, pipeline: &str, experiment_id: i64) -> Result<Vec<ImportReport>> {
        let staged = self.outbox.staged_batches(pipeline, experiment_id)?;
        if staged.is_empty() {
            tracing::info!(pipeline, experiment_id, "outbox is empty");
        }
        let mut reports = Vec::with_capacity(staged.len());
        for (table, batches) in staged {
            let scoped = self
                .store
                .schema()
                .table(&table)?
                .column_def(EXPERIMENT_COLUMN)
                .is_some();
            let mode = if scoped {
                ImportMode::ReplaceScope {
                    column: EXPERIMENT_COLUMN.to_string(),
                    value: Value::from(experiment_id),
                }
            } else {
                ImportMode::Replace
            };
            reports.push(self.store.import_union(&table, batches, &mode)?);
        }
        Ok(reports)
    }

    /// Validate and append records to `table`.
    ///
    /// # Errors
    ///
    /// See [`TableStore::append_records`].
    pub fn append_records(&self, table: &str, records: Vec<Record>) -> Result<usize> {
        self.store.append_records(table, records)
    }

    /// Persist the current state.
    ///
    /// # Errors
    ///
    /// See [`TableStore::save`].
    pub fn save(&self) -> Result<()> {
        self.store.save()
    }

    /// Reload from disk, discarding unsaved changes.
    ///
    /// # Errors
    ///
    /// See [`TableStore::load`].
    pub fn load(&self) -> Result<()> {
        self.store.load()
    }

    /// Every stored record against its schema entry.
    #[must_use]
    pub fn validate_schema(&self) -> SchemaReport {
        self.store.validate_schema()
    }

    /// Orphaned foreign-key references.
    #[must_use]
    pub fn validate_foreign_keys(&self) -> ForeignKeyReport {
        self.store.validate_foreign_keys()
    }

    /// Per-table statistics.
    #[must_use]
    pub fn table_statistics(&self) -> Vec<TableStatistics> {
        self.store.table_statistics()
    }

    /// Run `sql` over the tables it references, guarded at `scope`.
    ///
    /// # Errors
    ///
    /// Returns `Query` if no engine is configured, `ParseError`,
    /// `UnknownTable`, `LeakageViolation` or `QueryTimeout`.
    pub fn query(&self, sql: &str, scope: LeakageScope) -> Result<RecordBatch> {
        let guard = LeakageGuard::configure(
            Arc::clone(self.store.schema()),
            scope.reference(),
            scope.horizon_months(),
        );
        self.query_guarded(sql, &guard)
    }

    /// Run `sql` guarded at an experiment's cutoff.
    ///
    /// # Errors
    ///
    /// As [`Database::query`], plus `UnknownExperiment`.
    pub fn query_experiment(
        &self,
        sql: &str,
        experiment_id: i64,
        horizon_months: u32,
    ) -> Result<RecordBatch> {
        let guard = self.experiments().guard(experiment_id, horizon_months)?;
        self.query_guarded(sql, &guard)
    }

    /// Export `tables`, guarded at an experiment's cutoff, into the outbox.
    ///
    /// # Errors
    ///
    /// Returns `UnknownExperiment`, `UnknownTable`, `LeakageViolation` or
    /// `Io`.
    pub fn export_experiment<S: AsRef<str>>(
        &self,
        pipeline: &str,
        experiment_id: i64,
        horizon_months: u32,
        tables: &[S],
    ) -> Result<Vec<PathBuf>> {
        let guard = self.experiments().guard(experiment_id, horizon_months)?;
        let view = guard.materialize(&self.store.snapshot(), tables)?;
        self.outbox.export_view(&view, pipeline, experiment_id)
    }

    /// Flush unsaved changes and release the database.
    ///
    /// This is the only flush attempt: if it fails, dropping the database
    /// afterwards does not try again.
    ///
    /// # Errors
    ///
    /// See [`TableStore::save`].
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.store.flush()
    }

    fn query_guarded(&self, sql: &str, guard: &LeakageGuard) -> Result<RecordBatch> {
        let overlay = self
            .overlay
            .as_ref()
            .ok_or_else(|| Error::Query("no SQL engine configured".to_string()))?;
        let tables = query::referenced_tables(sql)?;
        let view = guard.materialize(&self.store.snapshot(), &tables)?;
        overlay.execute(sql, guard, &view)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if !self.closed && self.store.is_dirty() {
            if let Err(e) = self.store.flush() {
                tracing::warn!(path = %self.store.path().display(), error = %e, "flush on drop failed");
            }
        }
    }
}

/// Database builder
#[derive(Default)]
pub struct DatabaseBuilder {
    config: Option<StoreConfig>,
    schema: Option<SchemaRegistry>,
    engine: Option<Arc<dyn SqlEngine>>,
    document_path: Option<PathBuf>,
}

impl std::fmt::Debug for DatabaseBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseBuilder")
            .field("config", &self.config)
            .field("document_path", &self.document_path)
            .field("engine", &self.engine.is_some())
            .finish_non_exhaustive()
    }
}

impl DatabaseBuilder {
    /// Set the store configuration (defaults to [`StoreConfig::from_env`])
    #[must_use]
    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the schema registry (defaults to the built-in churn catalog)
    #[must_use]
    pub fn schema(mut self, schema: SchemaRegistry) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Set the SQL engine queries are delegated to
    #[must_use]
    pub fn engine(mut self, engine: Arc<dyn SqlEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Override the configured document path
    #[must_use]
    pub fn document_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.document_path = Some(path.into());
        self
    }

    /// Build the database
    ///
    /// # Errors
    ///
    /// Returns `CorruptDocument` if an existing document cannot be loaded
    pub fn build(self) -> Result<Database> {
        let mut config = self.config.unwrap_or_else(StoreConfig::from_env);
        if let Some(path) = self.document_path {
            config.document_path = path;
        }
        let schema = Arc::new(self.schema.unwrap_or_else(SchemaRegistry::churn_default));
        let overlay = self
            .engine
            .map(|engine| QueryOverlay::new(engine, config.query_timeout()));
        let outbox = Outbox::new(config.outbox_root.clone());
        let store = TableStore::open(config.document_path.clone(), schema, config)?;
        Ok(Database {
            store,
            overlay,
            outbox,
            closed: false,
        })
    }
}
