//! Table store: the single persisted document and its write path
//!
//! ## Concurrency
//!
//! Readers take an `Arc<Document>` snapshot and never observe a write in
//! progress. Writers serialize on a single-writer gate (bounded wait), build
//! the next document as a copy, validate it, persist it (when autosave is on)
//! and only then publish it with a pointer swap. A failed write leaves both
//! the in-memory state and the file on disk untouched.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use churn_store::config::StoreConfig;
//! use churn_store::schema::SchemaRegistry;
//! use churn_store::store::TableStore;
//! use churn_store::value::{record, Value};
//!
//! let store = TableStore::open(
//!     "churn_database.json",
//!     Arc::new(SchemaRegistry::churn_default()),
//!     StoreConfig::default(),
//! )?;
//! store.append_records(
//!     "files",
//!     vec![record([("file_id", Value::from(1)), ("file_name", Value::from("jan.csv"))])],
//! )?;
//! # Ok::<(), churn_store::Error>(())
//! ```

mod document;
mod persist;
mod report;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, TryLockError};
use std::time::{Duration, Instant};

pub use document::{Document, DocumentMetadata, Table, DOCUMENT_VERSION};
pub use persist::{list_snapshots, lock_path};
pub use report::{
    ForeignKeyReport, OrphanedReference, SchemaIssue, SchemaReport, TableStatistics,
};

use crate::config::{ForeignKeyPolicy, StoreConfig};
use crate::merge::{merge_batches, ImportMode, ImportReport, StagedBatch};
use crate::schema::SchemaRegistry;
use crate::value::{KeyTuple, Record};
use crate::{Error, Result};
pub(crate) use persist::write_atomic;
use persist::{read_document, write_document, SnapshotPolicy};

const WRITER_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// In-memory tables backed by one JSON document.
pub struct TableStore {
    path: PathBuf,
    schema: Arc<SchemaRegistry>,
    config: StoreConfig,
    current: RwLock<Arc<Document>>,
    writer: Mutex<()>,
    dirty: AtomicBool,
}

impl std::fmt::Debug for TableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableStore")
            .field("path", &self.path)
            .field("tables", &self.snapshot().table_count())
            .field("dirty", &self.is_dirty())
            .finish_non_exhaustive()
    }
}

impl TableStore {
    /// Open the document at `path`, creating an empty one for `schema` if the
    /// file does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns `CorruptDocument` if the file exists but cannot be loaded.
    pub fn open<P: AsRef<Path>>(
        path: P,
        schema: Arc<SchemaRegistry>,
        config: StoreConfig,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (document, dirty) = if path.exists() {
            let document = read_document(&path)?;
            tracing::info!(path = %path.display(), tables = document.table_count(), "document loaded");
            (document, false)
        } else {
            tracing::info!(path = %path.display(), "no document on disk, starting empty");
            (Document::for_schema(&schema), true)
        };
        Ok(Self {
            path,
            schema,
            config,
            current: RwLock::new(Arc::new(document)),
            writer: Mutex::new(()),
            dirty: AtomicBool::new(dirty),
        })
    }

    /// Document path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Shared schema registry.
    #[must_use]
    pub fn schema(&self) -> &Arc<SchemaRegistry> {
        &self.schema
    }

    /// Store configuration.
    #[must_use]
    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Whether in-memory state differs from the persisted document.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Point-in-time view of the whole document.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Document> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Re-read the document from disk, discarding unsaved changes.
    ///
    /// # Errors
    ///
    /// Returns `CorruptDocument` (in-memory state unchanged) if the file
    /// cannot be parsed, `LockTimeout` if a writer holds the store too long.
    pub fn load(&self) -> Result<()> {
        let _writer = self.acquire_writer()?;
        let document = read_document(&self.path)?;
        tracing::info!(path = %self.path.display(), tables = document.table_count(), "document reloaded");
        self.publish(document);
        self.dirty.store(false, Ordering::Release);
        Ok(())
    }

    /// Atomically replace the persisted document with the current state.
    ///
    /// # Errors
    ///
    /// Returns `LockTimeout` or `Io` on failure; the previous document stays
    /// intact.
    pub fn save(&self) -> Result<()> {
        let _writer = self.acquire_writer()?;
        let document = self.snapshot();
        self.persist(&document)?;
        self.dirty.store(false, Ordering::Release);
        Ok(())
    }

    /// Save only if there are unsaved changes.
    ///
    /// # Errors
    ///
    /// As [`TableStore::save`].
    pub fn flush(&self) -> Result<()> {
        if self.is_dirty() {
            self.save()
        } else {
            Ok(())
        }
    }

    /// Current contents of `name`. Declared tables never written yet are empty.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTable` if the table is neither stored nor declared.
    pub fn get_table(&self, name: &str) -> Result<Table> {
        let document = self.snapshot();
        match document.table(name) {
            Some(table) => Ok(table.clone()),
            None if self.schema.contains(name) => Ok(Table::default()),
            None => Err(Error::UnknownTable(name.to_string())),
        }
    }

    /// Validate and append `records` to `table`, all or nothing.
    ///
    /// A record whose key already exists in the table (or earlier in the
    /// batch) is a violation of the key column.
    ///
    /// # Errors
    ///
    /// Returns the first `SchemaViolation` (index relative to `records`);
    /// nothing from the batch is applied.
    pub fn append_records(&self, table: &str, records: Vec<Record>) -> Result<usize> {
        let validated = self.schema.validate_records(table, &records)?;
        if validated.is_empty() {
            return Ok(0);
        }
        let key_columns = self.schema.key_columns(table)?;
        let count = validated.len();
        self.mutate(Some(table), |doc| {
            let target = doc.table_mut(table);
            if let Some(first_key) = key_columns.first() {
                let mut seen: rustc_hash::FxHashSet<KeyTuple> = target
                    .records()
                    .iter()
                    .map(|r| KeyTuple::project(r, &key_columns))
                    .collect();
                for (index, record) in validated.iter().enumerate() {
                    let key = KeyTuple::project(record, &key_columns);
                    if !seen.insert(key.clone()) {
                        return Err(Error::SchemaViolation {
                            table: table.to_string(),
                            index,
                            column: first_key.clone(),
                            reason: format!("duplicate key {key}"),
                        });
                    }
                }
            }
            target.records_mut().extend(validated);
            Ok(())
        })?;
        tracing::debug!(table, appended = count, "records appended");
        Ok(count)
    }

    /// Merge staged batches into `target` (see [`crate::merge`]).
    ///
    /// An empty batch list is a no-op returning a zero count.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTable`, `SchemaViolation`, `ForeignKeyOrphan` (when
    /// enforced) or a persistence error; the table is unchanged on failure.
    pub fn import_union(
        &self,
        target: &str,
        batches: Vec<StagedBatch>,
        mode: &ImportMode,
    ) -> Result<ImportReport> {
        self.schema.table(target)?;
        if batches.is_empty() {
            let total = self.snapshot().table(target).map_or(0, Table::len);
            tracing::debug!(table = target, "empty import, nothing to merge");
            return Ok(ImportReport::unchanged(target, total));
        }
        let sources = batches.len();
        let report = self.mutate(Some(target), |doc| {
            let existing = doc.table(target).map(Table::records).unwrap_or_default();
            let merged = merge_batches(&self.schema, target, existing, batches, mode)?;
            *doc.table_mut(target).records_mut() = merged.records;
            Ok(merged.report)
        })?;
        tracing::info!(
            table = target,
            batches = sources,
            added = report.added,
            rejected = report.rejected,
            superseded = report.superseded,
            total = report.total,
            "union import applied"
        );
        Ok(report)
    }

    /// Check every declared foreign key. Diagnostic only, never fails.
    #[must_use]
    pub fn validate_foreign_keys(&self) -> ForeignKeyReport {
        let report = report::check_foreign_keys(&self.snapshot(), &self.schema, None);
        if !report.is_clean() {
            tracing::warn!(orphans = report.orphans.len(), "foreign key orphans found");
        }
        report
    }

    /// Check every stored record against its schema entry.
    #[must_use]
    pub fn validate_schema(&self) -> SchemaReport {
        report::check_schema(&self.snapshot(), &self.schema)
    }

    /// Per-table statistics.
    #[must_use]
    pub fn table_statistics(&self) -> Vec<TableStatistics> {
        report::statistics(&self.snapshot(), &self.schema)
    }

    /// Retained snapshots of the document, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the directory cannot be listed.
    pub fn list_snapshots(&self) -> Result<Vec<PathBuf>> {
        list_snapshots(&self.path)
    }

    /// Apply `f` to a copy of the document and publish the copy if `f`, the
    /// foreign-key gate (for `checked_table`, when enforced) and persistence
    /// all succeed.
    pub(crate) fn mutate<T>(
        &self,
        checked_table: Option<&str>,
        f: impl FnOnce(&mut Document) -> Result<T>,
    ) -> Result<T> {
        let _writer = self.acquire_writer()?;
        let mut next = Document::clone(&self.snapshot());
        let out = f(&mut next)?;

        if self.config.foreign_keys == ForeignKeyPolicy::Enforce {
            if let Some(table) = checked_table {
                let report = report::check_foreign_keys(&next, &self.schema, Some(table));
                if let Some(orphan) = report.orphans.into_iter().next() {
                    return Err(orphan.into());
                }
            }
        }

        next.touch();
        if self.config.autosave {
            self.persist(&next)?;
            self.dirty.store(false, Ordering::Release);
        } else {
            self.dirty.store(true, Ordering::Release);
        }
        self.publish(next);
        Ok(out)
    }

    fn publish(&self, document: Document) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(document);
    }

    fn persist(&self, document: &Document) -> Result<()> {
        let started = Instant::now();
        write_document(
            &self.path,
            document,
            self.config.lock_timeout(),
            SnapshotPolicy {
                enabled: self.config.snapshot_on_save,
                max_snapshots: self.config.max_snapshots,
            },
        )?;
        tracing::debug!(
            path = %self.path.display(),
            elapsed_ms = started.elapsed().as_millis(),
            "document saved"
        );
        Ok(())
    }

    fn acquire_writer(&self) -> Result<MutexGuard<'_, ()>> {
        let timeout = self.config.lock_timeout();
        let started = Instant::now();
        loop {
            match self.writer.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::Poisoned(poisoned)) => return Ok(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) if started.elapsed() < timeout => {
                    std::thread::sleep(WRITER_POLL_INTERVAL);
                }
                Err(TryLockError::WouldBlock) => {
                    return Err(Error::LockTimeout {
                        path: self.path.display().to_string(),
                        waited_ms: started.elapsed().as_millis(),
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, ColumnType, TableSchema};
    use crate::value::{record, Value};

    fn schema() -> Arc<SchemaRegistry> {
        Arc::new(
            SchemaRegistry::new([
                TableSchema::new("parents").column(ColumnDef::new("id", ColumnType::Integer).key()),
                TableSchema::new("children")
                    .column(ColumnDef::new("id", ColumnType::Integer).key())
                    .column(ColumnDef::new("parent_id", ColumnType::Integer))
                    .foreign_key("parent_id", "parents", "id"),
            ])
            .unwrap(),
        )
    }

    fn child(id: i64, parent: i64) -> Record {
        record([("id", Value::from(id)), ("parent_id", Value::from(parent))])
    }

    #[test]
    fn test_open_missing_creates_declared_tables() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            TableStore::open(dir.path().join("db.json"), schema(), StoreConfig::default()).unwrap();
        assert!(store.get_table("children").unwrap().is_empty());
        assert!(matches!(store.get_table("nope"), Err(Error::UnknownTable(_))));
        assert!(store.is_dirty());
    }

    #[test]
    fn test_duplicate_key_rejects_whole_batch() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            TableStore::open(dir.path().join("db.json"), schema(), StoreConfig::default()).unwrap();
        store.append_records("children", vec![child(1, 1)]).unwrap();
        let err = store
            .append_records("children", vec![child(2, 1), child(1, 1)])
            .unwrap_err();
        assert!(matches!(err, Error::SchemaViolation { index: 1, .. }));
        assert_eq!(store.get_table("children").unwrap().len(), 1);
    }

    #[test]
    fn test_enforced_foreign_keys_block_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            foreign_keys: ForeignKeyPolicy::Enforce,
            ..StoreConfig::default()
        };
        let store = TableStore::open(dir.path().join("db.json"), schema(), config).unwrap();
        let err = store.append_records("children", vec![child(1, 7)]).unwrap_err();
        assert!(matches!(err, Error::ForeignKeyOrphan { .. }));
        assert!(store.get_table("children").unwrap().is_empty());

        store
            .append_records("parents", vec![record([("id", Value::from(7))])])
            .unwrap();
        store.append_records("children", vec![child(1, 7)]).unwrap();
    }

    #[test]
    fn test_without_autosave_flush_persists_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");
        let config = StoreConfig {
            autosave: false,
            ..StoreConfig::default()
        };
        let store = TableStore::open(&path, schema(), config).unwrap();
        store
            .append_records("parents", vec![record([("id", Value::from(1))])])
            .unwrap();
        assert!(!path.exists());
        store.flush().unwrap();
        assert!(path.exists());
        assert!(!store.is_dirty());
    }

    #[test]
    fn test_writer_section_is_exclusive_and_readers_keep_their_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            autosave: false,
            lock_timeout_ms: 100,
            ..StoreConfig::default()
        };
        let store = TableStore::open(dir.path().join("db.json"), schema(), config).unwrap();
        store
            .append_records("parents", vec![record([("id", Value::from(1))])])
            .unwrap();

        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let shared = &store;
        std::thread::scope(|s| {
            let writer = s.spawn(move || {
                shared.mutate(Some("parents"), move |doc| {
                    doc.table_mut("parents")
                        .records_mut()
                        .push(record([("id", Value::from(2))]));
                    entered_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                    Ok(())
                })
            });
            entered_rx.recv().unwrap();

            // Mid-write, readers see the table as it was before the write began.
            let before = shared.snapshot();
            assert_eq!(before.table("parents").unwrap().len(), 1);
            assert_eq!(shared.get_table("parents").unwrap().len(), 1);

            let started = Instant::now();
            let err = shared
                .append_records("parents", vec![record([("id", Value::from(3))])])
                .unwrap_err();
            assert!(matches!(err, Error::LockTimeout { .. }));
            assert!(started.elapsed() >= Duration::from_millis(100));
            assert!(started.elapsed() < Duration::from_secs(5));

            release_tx.send(()).unwrap();
            writer.join().unwrap().unwrap();
            // A snapshot taken earlier is unaffected by the publish.
            assert_eq!(before.table("parents").unwrap().len(), 1);
        });
        assert_eq!(store.get_table("parents").unwrap().len(), 2);
    }
}
