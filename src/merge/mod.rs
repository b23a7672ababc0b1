//! Import/union merger
//!
//! Merges staged batches into a target table. Batches are concatenated in
//! source-id order (stable, so records keep their order within a batch),
//! validated as a whole, then merged according to an [`ImportMode`]:
//!
//! - `Append`: records whose key already exists (in the table or earlier in
//!   the import) are rejected and counted.
//! - `Replace`: the table becomes the key-de-duplicated union; for a repeated
//!   key the later record wins and takes the slot of the first occurrence.
//! - `ReplaceScope`: like `Replace`, restricted to the rows whose scope
//!   column equals a value (one experiment's rows); other rows are kept.
//!
//! Tables without key columns de-duplicate by the whole record. The merge is
//! pure: the table store applies the result only if every step succeeded.

pub mod outbox;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;

use crate::schema::SchemaRegistry;
use crate::value::{KeyTuple, Record, Value};
use crate::Result;

/// A table-shaped batch of records from one staging source.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedBatch {
    source: String,
    records: Vec<Record>,
}

impl StagedBatch {
    /// Batch identified by `source` (the ordering key).
    #[must_use]
    pub fn new(source: impl Into<String>, records: Vec<Record>) -> Self {
        Self {
            source: source.into(),
            records,
        }
    }

    /// Source identifier.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Records in staged order.
    #[must_use]
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the batch holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// How staged records are merged into the target table.
#[derive(Debug, Clone, PartialEq)]
pub enum ImportMode {
    /// Add new keys, reject existing ones
    Append,
    /// Replace the table with the de-duplicated union
    Replace,
    /// Replace only the rows where `column == value`
    ReplaceScope {
        /// Scope column, e.g. `experiment_id`
        column: String,
        /// Scope value
        value: Value,
    },
}

impl ImportMode {
    /// `Replace` if `replace`, else `Append`.
    #[must_use]
    pub const fn from_replace(replace: bool) -> Self {
        if replace {
            Self::Replace
        } else {
            Self::Append
        }
    }
}

/// Outcome of an import.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    /// Target table
    pub table: String,
    /// Records in the final table whose key did not exist before
    pub added: usize,
    /// Records refused because their key already existed (append only)
    pub rejected: usize,
    /// Staged records overridden by a later record with the same key
    pub superseded: usize,
    /// Records in the table after the import
    pub total: usize,
}

impl ImportReport {
    pub(crate) fn unchanged(table: &str, total: usize) -> Self {
        Self {
            table: table.to_string(),
            total,
            ..Self::default()
        }
    }
}

#[derive(Debug)]
pub(crate) struct Merged {
    pub(crate) records: Vec<Record>,
    pub(crate) report: ImportReport,
}

/// Concatenate batches in source order, validate every record, and merge
/// them into `existing`.
///
/// Record indexes in `SchemaViolation` errors are positions in the
/// concatenated import order.
pub(crate) fn merge_batches(
    schema: &SchemaRegistry,
    table: &str,
    existing: &[Record],
    mut batches: Vec<StagedBatch>,
    mode: &ImportMode,
) -> Result<Merged> {
    batches.sort_by(|a, b| a.source.cmp(&b.source));
    let incoming: Vec<Record> = batches.into_iter().flat_map(|b| b.records).collect();
    let incoming = schema.validate_records(table, &incoming)?;
    let key_columns = schema.key_columns(table)?;
    let key_of = |r: &Record| KeyTuple::of(r, &key_columns);

    let before: FxHashSet<KeyTuple> = existing.iter().map(key_of).collect();
    let mut report = ImportReport {
        table: table.to_string(),
        ..ImportReport::default()
    };

    let records = match mode {
        ImportMode::Append => {
            let mut seen = before.clone();
            let mut out = existing.to_vec();
            for record in incoming {
                if seen.insert(key_of(&record)) {
                    out.push(record);
                } else {
                    report.rejected += 1;
                }
            }
            out
        }
        ImportMode::Replace => dedupe_later_wins(incoming, &key_of, &mut report),
        ImportMode::ReplaceScope { column, value } => {
            let scope = KeyTuple::single(value);
            let staged = dedupe_later_wins(incoming, &key_of, &mut report);
            let staged_keys: FxHashSet<KeyTuple> = staged.iter().map(key_of).collect();
            existing
                .iter()
                .filter(|r| {
                    r.get(column).map_or(true, |v| KeyTuple::single(v) != scope)
                        && !staged_keys.contains(&key_of(r))
                })
                .cloned()
                .chain(staged)
                .collect()
        }
    };

    report.added = records.iter().filter(|r| !before.contains(&key_of(r))).count();
    report.total = records.len();
    Ok(Merged { records, report })
}

fn dedupe_later_wins(
    records: Vec<Record>,
    key_of: &impl Fn(&Record) -> KeyTuple,
    report: &mut ImportReport,
) -> Vec<Record> {
    let mut slots: FxHashMap<KeyTuple, usize> = FxHashMap::default();
    let mut out: Vec<Record> = Vec::with_capacity(records.len());
    for record in records {
        let key = key_of(&record);
        if let Some(&slot) = slots.get(&key) {
            out[slot] = record;
            report.superseded += 1;
        } else {
            slots.insert(key, out.len());
            out.push(record);
        }
    }
    out
}
