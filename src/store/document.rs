//! The persisted document: table name → ordered records

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::period::Period;
use crate::schema::SchemaRegistry;
use crate::value::{Record, Value};
use crate::{Error, Result};

/// Document format version written by this crate.
pub const DOCUMENT_VERSION: &str = "1.0";

/// Document-level bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    version: String,
    created_at: DateTime<Utc>,
    last_updated: DateTime<Utc>,
}

impl Default for DocumentMetadata {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            version: DOCUMENT_VERSION.to_string(),
            created_at: now,
            last_updated: now,
        }
    }
}

impl DocumentMetadata {
    /// Format version.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Creation timestamp.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Timestamp of the last save.
    #[must_use]
    pub const fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }
}

/// An ordered sequence of records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Table {
    records: Vec<Record>,
}

impl Table {
    /// Wrap records.
    #[must_use]
    pub const fn new(records: Vec<Record>) -> Self {
        Self { records }
    }

    /// Records in insertion order.
    #[must_use]
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Consume into records.
    #[must_use]
    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the table has no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Column names of the first record (tables are uniform).
    #[must_use]
    pub fn column_names(&self) -> Vec<String> {
        self.records
            .first()
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Earliest and latest valid period in `column`, ignoring nulls and
    /// malformed values.
    #[must_use]
    pub fn period_range(&self, column: &str) -> Option<(Period, Period)> {
        self.records
            .iter()
            .filter_map(|r| r.get(column))
            .filter(|v| !v.is_null())
            .filter_map(|v| Period::try_from(v).ok())
            .fold(None, |acc, p| match acc {
                None => Some((p, p)),
                Some((lo, hi)) => Some((lo.min(p), hi.max(p))),
            })
    }

    pub(crate) fn records_mut(&mut self) -> &mut Vec<Record> {
        &mut self.records
    }
}

/// The whole persisted state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default)]
    metadata: DocumentMetadata,
    tables: BTreeMap<String, Table>,
}

impl Document {
    /// Empty document with one empty table per declared schema entry.
    #[must_use]
    pub fn for_schema(schema: &SchemaRegistry) -> Self {
        Self {
            metadata: DocumentMetadata::default(),
            tables: schema
                .tables()
                .map(|t| (t.name().to_string(), Table::default()))
                .collect(),
        }
    }

    /// Parse and structurally validate a serialized document.
    ///
    /// `origin` names the source in error messages.
    ///
    /// # Errors
    ///
    /// Returns `CorruptDocument` if the bytes are not a document or a table
    /// holds non-uniform records.
    pub fn from_slice(bytes: &[u8], origin: &str) -> Result<Self> {
        let document: Self =
            serde_json::from_slice(bytes).map_err(|e| Error::corrupt(origin, e.to_string()))?;
        document.validate_structure(origin)?;
        Ok(document)
    }

    /// Serialize as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns `CorruptDocument` if serialization fails.
    pub fn to_vec_pretty(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| Error::corrupt("<in-memory>", e.to_string()))
    }

    /// Every record of a table must carry the same column set and no
    /// non-finite floats.
    ///
    /// # Errors
    ///
    /// Returns `CorruptDocument` naming the table and record index.
    pub fn validate_structure(&self, origin: &str) -> Result<()> {
        for (name, table) in &self.tables {
            let Some(first) = table.records.first() else {
                continue;
            };
            let expected: BTreeSet<&String> = first.keys().collect();
            for (index, record) in table.records.iter().enumerate() {
                if !record.keys().eq(expected.iter().copied()) {
                    return Err(Error::corrupt(
                        origin,
                        format!("table '{name}' record {index} has a different column set than record 0"),
                    ));
                }
                if let Some((column, _)) = record
                    .iter()
                    .find(|(_, v)| matches!(v, Value::Float(f) if !f.is_finite()))
                {
                    return Err(Error::corrupt(
                        origin,
                        format!("table '{name}' record {index} column '{column}' is not finite"),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Document metadata.
    #[must_use]
    pub const fn metadata(&self) -> &DocumentMetadata {
        &self.metadata
    }

    /// Table by name.
    #[must_use]
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    /// Table by name, failing with `UnknownTable`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTable` if absent.
    pub fn require_table(&self, name: &str) -> Result<&Table> {
        self.table(name)
            .ok_or_else(|| Error::UnknownTable(name.to_string()))
    }

    /// Iterate `(name, table)` ordered by name.
    pub fn tables(&self) -> impl Iterator<Item = (&str, &Table)> {
        self.tables.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of tables.
    #[must_use]
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub(crate) fn table_mut(&mut self, name: &str) -> &mut Table {
        self.tables.entry(name.to_string()).or_default()
    }

    pub(crate) fn touch(&mut self) {
        self.metadata.last_updated = Utc::now();
    }
}
