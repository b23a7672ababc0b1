//! Diagnostic reports: foreign-key orphans, schema conformance, statistics

use rustc_hash::FxHashSet;
use serde::Serialize;

use super::document::Document;
use crate::period::Period;
use crate::schema::{ForeignKey, SchemaRegistry};
use crate::value::{KeyTuple, Record, Value};
use crate::Error;

/// A referencing value with no match in the referenced column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrphanedReference {
    /// Referencing table
    pub table: String,
    /// Record index in the referencing table
    pub index: usize,
    /// Referencing column
    pub column: String,
    /// The dangling value
    pub value: Value,
    /// Referenced table
    pub references_table: String,
    /// Referenced column
    pub references_column: String,
}

impl From<OrphanedReference> for Error {
    fn from(orphan: OrphanedReference) -> Self {
        Self::ForeignKeyOrphan {
            references: format!("{}.{}", orphan.references_table, orphan.references_column),
            table: orphan.table,
            index: orphan.index,
            column: orphan.column,
            value: orphan.value.to_string(),
        }
    }
}

/// Result of [`TableStore::validate_foreign_keys`](super::TableStore::validate_foreign_keys).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ForeignKeyReport {
    /// Number of non-null referencing values checked
    pub checked: usize,
    /// Values with no match
    pub orphans: Vec<OrphanedReference>,
}

impl ForeignKeyReport {
    /// Whether every reference resolved.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.orphans.is_empty()
    }
}

/// Check every declared foreign key of `tables` (all tables if `None`).
/// Null referencing values are not orphans.
pub(crate) fn check_foreign_keys(
    document: &Document,
    schema: &SchemaRegistry,
    only_table: Option<&str>,
) -> ForeignKeyReport {
    let mut report = ForeignKeyReport::default();
    for table_schema in schema.tables() {
        if only_table.is_some_and(|t| t != table_schema.name()) {
            continue;
        }
        let Some(table) = document.table(table_schema.name()) else {
            continue;
        };
        for fk in table_schema.foreign_keys() {
            let targets = referenced_values(document, fk);
            for (index, record) in table.records().iter().enumerate() {
                let Some(value) = record.get(&fk.column).filter(|v| !v.is_null()) else {
                    continue;
                };
                report.checked += 1;
                if !targets.contains(&KeyTuple::single(value)) {
                    report.orphans.push(OrphanedReference {
                        table: table_schema.name().to_string(),
                        index,
                        column: fk.column.clone(),
                        value: value.clone(),
                        references_table: fk.references_table.clone(),
                        references_column: fk.references_column.clone(),
                    });
                }
            }
        }
    }
    report
}

fn referenced_values(document: &Document, fk: &ForeignKey) -> FxHashSet<KeyTuple> {
    document
        .table(&fk.references_table)
        .map(|t| {
            t.records()
                .iter()
                .filter_map(|r| r.get(&fk.references_column))
                .map(KeyTuple::single)
                .collect()
        })
        .unwrap_or_default()
}

/// One schema conformance failure found by `validate_schema`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaIssue {
    /// Table name
    pub table: String,
    /// Record index, if the issue is record-level
    pub index: Option<usize>,
    /// Column, if known
    pub column: Option<String>,
    /// Description
    pub reason: String,
}

/// Result of `validate_schema`: every issue, not only the first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchemaReport {
    /// Number of tables inspected
    pub tables_checked: usize,
    /// Number of records inspected
    pub records_checked: usize,
    /// Issues found
    pub issues: Vec<SchemaIssue>,
}

impl SchemaReport {
    /// Whether every record conforms.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }
}

pub(crate) fn check_schema(document: &Document, schema: &SchemaRegistry) -> SchemaReport {
    let mut report = SchemaReport::default();
    for (name, table) in document.tables() {
        report.tables_checked += 1;
        if !schema.contains(name) {
            report.issues.push(SchemaIssue {
                table: name.to_string(),
                index: None,
                column: None,
                reason: "table is not declared in the schema registry".to_string(),
            });
            continue;
        }
        for (index, record) in table.records().iter().enumerate() {
            report.records_checked += 1;
            match schema.validate_record(name, index, record) {
                Ok(normalized) => {
                    for (column, reason) in column_differences(record, &normalized) {
                        report.issues.push(SchemaIssue {
                            table: name.to_string(),
                            index: Some(index),
                            column: Some(column),
                            reason,
                        });
                    }
                }
                Err(Error::SchemaViolation { column, reason, .. }) => {
                    report.issues.push(SchemaIssue {
                        table: name.to_string(),
                        index: Some(index),
                        column: Some(column),
                        reason,
                    });
                }
                Err(other) => report.issues.push(SchemaIssue {
                    table: name.to_string(),
                    index: Some(index),
                    column: None,
                    reason: other.to_string(),
                }),
            }
        }
    }
    report
}

/// Columns where a stored record differs from its validated form.
fn column_differences(stored: &Record, normalized: &Record) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = normalized
        .iter()
        .filter_map(|(column, expected)| {
            let reason = match stored.get(column) {
                None => "declared nullable column is missing".to_string(),
                Some(actual) if actual != expected => {
                    format!("stored as {actual}, stored form is {expected}")
                }
                Some(_) => return None,
            };
            Some((column.clone(), reason))
        })
        .collect();
    out.extend(
        stored
            .keys()
            .filter(|column| !normalized.contains_key(*column))
            .map(|column| (column.clone(), "undeclared column is kept in storage".to_string())),
    );
    out
}

/// Per-table statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableStatistics {
    /// Table name
    pub table: String,
    /// Number of records
    pub record_count: usize,
    /// Number of declared (or observed, if undeclared) columns
    pub column_count: usize,
    /// Declared key columns
    pub key_columns: Vec<String>,
    /// Earliest and latest value of the period column
    pub period_range: Option<(Period, Period)>,
    /// Declared description
    pub description: Option<String>,
}

pub(crate) fn statistics(document: &Document, schema: &SchemaRegistry) -> Vec<TableStatistics> {
    document
        .tables()
        .map(|(name, table)| match schema.table(name) {
            Ok(ts) => TableStatistics {
                table: name.to_string(),
                record_count: table.len(),
                column_count: ts.columns().len(),
                key_columns: ts.key_columns(),
                period_range: ts.period_column_name().and_then(|c| table.period_range(c)),
                description: ts.description_text().map(str::to_string),
            },
            Err(_) => TableStatistics {
                table: name.to_string(),
                record_count: table.len(),
                column_count: table.column_names().len(),
                key_columns: Vec::new(),
                period_range: None,
                description: None,
            },
        })
        .collect()
}
