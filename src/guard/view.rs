//! Guarded tables and materialized views

use std::collections::BTreeMap;

use super::LeakageScope;
use crate::store::Table;

/// How a table got into a view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Rows filtered on `period_column` under `scope`
    Filtered {
        /// Scope the rows were filtered under
        scope: LeakageScope,
        /// Period column used
        period_column: String,
        /// Whether declared outcome columns were masked at the same cutoff
        outcomes_masked: bool,
    },
    /// Table declares no period column; admitted whole
    TimeInvariant,
    /// Inserted without passing the guard
    Unfiltered,
}

/// A table as admitted into a view.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardedTable {
    name: String,
    table: Table,
    admission: Admission,
    excluded: usize,
    masked: usize,
}

impl GuardedTable {
    pub(crate) fn new(
        name: impl Into<String>,
        table: Table,
        admission: Admission,
        excluded: usize,
    ) -> Self {
        Self {
            name: name.into(),
            table,
            admission,
            excluded,
            masked: 0,
        }
    }

    /// Table name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Admitted rows.
    #[must_use]
    pub const fn table(&self) -> &Table {
        &self.table
    }

    /// How the table was admitted.
    #[must_use]
    pub const fn admission(&self) -> &Admission {
        &self.admission
    }

    /// Rows left out (beyond the cutoff or without a period).
    #[must_use]
    pub const fn excluded(&self) -> usize {
        self.excluded
    }

    /// Outcome values nulled because they lie beyond the cutoff.
    #[must_use]
    pub const fn masked(&self) -> usize {
        self.masked
    }

    pub(crate) fn table_mut(&mut self) -> &mut Table {
        &mut self.table
    }

    /// Record that outcome columns were checked, adding `count` masked values.
    pub(crate) fn mark_outcomes_masked(&mut self, count: usize) {
        self.masked += count;
        if let Admission::Filtered { outcomes_masked, .. } = &mut self.admission {
            *outcomes_masked = true;
        }
    }
}

/// Point-in-time set of tables handed to the query overlay or an export.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaterializedView {
    tables: BTreeMap<String, GuardedTable>,
}

impl MaterializedView {
    /// Empty view.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a guarded table. Tables admitted by row filtering
    /// alone fail scope validation if they declare outcome columns.
    pub fn insert(&mut self, table: GuardedTable) {
        self.tables.insert(table.name.clone(), table);
    }

    /// Add a table that did not pass the guard. Scope validation refuses
    /// queries touching it unless the table is time-invariant.
    pub fn insert_unfiltered(&mut self, name: impl Into<String>, table: Table) {
        self.insert(GuardedTable::new(name, table, Admission::Unfiltered, 0));
    }

    /// Table by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&GuardedTable> {
        self.tables.get(name)
    }

    /// Tables ordered by name.
    pub fn tables(&self) -> impl Iterator<Item = &GuardedTable> {
        self.tables.values()
    }

    /// Table names ordered.
    #[must_use]
    pub fn table_names(&self) -> Vec<&str> {
        self.tables.keys().map(String::as_str).collect()
    }

    /// Number of tables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Whether the view holds no tables.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}
