//! Leakage guard: temporal scoping of views, queries and exports
//!
//! A [`LeakageScope`] is a reference period plus a horizon in months. A row
//! is observable when its period satisfies `period <= reference + horizon`,
//! compared on absolute month indexes (`year * 12 + month`) so that year
//! boundaries behave: under reference `202412` and horizon 1, `202501` is
//! visible and `202502` is not.
//!
//! The guard is applied where tables are materialized. Rows are excluded,
//! never altered, except for declared outcome columns: an outcome (e.g. the
//! churn month) lying beyond the cutoff is nulled in the view so a model
//! cannot learn from an event that had not happened yet. Stored data is
//! untouched.
//!
//! Failures are fatal to the query or export: a malformed period, a table
//! that bypassed the guard, or a table filtered under a later cutoff than the
//! query declares all raise `LeakageViolation`.

mod view;

use std::fmt;
use std::sync::Arc;

pub use view::{Admission, GuardedTable, MaterializedView};

use crate::experiment::Experiment;
use crate::period::Period;
use crate::schema::SchemaRegistry;
use crate::store::{Document, Table};
use crate::value::Value;
use crate::{Error, Result};

/// Reference period plus the months beyond it that may be observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeakageScope {
    reference: Period,
    horizon_months: u32,
}

impl LeakageScope {
    /// Scope ending `horizon_months` after `reference`.
    #[must_use]
    pub const fn new(reference: Period, horizon_months: u32) -> Self {
        Self {
            reference,
            horizon_months,
        }
    }

    /// Reference (cutoff) period.
    #[must_use]
    pub const fn reference(&self) -> Period {
        self.reference
    }

    /// Horizon in months.
    #[must_use]
    pub const fn horizon_months(&self) -> u32 {
        self.horizon_months
    }

    /// Month index of the last observable period.
    #[must_use]
    pub fn limit_index(&self) -> i64 {
        self.reference.month_index() + i64::from(self.horizon_months)
    }

    /// Last observable period.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPeriod` if the horizon runs past year 9999.
    pub fn cutoff(&self) -> Result<Period> {
        Period::from_month_index(self.limit_index())
    }

    /// Whether `period` is observable under this scope.
    #[must_use]
    pub fn admits(&self, period: Period) -> bool {
        period.month_index() <= self.limit_index()
    }

    /// Whether data filtered under `self` may serve a query declared under
    /// `declared` (nothing visible beyond the declared cutoff).
    #[must_use]
    pub fn is_within(&self, declared: &Self) -> bool {
        self.limit_index() <= declared.limit_index()
    }
}

impl fmt::Display for LeakageScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}m", self.reference, self.horizon_months)
    }
}

/// Applies one [`LeakageScope`] to tables declared in a schema registry.
#[derive(Debug, Clone)]
pub struct LeakageGuard {
    schema: Arc<SchemaRegistry>,
    scope: LeakageScope,
}

impl LeakageGuard {
    /// Guard with cutoff `reference` and `horizon_months` of look-ahead.
    #[must_use]
    pub const fn configure(
        schema: Arc<SchemaRegistry>,
        reference: Period,
        horizon_months: u32,
    ) -> Self {
        Self {
            schema,
            scope: LeakageScope::new(reference, horizon_months),
        }
    }

    /// Guard scoped to an experiment's cutoff.
    #[must_use]
    pub fn for_experiment(
        schema: Arc<SchemaRegistry>,
        experiment: &Experiment,
        horizon_months: u32,
    ) -> Self {
        Self::configure(schema, experiment.cutoff(), horizon_months)
    }

    /// Declared scope.
    #[must_use]
    pub const fn scope(&self) -> LeakageScope {
        self.scope
    }

    /// Schema registry the guard resolves period and outcome columns from.
    #[must_use]
    pub const fn schema(&self) -> &Arc<SchemaRegistry> {
        &self.schema
    }

    /// Rows of `table` whose `period_column` lies within the scope.
    ///
    /// Rows with a null or missing period are excluded.
    ///
    /// # Errors
    ///
    /// Returns `LeakageViolation` naming the row if a period is malformed.
    pub fn filter_rows(&self, name: &str, table: &Table, period_column: &str) -> Result<GuardedTable> {
        let mut kept = Vec::with_capacity(table.len());
        let mut excluded = 0usize;
        for (index, record) in table.records().iter().enumerate() {
            let period = match record.get(period_column) {
                None | Some(Value::Null) => None,
                Some(value) => Some(self.parse_period(name, index, period_column, value)?),
            };
            match period {
                Some(p) if self.scope.admits(p) => kept.push(record.clone()),
                _ => excluded += 1,
            }
        }
        if excluded > 0 {
            tracing::debug!(
                table = name,
                scope = %self.scope,
                kept = kept.len(),
                excluded,
                "rows excluded by leakage guard"
            );
        }
        Ok(GuardedTable::new(
            name,
            Table::new(kept),
            Admission::Filtered {
                scope: self.scope,
                period_column: period_column.to_string(),
                outcomes_masked: false,
            },
            excluded,
        ))
    }

    /// Admit a declared table: filter on its period column (if any) and mask
    /// outcome values beyond the cutoff.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTable` if `name` is not declared, or `LeakageViolation`.
    pub fn guard_table(&self, name: &str, table: &Table) -> Result<GuardedTable> {
        let schema = self.schema.table(name)?;
        let mut guarded = match schema.period_column_name() {
            Some(column) => self.filter_rows(name, table, column)?,
            None => GuardedTable::new(name, table.clone(), Admission::TimeInvariant, 0),
        };

        let mut masked = 0usize;
        for column in schema.outcome_column_names() {
            for (index, record) in guarded.table_mut().records_mut().iter_mut().enumerate() {
                let Some(value) = record.get_mut(column).filter(|v| !v.is_null()) else {
                    continue;
                };
                let period = self.parse_period(name, index, column, value)?;
                if !self.scope.admits(period) {
                    *value = Value::Null;
                    masked += 1;
                }
            }
        }
        if masked > 0 {
            tracing::debug!(table = name, scope = %self.scope, masked, "outcome values masked");
        }
        guarded.mark_outcomes_masked(masked);
        Ok(guarded)
    }

    /// Guard `tables` of `document` into a view. Declared tables not yet
    /// stored are admitted empty.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTable` or `LeakageViolation`.
    pub fn materialize<S: AsRef<str>>(&self, document: &Document, tables: &[S]) -> Result<MaterializedView> {
        let mut view = MaterializedView::new();
        let empty = Table::default();
        for name in tables {
            let name = name.as_ref();
            let table = document.table(name).unwrap_or(&empty);
            view.insert(self.guard_table(name, table)?);
        }
        Ok(view)
    }

    /// Check that every table a query touches was admitted under a scope no
    /// later than this guard's.
    ///
    /// # Errors
    ///
    /// Returns `LeakageViolation` naming the first offending table.
    pub fn validate_query_scope<S: AsRef<str>>(
        &self,
        view: &MaterializedView,
        tables_touched: &[S],
    ) -> Result<()> {
        for name in tables_touched {
            let name = name.as_ref();
            let violation = |period: Period, reason: String| Error::LeakageViolation {
                table: name.to_string(),
                period,
                reason,
            };
            let Some(guarded) = view.get(name) else {
                return Err(violation(
                    self.scope.reference(),
                    format!("table was never passed through the leakage guard (scope {})", self.scope),
                ));
            };
            let declared = self.schema.table(name).ok();
            let has_outcomes = declared.is_some_and(|t| !t.outcome_column_names().is_empty());
            match guarded.admission() {
                Admission::Filtered { scope, .. } if !scope.is_within(&self.scope) => {
                    return Err(violation(
                        scope.cutoff().unwrap_or_else(|_| scope.reference()),
                        format!("filtered under scope {scope}, later than the declared scope {}", self.scope),
                    ));
                }
                Admission::Filtered {
                    outcomes_masked: false,
                    ..
                } if has_outcomes => {
                    return Err(violation(
                        self.scope.reference(),
                        "rows were filtered but outcome columns were not masked".to_string(),
                    ));
                }
                Admission::Filtered { .. } | Admission::TimeInvariant => {}
                Admission::Unfiltered => {
                    let time_indexed = declared.map_or(true, |t| t.period_column_name().is_some());
                    if time_indexed || has_outcomes {
                        return Err(violation(
                            self.scope.reference(),
                            "table was added to the view without passing the leakage guard".to_string(),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn parse_period(&self, table: &str, index: usize, column: &str, value: &Value) -> Result<Period> {
        Period::try_from(value).map_err(|e| Error::LeakageViolation {
            table: table.to_string(),
            period: self.scope.reference(),
            reason: format!("record {index} column '{column}' holds malformed period {value}: {e}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, ColumnType, TableSchema};
    use crate::value::record;

    fn schema() -> Arc<SchemaRegistry> {
        Arc::new(
            SchemaRegistry::new([
                TableSchema::new("panel")
                    .column(ColumnDef::new("customer_id", ColumnType::Integer).key())
                    .column(ColumnDef::new("period", ColumnType::Period).key())
                    .column(ColumnDef::new("churn_period", ColumnType::Period))
                    .period_column("period")
                    .outcome_column("churn_period"),
                TableSchema::new("lookup").column(ColumnDef::new("id", ColumnType::Integer).key()),
                TableSchema::new("scores")
                    .column(ColumnDef::new("customer_id", ColumnType::Integer).key())
                    .column(ColumnDef::new("period", ColumnType::Period).key())
                    .period_column("period"),
            ])
            .unwrap(),
        )
    }

    fn period(yyyymm: i64) -> Period {
        Period::from_yyyymm(yyyymm).unwrap()
    }

    fn panel(rows: &[(i64, Value)]) -> Table {
        Table::new(
            rows.iter()
                .enumerate()
                .map(|(i, (p, churn))| {
                    record([
                        ("customer_id", Value::from(i64::try_from(i).unwrap())),
                        ("period", Value::from(*p)),
                        ("churn_period", churn.clone()),
                    ])
                })
                .collect(),
        )
    }

    #[test]
    fn test_year_boundary_horizon() {
        let guard = LeakageGuard::configure(schema(), period(202_412), 1);
        let table = panel(&[(202_412, Value::Null), (202_501, Value::Null), (202_502, Value::Null)]);
        let guarded = guard.filter_rows("panel", &table, "period").unwrap();
        let kept: Vec<_> = guarded
            .table()
            .records()
            .iter()
            .map(|r| r["period"].clone())
            .collect();
        assert_eq!(kept, vec![Value::from(202_412), Value::from(202_501)]);
        assert_eq!(guarded.excluded(), 1);
    }

    #[test]
    fn test_null_period_excluded_malformed_fatal() {
        let guard = LeakageGuard::configure(schema(), period(202_312), 0);
        let table = Table::new(vec![record([("period", Value::Null)])]);
        assert_eq!(guard.filter_rows("panel", &table, "period").unwrap().excluded(), 1);

        let table = Table::new(vec![record([("period", Value::from(202_313))])]);
        let err = guard.filter_rows("panel", &table, "period").unwrap_err();
        assert!(matches!(err, Error::LeakageViolation { ref table, .. } if table == "panel"));
        assert!(err.to_string().contains("record 0"));
    }

    #[test]
    fn test_future_outcomes_masked() {
        let guard = LeakageGuard::configure(schema(), period(202_306), 0);
        let table = panel(&[
            (202_301, Value::from(202_305)),
            (202_302, Value::from(202_309)),
        ]);
        let guarded = guard.guard_table("panel", &table).unwrap();
        let records = guarded.table().records();
        assert_eq!(records[0]["churn_period"], Value::from(202_305));
        assert_eq!(records[1]["churn_period"], Value::Null);
        assert_eq!(guarded.masked(), 1);
        // stored table untouched
        assert_eq!(table.records()[1]["churn_period"], Value::from(202_309));
    }

    #[test]
    fn test_unfiltered_table_is_a_violation() {
        let guard = LeakageGuard::configure(schema(), period(202_312), 0);
        let view = MaterializedView::new();
        let err = guard.validate_query_scope(&view, &["panel"]).unwrap_err();
        assert!(err.to_string().contains("'panel'"));

        let mut view = MaterializedView::new();
        view.insert_unfiltered("panel", Table::default());
        view.insert_unfiltered("lookup", Table::default());
        assert!(guard.validate_query_scope(&view, &["lookup"]).is_ok());
        assert!(guard.validate_query_scope(&view, &["panel"]).is_err());
    }

    #[test]
    fn test_later_scope_is_incompatible() {
        let wide = LeakageGuard::configure(schema(), period(202_312), 3);
        let narrow = LeakageGuard::configure(schema(), period(202_312), 0);
        let view = wide.materialize(&Document::for_schema(&schema()), &["panel"]).unwrap();
        assert!(wide.validate_query_scope(&view, &["panel"]).is_ok());
        assert!(matches!(
            narrow.validate_query_scope(&view, &["panel"]),
            Err(Error::LeakageViolation { .. })
        ));

        let view = narrow.materialize(&Document::for_schema(&schema()), &["panel"]).unwrap();
        assert!(wide.validate_query_scope(&view, &["panel"]).is_ok());
    }

    #[test]
    fn test_filter_only_admission_needs_outcome_masking() {
        let guard = LeakageGuard::configure(schema(), period(202_312), 0);
        let table = panel(&[(202_311, Value::from(202_402))]);

        let mut view = MaterializedView::new();
        view.insert(guard.filter_rows("panel", &table, "period").unwrap());
        let err = guard.validate_query_scope(&view, &["panel"]).unwrap_err();
        assert!(err.to_string().contains("outcome columns were not masked"));

        view.insert(guard.guard_table("panel", &table).unwrap());
        assert!(guard.validate_query_scope(&view, &["panel"]).is_ok());
        assert_eq!(view.get("panel").unwrap().masked(), 1);

        // Nothing to mask: row filtering alone is enough.
        let scores = Table::new(vec![record([
            ("customer_id", Value::from(1)),
            ("period", Value::from(202_312)),
        ])]);
        view.insert(guard.filter_rows("scores", &scores, "period").unwrap());
        assert!(guard.validate_query_scope(&view, &["scores"]).is_ok());
    }

    #[test]
    fn test_time_invariant_admitted_whole() {
        let guard = LeakageGuard::configure(schema(), period(202_001), 0);
        let table = Table::new(vec![record([("id", Value::from(1))])]);
        let guarded = guard.guard_table("lookup", &table).unwrap();
        assert_eq!(guarded.admission(), &Admission::TimeInvariant);
        assert_eq!(guarded.table().len(), 1);
    }
}
