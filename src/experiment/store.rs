//! Experiment Store - experiment lifecycle over the table store
//!
//! Experiments live in the `experiments` table and KPIs in
//! `experiment_kpis`; every change goes through the table store's write
//! path, so it is validated, persisted and published atomically.

use std::sync::Arc;

use super::{Experiment, ExperimentBuilder, ExperimentStatus, KpiRecord, KpiRecordBuilder};
use crate::guard::LeakageGuard;
use crate::store::{Document, TableStore};
use crate::value::{KeyTuple, Record, Value};
use crate::{Error, Result};

const EXPERIMENTS: &str = "experiments";
const KPIS: &str = "experiment_kpis";

/// Experiment operations bound to a [`TableStore`].
#[derive(Debug, Clone, Copy)]
pub struct ExperimentStore<'a> {
    store: &'a TableStore,
}

impl<'a> ExperimentStore<'a> {
    /// Bind to `store`.
    #[must_use]
    pub const fn new(store: &'a TableStore) -> Self {
        Self { store }
    }

    /// Register an experiment with id = highest existing id + 1.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for inverted windows, `SchemaViolation` if the
    /// schema rejects the row, or a persistence error.
    pub fn create(&self, builder: ExperimentBuilder) -> Result<Experiment> {
        let schema = Arc::clone(self.store.schema());
        let experiment = self.store.mutate(Some(EXPERIMENTS), |doc| {
            let experiment = builder.build(next_id(doc, EXPERIMENTS, "experiment_id"))?;
            let rows = doc.table_mut(EXPERIMENTS).records_mut();
            let row = schema.validate_record(EXPERIMENTS, rows.len(), &experiment.to_record())?;
            rows.push(row);
            Ok(experiment)
        })?;
        tracing::info!(
            experiment_id = experiment.experiment_id(),
            name = experiment.name(),
            cutoff = %experiment.cutoff(),
            "experiment created"
        );
        Ok(experiment)
    }

    /// Experiment by id.
    ///
    /// # Errors
    ///
    /// Returns `UnknownExperiment` if absent, `InvalidInput` if its row is
    /// malformed.
    pub fn get(&self, experiment_id: i64) -> Result<Experiment> {
        let document = self.store.snapshot();
        find(&document, experiment_id)
            .map(|(_, row)| Experiment::from_record(row))
            .ok_or(Error::UnknownExperiment(experiment_id))?
    }

    /// All experiments ordered by id.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if a row is malformed.
    pub fn list(&self) -> Result<Vec<Experiment>> {
        let document = self.store.snapshot();
        let mut experiments = document
            .table(EXPERIMENTS)
            .map(|t| t.records().iter().map(Experiment::from_record).collect::<Result<Vec<_>>>())
            .transpose()?
            .unwrap_or_default();
        experiments.sort_by_key(Experiment::experiment_id);
        Ok(experiments)
    }

    /// Move an experiment to `status`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownExperiment`, or `InvalidTransition` if the lifecycle
    /// does not allow the change.
    pub fn set_status(&self, experiment_id: i64, status: ExperimentStatus) -> Result<Experiment> {
        let experiment = self.store.mutate(None, |doc| {
            let (index, row) =
                find(doc, experiment_id).ok_or(Error::UnknownExperiment(experiment_id))?;
            let mut experiment = Experiment::from_record(row)?;
            if !experiment.status().can_transition_to(status) {
                return Err(Error::InvalidTransition {
                    experiment_id,
                    from: experiment.status().to_string(),
                    to: status.to_string(),
                });
            }
            experiment.set_status(status);
            doc.table_mut(EXPERIMENTS).records_mut()[index] = experiment.to_record();
            Ok(experiment)
        })?;
        tracing::info!(experiment_id, status = %status, "experiment status changed");
        Ok(experiment)
    }

    /// Delete an experiment.
    ///
    /// Without `cascade` the delete fails while any row references the
    /// experiment through a declared foreign key; with `cascade` those rows
    /// are removed too. Returns the number of referencing rows removed.
    ///
    /// # Errors
    ///
    /// Returns `UnknownExperiment`, or `InvalidInput` naming the referencing
    /// tables when `cascade` is off.
    pub fn delete(&self, experiment_id: i64, cascade: bool) -> Result<usize> {
        let schema = Arc::clone(self.store.schema());
        let key = KeyTuple::single(&Value::from(experiment_id));
        let references: Vec<(String, String)> = schema
            .tables()
            .flat_map(|t| {
                t.foreign_keys()
                    .iter()
                    .filter(|fk| fk.references_table == EXPERIMENTS)
                    .map(move |fk| (t.name().to_string(), fk.column.clone()))
            })
            .collect();
        let matches = |row: &Record, column: &str| {
            row.get(column).is_some_and(|v| KeyTuple::single(v) == key)
        };

        let removed = self.store.mutate(None, |doc| {
            let (index, _) =
                find(doc, experiment_id).ok_or(Error::UnknownExperiment(experiment_id))?;

            let referencing: Vec<(&str, usize)> = references
                .iter()
                .filter_map(|(table, column)| {
                    let count = doc
                        .table(table)?
                        .records()
                        .iter()
                        .filter(|r| matches(r, column))
                        .count();
                    (count > 0).then_some((table.as_str(), count))
                })
                .collect();
            let removed: usize = referencing.iter().map(|(_, n)| n).sum();
            if !cascade && removed > 0 {
                let tables: Vec<String> = referencing
                    .iter()
                    .map(|(t, n)| format!("{t} ({n})"))
                    .collect();
                return Err(Error::InvalidInput(format!(
                    "experiment {experiment_id} is still referenced by {}; delete with cascade",
                    tables.join(", ")
                )));
            }

            for (table, column) in &references {
                if doc.table(table).is_none() {
                    continue;
                }
                doc.table_mut(table)
                    .records_mut()
                    .retain(|r| !matches(r, column));
            }
            doc.table_mut(EXPERIMENTS).records_mut().remove(index);
            Ok(removed)
        })?;
        tracing::info!(experiment_id, cascade, removed, "experiment deleted");
        Ok(removed)
    }

    /// Record a KPI for an existing experiment.
    ///
    /// # Errors
    ///
    /// Returns `UnknownExperiment` if the experiment does not exist.
    pub fn add_kpi(&self, builder: KpiRecordBuilder) -> Result<KpiRecord> {
        let schema = Arc::clone(self.store.schema());
        let experiment_id = builder.experiment_id();
        self.store.mutate(Some(KPIS), |doc| {
            if find(doc, experiment_id).is_none() {
                return Err(Error::UnknownExperiment(experiment_id));
            }
            let kpi = builder.build(next_id(doc, KPIS, "kpi_id"));
            let rows = doc.table_mut(KPIS).records_mut();
            let row = schema.validate_record(KPIS, rows.len(), &kpi.to_record())?;
            rows.push(row);
            Ok(kpi)
        })
    }

    /// KPIs of an experiment in insertion order.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if a row is malformed.
    pub fn kpis(&self, experiment_id: i64) -> Result<Vec<KpiRecord>> {
        let document = self.store.snapshot();
        let Some(table) = document.table(KPIS) else {
            return Ok(Vec::new());
        };
        table
            .records()
            .iter()
            .filter(|r| r.get("experiment_id").and_then(Value::as_i64) == Some(experiment_id))
            .map(KpiRecord::from_record)
            .collect()
    }

    /// Leakage guard at the experiment's cutoff.
    ///
    /// # Errors
    ///
    /// Returns `UnknownExperiment` if absent.
    pub fn guard(&self, experiment_id: i64, horizon_months: u32) -> Result<LeakageGuard> {
        let experiment = self.get(experiment_id)?;
        Ok(LeakageGuard::for_experiment(
            Arc::clone(self.store.schema()),
            &experiment,
            horizon_months,
        ))
    }
}

fn find(document: &Document, experiment_id: i64) -> Option<(usize, &Record)> {
    document.table(EXPERIMENTS)?.records().iter().enumerate().find(|(_, r)| {
        r.get("experiment_id").and_then(Value::as_i64) == Some(experiment_id)
    })
}

fn next_id(document: &Document, table: &str, column: &str) -> i64 {
    document
        .table(table)
        .and_then(|t| t.records().iter().filter_map(|r| r.get(column)?.as_i64()).max())
        .map_or(1, |max| max + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::period::Period;
    use crate::schema::SchemaRegistry;
    use crate::value::record;

    fn p(v: i64) -> Period {
        Period::from_yyyymm(v).unwrap()
    }

    fn open(dir: &tempfile::TempDir) -> TableStore {
        TableStore::open(
            dir.path().join("db.json"),
            Arc::new(SchemaRegistry::churn_default()),
            StoreConfig::default(),
        )
        .unwrap()
    }

    fn builder(name: &str) -> ExperimentBuilder {
        Experiment::builder(name, p(202_201), p(202_312), p(202_401), p(202_406))
    }

    #[test]
    fn test_ids_are_max_plus_one() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let experiments = ExperimentStore::new(&store);
        assert_eq!(experiments.create(builder("a")).unwrap().experiment_id(), 1);
        assert_eq!(experiments.create(builder("b")).unwrap().experiment_id(), 2);
        experiments.delete(1, false).unwrap();
        assert_eq!(experiments.create(builder("c")).unwrap().experiment_id(), 3);
        assert_eq!(experiments.list().unwrap().len(), 2);
    }

    #[test]
    fn test_invalid_transition() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let experiments = ExperimentStore::new(&store);
        let id = experiments.create(builder("a")).unwrap().experiment_id();
        let err = experiments.set_status(id, ExperimentStatus::Completed).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        experiments.set_status(id, ExperimentStatus::Running).unwrap();
        experiments.set_status(id, ExperimentStatus::Completed).unwrap();
        assert_eq!(experiments.get(id).unwrap().status(), ExperimentStatus::Completed);
    }

    #[test]
    fn test_delete_requires_cascade_when_referenced() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let experiments = ExperimentStore::new(&store);
        let id = experiments.create(builder("a")).unwrap().experiment_id();
        experiments.add_kpi(KpiRecord::builder(id, "auc", Some(0.8))).unwrap();
        store
            .append_records(
                "backtest_results",
                vec![record([
                    ("customer_id", Value::from(1)),
                    ("experiment_id", Value::from(id)),
                    ("period", Value::from(202_401)),
                    ("churn_probability", Value::from(0.4)),
                ])],
            )
            .unwrap();

        assert!(matches!(experiments.delete(id, false), Err(Error::InvalidInput(_))));
        assert_eq!(experiments.delete(id, true).unwrap(), 2);
        assert!(matches!(experiments.get(id), Err(Error::UnknownExperiment(_))));
        assert!(store.get_table("backtest_results").unwrap().is_empty());
    }

    #[test]
    fn test_kpi_for_unknown_experiment() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let experiments = ExperimentStore::new(&store);
        let err = experiments.add_kpi(KpiRecord::builder(42, "auc", Some(0.5))).unwrap_err();
        assert!(matches!(err, Error::UnknownExperiment(42)));
    }

    #[test]
    fn test_guard_uses_cutoff() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let experiments = ExperimentStore::new(&store);
        let id = experiments
            .create(builder("a").cutoff(p(202_306)))
            .unwrap()
            .experiment_id();
        let guard = experiments.guard(id, 2).unwrap();
        assert_eq!(guard.scope().cutoff().unwrap(), p(202_308));
    }
}
