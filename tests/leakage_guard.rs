//! Leakage guard tests
//!
//! Calendar-correct cutoffs, outcome masking, scope validation and guarded
//! exports.

mod common;

use std::sync::Arc;

use churn_store::experiment::Experiment;
use churn_store::guard::{Admission, LeakageGuard, MaterializedView};
use churn_store::schema::SchemaRegistry;
use churn_store::store::Table;
use churn_store::value::{Record, Value};
use churn_store::Error;
use common::{backtest, open, p, panel};

fn guard(reference: i64, horizon: u32) -> LeakageGuard {
    LeakageGuard::configure(Arc::new(SchemaRegistry::churn_default()), p(reference), horizon)
}

fn periods(table: &Table) -> Vec<i64> {
    table
        .records()
        .iter()
        .filter_map(|r| r["period"].as_i64())
        .collect()
}

#[test]
fn test_horizon_crosses_year_boundary() {
    let table = Table::new(vec![
        panel(1, 202_412, None),
        panel(1, 202_501, None),
        panel(1, 202_502, None),
    ]);
    let guarded = guard(202_412, 1).filter_rows("rawdata", &table, "period").unwrap();
    assert_eq!(periods(guarded.table()), vec![202_412, 202_501]);
    assert_eq!(guarded.excluded(), 1);
}

#[test]
fn test_zero_horizon_is_strict() {
    let table = Table::new(vec![panel(1, 202_311, None), panel(1, 202_312, None), panel(1, 202_401, None)]);
    let guarded = guard(202_312, 0).filter_rows("rawdata", &table, "period").unwrap();
    assert_eq!(periods(guarded.table()), vec![202_311, 202_312]);
}

#[test]
fn test_rows_are_excluded_not_mutated() {
    let table = Table::new(vec![panel(1, 202_312, None), panel(2, 202_312, None)]);
    let guarded = guard(202_312, 0).filter_rows("rawdata", &table, "period").unwrap();
    assert_eq!(guarded.table(), &table);
}

#[test]
fn test_future_churn_is_masked() {
    let table = Table::new(vec![panel(1, 202_310, Some(202_312)), panel(2, 202_310, Some(202_402))]);
    let guarded = guard(202_312, 0).guard_table("rawdata", &table).unwrap();
    let churn: Vec<&Value> = guarded.table().records().iter().map(|r| &r["churn_period"]).collect();
    assert_eq!(churn, vec![&Value::from(202_312), &Value::Null]);
    assert_eq!(guarded.masked(), 1);
    // Stored input untouched
    assert_eq!(table.records()[1]["churn_period"], Value::from(202_402));
}

#[test]
fn test_null_period_excluded_and_malformed_period_fatal() {
    let mut unknown = panel(1, 202_301, None);
    unknown.insert("period".into(), Value::Null);
    let guarded = guard(202_312, 0)
        .filter_rows("rawdata", &Table::new(vec![unknown]), "period")
        .unwrap();
    assert!(guarded.table().is_empty());

    let mut malformed: Record = panel(1, 202_301, None);
    malformed.insert("period".into(), Value::from(202_313));
    let err = guard(202_312, 0)
        .filter_rows("rawdata", &Table::new(vec![panel(2, 202_301, None), malformed]), "period")
        .unwrap_err();
    match err {
        Error::LeakageViolation { table, reason, .. } => {
            assert_eq!(table, "rawdata");
            assert!(reason.contains("record 1"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_unfiltered_table_is_a_violation() {
    let guard = guard(202_312, 0);
    let mut view = MaterializedView::new();
    view.insert_unfiltered("rawdata", Table::new(vec![panel(1, 202_401, None)]));
    let err = guard.validate_query_scope(&view, &["rawdata"]).unwrap_err();
    match err {
        Error::LeakageViolation { table, period, .. } => {
            assert_eq!(table, "rawdata");
            assert_eq!(period, p(202_312));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(guard.validate_query_scope(&view, &["backtest_results"]).is_err());
}

#[test]
fn test_later_filtered_scope_is_incompatible() {
    let schema = Arc::new(SchemaRegistry::churn_default());
    let wide = LeakageGuard::configure(Arc::clone(&schema), p(202_312), 3);
    let strict = LeakageGuard::configure(schema, p(202_312), 0);
    let table = Table::new(vec![panel(1, 202_401, None)]);

    let mut view = MaterializedView::new();
    view.insert(wide.guard_table("rawdata", &table).unwrap());
    assert!(wide.validate_query_scope(&view, &["rawdata"]).is_ok());
    assert!(matches!(
        strict.validate_query_scope(&view, &["rawdata"]),
        Err(Error::LeakageViolation { .. })
    ));
}

#[test]
fn test_time_invariant_tables_pass_whole() {
    let guard = guard(202_312, 0);
    let files = Table::new(vec![common::file(1, "jan.csv")]);
    let guarded = guard.guard_table("files", &files).unwrap();
    assert_eq!(guarded.admission(), &Admission::TimeInvariant);
    assert_eq!(guarded.table().len(), 1);

    let mut view = MaterializedView::new();
    view.insert_unfiltered("files", files);
    assert!(guard.validate_query_scope(&view, &["files"]).is_ok());
}

#[test]
fn test_materialize_admits_declared_empty_tables() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path());
    let guard = guard(202_312, 0);
    let view = guard
        .materialize(&db.store().snapshot(), &["rawdata", "files"])
        .unwrap();
    assert_eq!(view.table_names(), vec!["files", "rawdata"]);
    assert!(matches!(
        guard.materialize(&db.store().snapshot(), &["customers"]),
        Err(Error::UnknownTable(_))
    ));
}

#[test]
fn test_export_experiment_writes_guarded_rows() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path());
    let id = db
        .experiments()
        .create(
            Experiment::builder("baseline", p(202_201), p(202_312), p(202_401), p(202_406))
                .cutoff(p(202_312)),
        )
        .unwrap()
        .experiment_id();
    db.append_records(
        "backtest_results",
        vec![
            backtest(1, id, 202_312, 0.1),
            backtest(1, id, 202_401, 0.2),
            backtest(1, id, 202_402, 0.3),
        ],
    )
    .unwrap();

    let written = db
        .export_experiment("exports", id, 1, &["backtest_results"])
        .unwrap();
    assert_eq!(written.len(), 1);
    let rows: Vec<Record> = serde_json::from_slice(&std::fs::read(&written[0]).unwrap()).unwrap();
    let exported: Vec<i64> = rows.iter().filter_map(|r| r["period"].as_i64()).collect();
    assert_eq!(exported, vec![202_312, 202_401]);
    assert!(written[0].ends_with("exports/experiment_1/backtest_results.json"));
}
