//! Query overlay tests with stand-in SQL engines

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use arrow::array::{Array, Int64Array};
use arrow::record_batch::RecordBatch;
use churn_store::config::StoreConfig;
use churn_store::experiment::Experiment;
use churn_store::guard::LeakageScope;
use churn_store::query::SqlEngine;
use churn_store::{Database, Error, Result};
use common::{backtest, config, p, panel};

/// Returns the first table it is handed and remembers what it saw.
#[derive(Default)]
struct EchoEngine {
    seen: Mutex<Vec<String>>,
}

impl SqlEngine for EchoEngine {
    fn execute(&self, _sql: &str, tables: &[(String, RecordBatch)]) -> Result<RecordBatch> {
        let mut seen = self.seen.lock().unwrap();
        seen.extend(tables.iter().map(|(name, _)| name.clone()));
        tables
            .first()
            .map(|(_, batch)| batch.clone())
            .ok_or_else(|| Error::Query("no tables".to_string()))
    }
}

struct SlowEngine(Duration);

impl SqlEngine for SlowEngine {
    fn execute(&self, _sql: &str, _tables: &[(String, RecordBatch)]) -> Result<RecordBatch> {
        std::thread::sleep(self.0);
        Err(Error::Query("too late".to_string()))
    }
}

struct FailingEngine;

impl SqlEngine for FailingEngine {
    fn execute(&self, _sql: &str, _tables: &[(String, RecordBatch)]) -> Result<RecordBatch> {
        Err(Error::Query("syntax error near FROM".to_string()))
    }
}

fn database(engine: Arc<dyn SqlEngine>, config: StoreConfig) -> Database {
    Database::builder().config(config).engine(engine).build().unwrap()
}

fn periods(batch: &RecordBatch) -> Vec<i64> {
    let index = batch.schema().index_of("period").unwrap();
    let column = batch.column(index).as_any().downcast_ref::<Int64Array>().unwrap();
    (0..column.len()).map(|i| column.value(i)).collect()
}

#[test]
fn test_query_sees_only_guarded_rows() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(EchoEngine::default());
    let db = database(engine.clone(), config(dir.path()));
    db.append_records(
        "rawdata",
        vec![panel(1, 202_411, None), panel(1, 202_412, None), panel(1, 202_501, None), panel(1, 202_502, None)],
    )
    .unwrap();

    let batch = db
        .query("SELECT * FROM rawdata WHERE is_active", LeakageScope::new(p(202_412), 1))
        .unwrap();
    assert_eq!(periods(&batch), vec![202_411, 202_412, 202_501]);
    assert_eq!(*engine.seen.lock().unwrap(), vec!["rawdata".to_string()]);
}

#[test]
fn test_only_referenced_tables_are_handed_over() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(EchoEngine::default());
    let db = database(engine.clone(), config(dir.path()));
    db.query(
        "WITH recent AS (SELECT * FROM rawdata) SELECT * FROM recent JOIN files USING (file_id)",
        LeakageScope::new(p(202_312), 0),
    )
    .unwrap();
    assert_eq!(*engine.seen.lock().unwrap(), vec!["files".to_string(), "rawdata".to_string()]);
}

#[test]
fn test_query_experiment_uses_cutoff() {
    let dir = tempfile::tempdir().unwrap();
    let db = database(Arc::new(EchoEngine::default()), config(dir.path()));
    let id = db
        .experiments()
        .create(Experiment::builder("baseline", p(202_201), p(202_312), p(202_401), p(202_406)))
        .unwrap()
        .experiment_id();
    db.append_records(
        "backtest_results",
        vec![backtest(1, id, 202_312, 0.1), backtest(1, id, 202_401, 0.2)],
    )
    .unwrap();

    let batch = db
        .query_experiment("SELECT * FROM backtest_results", id, 0)
        .unwrap();
    assert_eq!(periods(&batch), vec![202_312]);
    assert!(matches!(
        db.query_experiment("SELECT * FROM backtest_results", 99, 0),
        Err(Error::UnknownExperiment(99))
    ));
}

#[test]
fn test_slow_engine_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = StoreConfig {
        query_timeout_ms: 50,
        ..config(dir.path())
    };
    let db = database(Arc::new(SlowEngine(Duration::from_millis(500))), cfg);
    let err = db
        .query("SELECT * FROM files", LeakageScope::new(p(202_312), 0))
        .unwrap_err();
    match err {
        Error::QueryTimeout { timeout_ms, tables } => {
            assert_eq!(timeout_ms, 50);
            assert_eq!(tables, "files");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_engine_failure_is_surfaced() {
    let dir = tempfile::tempdir().unwrap();
    let db = database(Arc::new(FailingEngine), config(dir.path()));
    let err = db
        .query("SELECT * FROM files", LeakageScope::new(p(202_312), 0))
        .unwrap_err();
    assert!(err.to_string().contains("syntax error near FROM"));
}

#[test]
fn test_unparseable_and_write_statements_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let db = database(Arc::new(EchoEngine::default()), config(dir.path()));
    let scope = LeakageScope::new(p(202_312), 0);
    assert!(matches!(db.query("SELEC * FROM", scope), Err(Error::ParseError(_))));
    assert!(matches!(
        db.query("DROP TABLE rawdata", scope),
        Err(Error::ParseError(_))
    ));
    assert!(matches!(
        db.query("SELECT * FROM customers", scope),
        Err(Error::UnknownTable(_))
    ));
}

#[test]
fn test_query_without_engine() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::builder().config(config(dir.path())).build().unwrap();
    assert!(matches!(
        db.query("SELECT 1", LeakageScope::new(p(202_312), 0)),
        Err(Error::Query(_))
    ));
}
