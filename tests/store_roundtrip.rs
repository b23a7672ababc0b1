//! Table store persistence tests
//!
//! Round-trip, atomic writes, snapshot rotation and corrupt-document
//! handling against real files in a temp directory.

mod common;

use std::io;
use std::sync::{Arc, Mutex};

use churn_store::config::{ForeignKeyPolicy, StoreConfig};
use churn_store::schema::SchemaRegistry;
use churn_store::store::{list_snapshots, lock_path, TableStore};
use churn_store::value::Value;
use churn_store::{Database, Error};
use common::{backtest, config, file, open, panel};

/// In-memory log sink for asserting on emitted events.
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn count(&self, needle: &str) -> usize {
        String::from_utf8_lossy(&self.0.lock().unwrap()).matches(needle).count()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLogs {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn store(config: StoreConfig) -> TableStore {
    TableStore::open(
        config.document_path.clone(),
        Arc::new(SchemaRegistry::churn_default()),
        config,
    )
    .unwrap()
}

#[test]
fn test_save_then_load_roundtrips() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path());
    db.append_records("files", vec![file(1, "jan.csv"), file(2, "feb.csv")])
        .unwrap();
    db.append_records("rawdata", vec![panel(7, 202_401, None), panel(7, 202_402, Some(202_402))])
        .unwrap();
    let before = db.store().snapshot();
    db.close().unwrap();

    let reopened = open(dir.path());
    let after = reopened.store().snapshot();
    assert_eq!(before.tables().collect::<Vec<_>>(), after.tables().collect::<Vec<_>>());
    assert_eq!(reopened.store().get_table("rawdata").unwrap().len(), 2);
}

#[test]
#[allow(clippy::excessive_precision)]
fn test_probabilities_reload_bit_exact() {
    let dir = tempfile::tempdir().unwrap();
    let probabilities = [
        0.1 + 0.2,
        1.0 / 3.0,
        0.123_456_789_012_345_67,
        0.999_999_999_999_999_9,
        std::f64::consts::FRAC_1_SQRT_2,
    ];
    let db = open(dir.path());
    let rows = (1..)
        .zip(probabilities)
        .map(|(customer, prob)| backtest(customer, 1, 202_401, prob))
        .collect();
    db.append_records("backtest_results", rows).unwrap();
    db.close().unwrap();

    let reopened = open(dir.path());
    let reloaded: Vec<u64> = reopened
        .store()
        .get_table("backtest_results")
        .unwrap()
        .records()
        .iter()
        .map(|r| r["churn_probability"].as_f64().unwrap().to_bits())
        .collect();
    let expected: Vec<u64> = probabilities.iter().map(|p| p.to_bits()).collect();
    assert_eq!(reloaded, expected);
}

#[test]
fn test_failed_close_is_not_retried_on_drop() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocked");
    let cfg = StoreConfig {
        document_path: blocker.join("churn_database.json"),
        autosave: false,
        ..config(dir.path())
    };
    let logs = CapturedLogs::default();

    let subscriber = tracing_subscriber::fmt().with_writer(logs.clone()).finish();
    tracing::subscriber::with_default(subscriber, || {
        let db = Database::builder().config(cfg.clone()).build().unwrap();
        db.append_records("files", vec![file(1, "jan.csv")]).unwrap();
        // The document's parent directory can no longer be created.
        std::fs::write(&blocker, b"not a directory").unwrap();
        assert!(db.close().is_err());
    });
    assert_eq!(logs.count("flush on drop failed"), 0);

    // Without an explicit close, teardown makes its single attempt.
    let subscriber = tracing_subscriber::fmt().with_writer(logs.clone()).finish();
    tracing::subscriber::with_default(subscriber, || {
        let db = Database::builder().config(cfg).build().unwrap();
        assert!(db.store().is_dirty());
    });
    assert_eq!(logs.count("flush on drop failed"), 1);
    assert!(blocker.is_file());
}

#[test]
fn test_failed_append_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path());
    db.append_records("files", vec![file(1, "jan.csv")]).unwrap();
    let on_disk = std::fs::read(db.store().path()).unwrap();

    let mut bad = file(3, "mar.csv");
    bad.insert("file_name".into(), Value::from(42));
    let err = db
        .append_records("files", vec![file(2, "feb.csv"), bad])
        .unwrap_err();
    match err {
        Error::SchemaViolation { table, index, column, .. } => {
            assert_eq!(table, "files");
            assert_eq!(index, 1);
            assert_eq!(column, "file_name");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(db.store().get_table("files").unwrap().len(), 1);
    assert_eq!(std::fs::read(db.store().path()).unwrap(), on_disk);
}

#[test]
fn test_unknown_table() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path());
    assert!(matches!(db.store().get_table("customers"), Err(Error::UnknownTable(_))));
    assert!(matches!(
        db.append_records("customers", vec![file(1, "x")]),
        Err(Error::UnknownTable(_))
    ));
}

#[test]
fn test_corrupt_document_is_reported_and_state_kept() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let store = store(cfg.clone());
    store.append_records("files", vec![file(1, "jan.csv")]).unwrap();

    std::fs::write(&cfg.document_path, b"{\"tables\": {\"files\": [{\"file_id\": 1}, {\"x\": 2}]}}")
        .unwrap();
    let err = store.load().unwrap_err();
    assert!(matches!(err, Error::CorruptDocument { .. }));
    assert!(err.to_string().contains("files"));
    assert_eq!(store.get_table("files").unwrap().len(), 1);

    std::fs::write(&cfg.document_path, b"not json").unwrap();
    let path = cfg.document_path.clone();
    assert!(matches!(
        TableStore::open(path, Arc::new(SchemaRegistry::churn_default()), cfg),
        Err(Error::CorruptDocument { .. })
    ));
}

#[test]
fn test_snapshots_are_rotated() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = StoreConfig {
        snapshot_on_save: true,
        max_snapshots: 2,
        ..config(dir.path())
    };
    let store = store(cfg.clone());
    for id in 1..=5 {
        store.append_records("files", vec![file(id, "f.csv")]).unwrap();
        // Snapshot names carry a timestamp; keep them distinct.
        std::thread::sleep(std::time::Duration::from_millis(20));
    }
    let snapshots = list_snapshots(&cfg.document_path).unwrap();
    assert!(!snapshots.is_empty());
    assert!(snapshots.len() <= 2);
    assert!(!lock_path(&cfg.document_path).exists());
}

#[test]
fn test_autosave_off_defers_until_flush() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = StoreConfig {
        autosave: false,
        ..config(dir.path())
    };
    let store = store(cfg.clone());
    store.append_records("files", vec![file(1, "jan.csv")]).unwrap();
    assert!(store.is_dirty());
    assert!(!cfg.document_path.exists());

    store.flush().unwrap();
    assert!(!store.is_dirty());
    assert!(cfg.document_path.exists());
}

#[test]
fn test_drop_flushes_unsaved_changes() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = StoreConfig {
        autosave: false,
        ..config(dir.path())
    };
    {
        let db = Database::builder().config(cfg.clone()).build().unwrap();
        db.append_records("files", vec![file(1, "jan.csv")]).unwrap();
    }
    let reopened = Database::builder().config(cfg).build().unwrap();
    assert_eq!(reopened.store().get_table("files").unwrap().len(), 1);
}

#[test]
fn test_enforced_foreign_keys_reject_orphans() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(StoreConfig {
        foreign_keys: ForeignKeyPolicy::Enforce,
        ..config(dir.path())
    });
    let err = store
        .append_records("backtest_results", vec![backtest(1, 99, 202_401, 0.3)])
        .unwrap_err();
    assert!(matches!(err, Error::ForeignKeyOrphan { .. }));
    assert!(store.get_table("backtest_results").unwrap().is_empty());
}

#[test]
fn test_diagnostic_foreign_keys_report_orphans() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path());
    db.append_records("backtest_results", vec![backtest(1, 99, 202_401, 0.3)])
        .unwrap();
    let report = db.validate_foreign_keys();
    assert!(!report.is_clean());
    assert_eq!(report.orphans[0].table, "backtest_results");
    assert_eq!(report.orphans[0].value, Value::from(99));
}

#[test]
fn test_statistics_and_schema_report() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path());
    db.append_records("rawdata", vec![panel(1, 202_312, None), panel(1, 202_402, None)])
        .unwrap();
    let stats = db.table_statistics();
    let rawdata = stats.iter().find(|s| s.table == "rawdata").unwrap();
    assert_eq!(rawdata.record_count, 2);
    assert_eq!(rawdata.key_columns, vec!["customer_id", "period"]);
    let (min, max) = rawdata.period_range.unwrap();
    assert_eq!((min.yyyymm(), max.yyyymm()), (202_312, 202_402));

    assert!(db.validate_schema().is_valid());
}
