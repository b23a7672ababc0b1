//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::path::Path;

use churn_store::config::StoreConfig;
use churn_store::period::Period;
use churn_store::value::{record, Record, Value};
use churn_store::Database;

pub fn p(yyyymm: i64) -> Period {
    Period::from_yyyymm(yyyymm).unwrap()
}

/// Config rooted in a temp directory, isolated from the environment.
pub fn config(dir: &Path) -> StoreConfig {
    StoreConfig {
        document_path: dir.join("churn_database.json"),
        outbox_root: dir.join("outbox"),
        ..StoreConfig::default()
    }
}

pub fn open(dir: &Path) -> Database {
    Database::builder().config(config(dir)).build().unwrap()
}

pub fn file(id: i64, name: &str) -> Record {
    record([("file_id", Value::from(id)), ("file_name", Value::from(name))])
}

pub fn panel(customer: i64, period: i64, churn: Option<i64>) -> Record {
    record([
        ("customer_id", Value::from(customer)),
        ("period", Value::from(period)),
        ("file_id", Value::from(1)),
        ("is_active", Value::from(churn.is_none())),
        ("churn_period", Value::from(churn)),
    ])
}

pub fn backtest(customer: i64, experiment: i64, period: i64, probability: f64) -> Record {
    record([
        ("customer_id", Value::from(customer)),
        ("experiment_id", Value::from(experiment)),
        ("period", Value::from(period)),
        ("churn_probability", Value::from(probability)),
    ])
}
