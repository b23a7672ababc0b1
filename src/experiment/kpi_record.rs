//! KPI Record - scalar metrics recorded for an experiment

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::value::{record, Record, Value};
use crate::{Error, Result};

/// KPI Record represents one named metric of an experiment.
///
/// Metrics are grouped by `metric_type` (`training`, `validation`,
/// `backtest`). Values are stored rounded to four decimals.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KpiRecord {
    kpi_id: i64,
    experiment_id: i64,
    metric_name: String,
    metric_value: Option<f64>,
    metric_type: String,
    calculated_at: DateTime<Utc>,
}

impl KpiRecord {
    /// Create a builder for a metric of `experiment_id`.
    #[must_use]
    pub fn builder(
        experiment_id: i64,
        metric_name: impl Into<String>,
        metric_value: Option<f64>,
    ) -> KpiRecordBuilder {
        KpiRecordBuilder::new(experiment_id, metric_name, metric_value)
    }

    /// Get the KPI ID.
    #[must_use]
    pub const fn kpi_id(&self) -> i64 {
        self.kpi_id
    }

    /// Get the parent experiment ID.
    #[must_use]
    pub const fn experiment_id(&self) -> i64 {
        self.experiment_id
    }

    /// Get the metric name (e.g. "auc", "c_index").
    #[must_use]
    pub fn metric_name(&self) -> &str {
        &self.metric_name
    }

    /// Get the metric value, if one was computed.
    #[must_use]
    pub const fn metric_value(&self) -> Option<f64> {
        self.metric_value
    }

    /// Get the metric type.
    #[must_use]
    pub fn metric_type(&self) -> &str {
        &self.metric_type
    }

    /// Get the timestamp when the metric was recorded.
    #[must_use]
    pub const fn calculated_at(&self) -> DateTime<Utc> {
        self.calculated_at
    }

    /// Row of the `experiment_kpis` table.
    #[must_use]
    pub fn to_record(&self) -> Record {
        record([
            ("kpi_id", Value::from(self.kpi_id)),
            ("experiment_id", Value::from(self.experiment_id)),
            ("metric_name", Value::from(self.metric_name.as_str())),
            ("metric_value", Value::from(self.metric_value)),
            ("metric_type", Value::from(self.metric_type.as_str())),
            ("calculated_at", Value::from(self.calculated_at.to_rfc3339())),
        ])
    }

    /// Parse a row of the `experiment_kpis` table.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if an id or the metric name is missing.
    pub fn from_record(row: &Record) -> Result<Self> {
        let int = |name: &str| {
            row.get(name)
                .and_then(Value::as_i64)
                .ok_or_else(|| Error::InvalidInput(format!("experiment_kpis row lacks '{name}'")))
        };
        let kpi_id = int("kpi_id")?;
        Ok(Self {
            kpi_id,
            experiment_id: int("experiment_id")?,
            metric_name: row
                .get("metric_name")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| Error::InvalidInput(format!("kpi {kpi_id} lacks a metric name")))?,
            metric_value: row.get("metric_value").and_then(Value::as_f64),
            metric_type: row
                .get("metric_type")
                .and_then(Value::as_str)
                .unwrap_or("backtest")
                .to_string(),
            calculated_at: row
                .get("calculated_at")
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map_or_else(Utc::now, |t| t.with_timezone(&Utc)),
        })
    }
}

/// Builder for `KpiRecord`.
#[derive(Debug)]
pub struct KpiRecordBuilder {
    experiment_id: i64,
    metric_name: String,
    metric_value: Option<f64>,
    metric_type: String,
    calculated_at: DateTime<Utc>,
}

impl KpiRecordBuilder {
    /// Create a new builder with required fields.
    #[must_use]
    pub fn new(experiment_id: i64, metric_name: impl Into<String>, metric_value: Option<f64>) -> Self {
        Self {
            experiment_id,
            metric_name: metric_name.into(),
            metric_value,
            metric_type: "backtest".to_string(),
            calculated_at: Utc::now(),
        }
    }

    /// Set the metric type.
    #[must_use]
    pub fn metric_type(mut self, metric_type: impl Into<String>) -> Self {
        self.metric_type = metric_type.into();
        self
    }

    /// Set a custom timestamp.
    #[must_use]
    pub const fn calculated_at(mut self, calculated_at: DateTime<Utc>) -> Self {
        self.calculated_at = calculated_at;
        self
    }

    /// Parent experiment.
    #[must_use]
    pub const fn experiment_id(&self) -> i64 {
        self.experiment_id
    }

    /// Build the `KpiRecord` with the given id.
    #[must_use]
    pub fn build(self, kpi_id: i64) -> KpiRecord {
        KpiRecord {
            kpi_id,
            experiment_id: self.experiment_id,
            metric_name: self.metric_name,
            metric_value: self.metric_value.map(round4),
            metric_type: self.metric_type,
            calculated_at: self.calculated_at,
        }
    }
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}
