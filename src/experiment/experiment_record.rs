//! Experiment Record - one analysis run and its temporal windows

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::period::Period;
use crate::value::{record, Record, Value};
use crate::{Error, Result};

/// Lifecycle state of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentStatus {
    /// Registered, not started.
    Created,
    /// Pipeline is producing outputs.
    Running,
    /// Outputs imported.
    Completed,
    /// Pipeline failed.
    Failed,
}

impl ExperimentStatus {
    /// Stored spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// `created → running → completed | failed`, and `created → failed`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Running | Self::Failed)
                | (Self::Running, Self::Completed | Self::Failed)
        )
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExperimentStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(Error::InvalidInput(format!("unknown experiment status '{other}'"))),
        }
    }
}

/// Experiment Record represents one analysis run.
///
/// The cutoff is the reference period the leakage guard uses for queries
/// and exports scoped to this experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Experiment {
    experiment_id: i64,
    name: String,
    training_from: Period,
    training_to: Period,
    backtest_from: Period,
    backtest_to: Period,
    cutoff: Period,
    model_type: String,
    feature_set: Option<String>,
    status: ExperimentStatus,
    created_at: DateTime<Utc>,
}

impl Experiment {
    /// Create a builder with the required windows.
    #[must_use]
    pub fn builder(
        name: impl Into<String>,
        training_from: Period,
        training_to: Period,
        backtest_from: Period,
        backtest_to: Period,
    ) -> ExperimentBuilder {
        ExperimentBuilder::new(name, training_from, training_to, backtest_from, backtest_to)
    }

    /// Get the experiment ID.
    #[must_use]
    pub const fn experiment_id(&self) -> i64 {
        self.experiment_id
    }

    /// Get the experiment name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// First training period.
    #[must_use]
    pub const fn training_from(&self) -> Period {
        self.training_from
    }

    /// Last training period.
    #[must_use]
    pub const fn training_to(&self) -> Period {
        self.training_to
    }

    /// First backtest period.
    #[must_use]
    pub const fn backtest_from(&self) -> Period {
        self.backtest_from
    }

    /// Last backtest period.
    #[must_use]
    pub const fn backtest_to(&self) -> Period {
        self.backtest_to
    }

    /// Leakage cutoff.
    #[must_use]
    pub const fn cutoff(&self) -> Period {
        self.cutoff
    }

    /// Model type (`cox`, `binary`, ...).
    #[must_use]
    pub fn model_type(&self) -> &str {
        &self.model_type
    }

    /// Feature set, if recorded.
    #[must_use]
    pub fn feature_set(&self) -> Option<&str> {
        self.feature_set.as_deref()
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn status(&self) -> ExperimentStatus {
        self.status
    }

    /// Get the creation timestamp.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub(crate) fn set_status(&mut self, status: ExperimentStatus) {
        self.status = status;
    }

    /// Row of the `experiments` table.
    #[must_use]
    pub fn to_record(&self) -> Record {
        record([
            ("experiment_id", Value::from(self.experiment_id)),
            ("experiment_name", Value::from(self.name.as_str())),
            ("training_from", Value::from(self.training_from)),
            ("training_to", Value::from(self.training_to)),
            ("backtest_from", Value::from(self.backtest_from)),
            ("backtest_to", Value::from(self.backtest_to)),
            ("cutoff", Value::from(self.cutoff)),
            ("model_type", Value::from(self.model_type.as_str())),
            ("feature_set", Value::from(self.feature_set.clone())),
            ("status", Value::from(self.status.as_str())),
            ("created_at", Value::from(self.created_at.to_rfc3339())),
        ])
    }

    /// Parse a row of the `experiments` table.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` naming the field if the row is malformed.
    pub fn from_record(row: &Record) -> Result<Self> {
        let experiment_id = field(row, "experiment_id")?
            .as_i64()
            .ok_or_else(|| Error::InvalidInput("experiment_id is not an integer".to_string()))?;
        let created_at = DateTime::parse_from_rfc3339(&text(row, "created_at")?)
            .map_err(|e| Error::InvalidInput(format!("experiment {experiment_id} created_at: {e}")))?
            .with_timezone(&Utc);
        Ok(Self {
            experiment_id,
            name: text(row, "experiment_name")?,
            training_from: period(row, "training_from")?,
            training_to: period(row, "training_to")?,
            backtest_from: period(row, "backtest_from")?,
            backtest_to: period(row, "backtest_to")?,
            cutoff: period(row, "cutoff")?,
            model_type: text(row, "model_type")?,
            feature_set: row.get("feature_set").and_then(Value::as_str).map(str::to_string),
            status: text(row, "status")?.parse()?,
            created_at,
        })
    }
}

fn field<'r>(row: &'r Record, name: &str) -> Result<&'r Value> {
    row.get(name)
        .filter(|v| !v.is_null())
        .ok_or_else(|| Error::InvalidInput(format!("experiments row lacks '{name}'")))
}

fn text(row: &Record, name: &str) -> Result<String> {
    field(row, name)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidInput(format!("experiments field '{name}' is not text")))
}

fn period(row: &Record, name: &str) -> Result<Period> {
    Period::try_from(field(row, name)?)
}

/// Builder for `Experiment`.
#[derive(Debug)]
pub struct ExperimentBuilder {
    name: String,
    training_from: Period,
    training_to: Period,
    backtest_from: Period,
    backtest_to: Period,
    cutoff: Option<Period>,
    model_type: String,
    feature_set: Option<String>,
    created_at: DateTime<Utc>,
}

impl ExperimentBuilder {
    /// Create a new builder with required fields.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        training_from: Period,
        training_to: Period,
        backtest_from: Period,
        backtest_to: Period,
    ) -> Self {
        Self {
            name: name.into(),
            training_from,
            training_to,
            backtest_from,
            backtest_to,
            cutoff: None,
            model_type: "cox".to_string(),
            feature_set: Some("standard".to_string()),
            created_at: Utc::now(),
        }
    }

    /// Set the leakage cutoff (defaults to the last training period).
    #[must_use]
    pub const fn cutoff(mut self, cutoff: Period) -> Self {
        self.cutoff = Some(cutoff);
        self
    }

    /// Set the model type.
    #[must_use]
    pub fn model_type(mut self, model_type: impl Into<String>) -> Self {
        self.model_type = model_type.into();
        self
    }

    /// Set or clear the feature set.
    #[must_use]
    pub fn feature_set(mut self, feature_set: Option<String>) -> Self {
        self.feature_set = feature_set;
        self
    }

    /// Set a custom creation timestamp (useful for testing).
    #[must_use]
    pub const fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Build the `Experiment` with the given id, in status `created`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if a window ends before it starts.
    pub fn build(self, experiment_id: i64) -> Result<Experiment> {
        if self.training_from > self.training_to {
            return Err(Error::InvalidInput(format!(
                "training window {}..{} ends before it starts",
                self.training_from, self.training_to
            )));
        }
        if self.backtest_from > self.backtest_to {
            return Err(Error::InvalidInput(format!(
                "backtest window {}..{} ends before it starts",
                self.backtest_from, self.backtest_to
            )));
        }
        Ok(Experiment {
            experiment_id,
            name: self.name,
            training_from: self.training_from,
            training_to: self.training_to,
            backtest_from: self.backtest_from,
            backtest_to: self.backtest_to,
            cutoff: self.cutoff.unwrap_or(self.training_to),
            model_type: self.model_type,
            feature_set: self.feature_set,
            status: ExperimentStatus::Created,
            created_at: self.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(v: i64) -> Period {
        Period::from_yyyymm(v).unwrap()
    }

    #[test]
    fn test_cutoff_defaults_to_training_end() {
        let exp = Experiment::builder("baseline", p(202_201), p(202_312), p(202_401), p(202_406))
            .build(1)
            .unwrap();
        assert_eq!(exp.cutoff(), p(202_312));
        assert_eq!(exp.status(), ExperimentStatus::Created);
    }

    #[test]
    fn test_inverted_window_rejected() {
        let result = Experiment::builder("bad", p(202_312), p(202_201), p(202_401), p(202_406)).build(1);
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_record_roundtrip() {
        let exp = Experiment::builder("x", p(202_201), p(202_312), p(202_401), p(202_406))
            .cutoff(p(202_311))
            .model_type("binary")
            .feature_set(None)
            .build(4)
            .unwrap();
        let back = Experiment::from_record(&exp.to_record()).unwrap();
        assert_eq!(back.experiment_id(), 4);
        assert_eq!(back.cutoff(), p(202_311));
        assert_eq!(back.feature_set(), None);
        assert_eq!(back.created_at().timestamp(), exp.created_at().timestamp());
    }

    #[test]
    fn test_status_lifecycle() {
        use ExperimentStatus::{Completed, Created, Failed, Running};
        assert!(Created.can_transition_to(Running));
        assert!(Created.can_transition_to(Failed));
        assert!(Running.can_transition_to(Completed));
        assert!(!Created.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
        assert_eq!("failed".parse::<ExperimentStatus>().unwrap(), Failed);
    }
}
