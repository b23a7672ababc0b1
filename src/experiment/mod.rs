//! Experiment tracking over the table store
//!
//! Experiments, their KPIs and the pipeline outputs keyed by
//! `experiment_id` all live in the same document. Experiment ids are
//! allocated as the highest stored id plus one.
//!
//! ## Schema Overview
//!
//! ```text
//! Experiment (1) ──< KpiRecord (N)
//!       │
//!       ├──< backtest_results (N)
//!       ├──< customer_details (N)
//!       ├──< cox_prioritization_results (N)
//!       └──< churn_threshold_metrics (N)
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use churn_store::config::StoreConfig;
//! use churn_store::experiment::{Experiment, ExperimentStatus, ExperimentStore, KpiRecord};
//! use churn_store::period::Period;
//! use churn_store::schema::SchemaRegistry;
//! use churn_store::store::TableStore;
//!
//! let store = TableStore::open(
//!     "churn_database.json",
//!     Arc::new(SchemaRegistry::churn_default()),
//!     StoreConfig::default(),
//! )?;
//! let experiments = ExperimentStore::new(&store);
//!
//! // Register an experiment
//! let experiment = experiments.create(Experiment::builder(
//!     "baseline",
//!     Period::new(2022, 1)?,
//!     Period::new(2023, 12)?,
//!     Period::new(2024, 1)?,
//!     Period::new(2024, 6)?,
//! ))?;
//!
//! // Record a KPI and finish
//! experiments.add_kpi(KpiRecord::builder(experiment.experiment_id(), "auc", Some(0.81)))?;
//! experiments.set_status(experiment.experiment_id(), ExperimentStatus::Running)?;
//! experiments.set_status(experiment.experiment_id(), ExperimentStatus::Completed)?;
//! # Ok::<(), churn_store::Error>(())
//! ```

mod experiment_record;
mod kpi_record;
mod store;

pub use experiment_record::{Experiment, ExperimentBuilder, ExperimentStatus};
pub use kpi_record::{KpiRecord, KpiRecordBuilder};
pub use store::ExperimentStore;
