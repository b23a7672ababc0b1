//! Error types for churn-store
//!
//! Every variant names the table, record, column or period that triggered it:
//! the correctness contract of the store rests on data boundaries being
//! legible to an operator.

use thiserror::Error;

use crate::period::Period;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// churn-store error types
#[derive(Error, Debug)]
pub enum Error {
    /// Persisted document is unreadable or structurally invalid
    #[error("Corrupt document {path}: {reason}\nRecover manually from a retained snapshot")]
    CorruptDocument {
        /// Document path
        path: String,
        /// What failed to parse or validate
        reason: String,
    },

    /// Table is neither stored nor declared
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    /// A record failed validation against its schema entry (write rejected)
    #[error("Schema violation in table '{table}', record {index}, column '{column}': {reason}")]
    SchemaViolation {
        /// Target table
        table: String,
        /// Zero-based record index within the rejected batch
        index: usize,
        /// Offending column
        column: String,
        /// Validation failure
        reason: String,
    },

    /// A referencing value has no match (only raised when foreign keys are enforced)
    #[error("Foreign key orphan in table '{table}', record {index}, column '{column}': value {value} not found in {references}")]
    ForeignKeyOrphan {
        /// Referencing table
        table: String,
        /// Record index within the referencing table
        index: usize,
        /// Referencing column
        column: String,
        /// Orphaned value
        value: String,
        /// Referenced `table.column`
        references: String,
    },

    /// A query or export would observe data beyond its cutoff
    #[error("Leakage violation on table '{table}' at period {period}: {reason}")]
    LeakageViolation {
        /// Offending table
        table: String,
        /// Offending period
        period: Period,
        /// What was violated
        reason: String,
    },

    /// SQL collaborator exceeded its time ceiling
    #[error("Query timed out after {timeout_ms} ms (tables: {tables})\nRetry with a narrower scope")]
    QueryTimeout {
        /// Ceiling that was hit
        timeout_ms: u128,
        /// Tables the query touched
        tables: String,
    },

    /// Document lock could not be acquired within the time budget
    #[error("Timed out after {waited_ms} ms waiting for document lock {path}")]
    LockTimeout {
        /// Lock file path
        path: String,
        /// Time spent waiting
        waited_ms: u128,
    },

    /// Value is not a valid YYYYMM period
    #[error("Invalid period: {0}")]
    InvalidPeriod(String),

    /// Experiment id not present in the experiments table
    #[error("Unknown experiment: {0}")]
    UnknownExperiment(i64),

    /// Experiment status change not allowed by the lifecycle
    #[error("Experiment {experiment_id}: invalid status transition {from} -> {to}")]
    InvalidTransition {
        /// Experiment id
        experiment_id: i64,
        /// Current status
        from: String,
        /// Requested status
        to: String,
    },

    /// Staged outbox batch could not be read
    #[error("Invalid staged batch {batch}: {reason}")]
    InvalidBatch {
        /// Batch source identifier
        batch: String,
        /// What failed
        reason: String,
    },

    /// Configuration or schema file could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    /// Query parsing error
    #[error("SQL parse error: {0}")]
    ParseError(String),

    /// SQL collaborator reported a failure
    #[error("Query failed: {0}")]
    Query(String),

    /// Invalid argument
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Arrow error
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
}

impl Error {
    pub(crate) fn corrupt(path: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        Self::CorruptDocument {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}
