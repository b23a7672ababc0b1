//! Query overlay: leakage-checked SQL over a materialized view
//!
//! SQL execution is delegated to a [`SqlEngine`]. This module only parses the
//! statement far enough to know which tables it touches, checks them against
//! the [`LeakageGuard`], converts the guarded tables to Arrow record batches
//! and enforces the query time ceiling.
//!
//! ## Accepted statements
//!
//! Exactly one read-only query (`SELECT`, set operations, `WITH`). Table
//! references are collected from joins, subqueries and set operations; names
//! bound by a `WITH` clause are not tables.
//!
//! References:
//! - sqlparser-rs: <https://docs.rs/sqlparser>

pub mod columnar;

use std::collections::BTreeSet;
use std::ops::ControlFlow;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arrow::record_batch::RecordBatch;
use sqlparser::ast::{ObjectName, Query, Statement, Visit, Visitor};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use crate::guard::{LeakageGuard, MaterializedView};
use crate::{Error, Result};

/// Capability to run SQL over named tabular datasets.
///
/// Implementations must be read-only with respect to the provided tables.
pub trait SqlEngine: Send + Sync {
    /// Run `sql` over `tables` and return the result rows with their types.
    ///
    /// # Errors
    ///
    /// Implementations report failures as `Error::Query`.
    fn execute(&self, sql: &str, tables: &[(String, RecordBatch)]) -> Result<RecordBatch>;
}

#[derive(Default)]
struct RelationCollector {
    ctes: BTreeSet<String>,
    relations: Vec<String>,
}

impl Visitor for RelationCollector {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.ctes.insert(cte.alias.name.value.to_lowercase());
            }
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        if let Some(ident) = relation.0.last() {
            self.relations.push(ident.value.clone());
        }
        ControlFlow::Continue(())
    }
}

/// Tables referenced by a read-only SQL query, sorted and de-duplicated.
///
/// # Errors
///
/// Returns `ParseError` on invalid SQL, multiple statements or any statement
/// other than a query.
///
/// ```
/// use churn_store::query::referenced_tables;
///
/// let tables = referenced_tables(
///     "WITH recent AS (SELECT * FROM rawdata) \
///      SELECT * FROM recent r JOIN backtest_results b ON r.customer_id = b.customer_id",
/// )?;
/// assert_eq!(tables, vec!["backtest_results", "rawdata"]);
/// # Ok::<(), churn_store::Error>(())
/// ```
pub fn referenced_tables(sql: &str) -> Result<Vec<String>> {
    let statements = Parser::parse_sql(&GenericDialect {}, sql)
        .map_err(|e| Error::ParseError(e.to_string()))?;
    let [statement] = statements.as_slice() else {
        return Err(Error::ParseError(format!(
            "expected exactly one statement, found {}",
            statements.len()
        )));
    };
    if !matches!(statement, Statement::Query(_)) {
        return Err(Error::ParseError(
            "only read-only queries are accepted".to_string(),
        ));
    }

    let mut collector = RelationCollector::default();
    let _ = statement.visit(&mut collector);
    let tables: BTreeSet<String> = collector
        .relations
        .into_iter()
        .filter(|name| !collector.ctes.contains(&name.to_lowercase()))
        .collect();
    Ok(tables.into_iter().collect())
}

/// Runs leakage-checked SQL through a [`SqlEngine`] with a time ceiling.
#[derive(Clone)]
pub struct QueryOverlay {
    engine: Arc<dyn SqlEngine>,
    timeout: Duration,
}

impl std::fmt::Debug for QueryOverlay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryOverlay")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl QueryOverlay {
    /// Overlay delegating to `engine`, abandoning queries after `timeout`.
    #[must_use]
    pub fn new(engine: Arc<dyn SqlEngine>, timeout: Duration) -> Self {
        Self { engine, timeout }
    }

    /// Query ceiling.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Validate the query's scope against `view`, then run it.
    ///
    /// Only the tables the query references are handed to the engine. A
    /// timed-out query is abandoned, not retried; its worker finishes in the
    /// background and its result is dropped.
    ///
    /// # Errors
    ///
    /// Returns `ParseError`, `LeakageViolation`, `QueryTimeout`, or the
    /// engine's `Query` error.
    pub fn execute(
        &self,
        sql: &str,
        guard: &LeakageGuard,
        view: &MaterializedView,
    ) -> Result<RecordBatch> {
        let tables = referenced_tables(sql)?;
        guard.validate_query_scope(view, &tables)?;

        let mut inputs = Vec::with_capacity(tables.len());
        for name in &tables {
            let guarded = view
                .get(name)
                .ok_or_else(|| Error::UnknownTable(name.clone()))?;
            let declared = guard.schema().table(name).ok();
            inputs.push((name.clone(), columnar::to_record_batch(guarded, declared)?));
        }

        tracing::debug!(tables = ?tables, scope = %guard.scope(), "dispatching query");
        let started = Instant::now();
        let (tx, rx) = mpsc::channel();
        let engine = Arc::clone(&self.engine);
        let statement = sql.to_string();
        std::thread::Builder::new()
            .name("churn-store-query".to_string())
            .spawn(move || {
                // The receiver is gone if the query already timed out.
                let _ = tx.send(engine.execute(&statement, &inputs));
            })?;

        match rx.recv_timeout(self.timeout) {
            Ok(result) => {
                let batch = result?;
                tracing::debug!(
                    rows = batch.num_rows(),
                    elapsed_ms = started.elapsed().as_millis(),
                    "query finished"
                );
                Ok(batch)
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(tables = ?tables, timeout_ms = self.timeout.as_millis(), "query timed out");
                Err(Error::QueryTimeout {
                    timeout_ms: self.timeout.as_millis(),
                    tables: tables.join(", "),
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(Error::Query(
                "query worker terminated without a result".to_string(),
            )),
        }
    }
}
