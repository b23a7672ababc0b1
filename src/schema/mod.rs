//! Schema registry: declared columns, types, keys and foreign keys per table
//!
//! Loaded once at startup and shared read-only (`Arc<SchemaRegistry>`) by the
//! table store, the merger and the leakage guard. Types are validated at the
//! write boundary; coercion only happens when `coerce_types` is switched on.
//!
//! ## Registry file
//!
//! ```json
//! {
//!   "coerce_types": false,
//!   "extra_columns": "reject",
//!   "tables": [
//!     {
//!       "name": "backtest_results",
//!       "period_column": "period",
//!       "columns": [
//!         {"name": "customer_id", "type": "INTEGER", "key": true},
//!         {"name": "period", "type": "YYYYMM", "key": true},
//!         {"name": "churn_probability", "type": "DOUBLE", "nullable": false}
//!       ]
//!     }
//!   ]
//! }
//! ```

mod catalog;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::period::Period;
use crate::value::{Record, Value};
use crate::{Error, Result};

/// Declared column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum ColumnType {
    /// 64-bit integer
    Integer,
    /// 64-bit float (integers are accepted)
    Float,
    /// Boolean
    Boolean,
    /// String
    Text,
    /// `YYYYMM` period (integer or six-digit string)
    Period,
}

impl FromStr for ColumnType {
    type Err = Error;

    /// Accepts the data-dictionary spellings case-insensitively.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INTEGER" | "INT" | "BIGINT" | "BINARY" => Ok(Self::Integer),
            "FLOAT" | "DOUBLE" | "NUMERIC" | "DECIMAL" => Ok(Self::Float),
            "BOOLEAN" | "BOOL" => Ok(Self::Boolean),
            "TEXT" | "STRING" | "CATEGORICAL" | "VARCHAR" => Ok(Self::Text),
            "PERIOD" | "YYYYMM" | "TIMEBASE" => Ok(Self::Period),
            other => Err(Error::Config(format!("unknown column type '{other}'"))),
        }
    }
}

impl TryFrom<String> for ColumnType {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Text => "text",
            Self::Period => "period",
        })
    }
}

const fn default_true() -> bool {
    true
}

/// One declared column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    name: String,
    #[serde(rename = "type")]
    column_type: ColumnType,
    #[serde(default = "default_true")]
    nullable: bool,
    #[serde(default)]
    key: bool,
}

impl ColumnDef {
    /// Nullable, non-key column.
    #[must_use]
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
            key: false,
        }
    }

    /// Mark as part of the table key (implies non-null).
    #[must_use]
    pub const fn key(mut self) -> Self {
        self.key = true;
        self.nullable = false;
        self
    }

    /// Mark as non-nullable.
    #[must_use]
    pub const fn required(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Column name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared type.
    #[must_use]
    pub const fn column_type(&self) -> ColumnType {
        self.column_type
    }

    /// Whether null is accepted. Key columns are never nullable.
    #[must_use]
    pub const fn is_nullable(&self) -> bool {
        self.nullable && !self.key
    }

    /// Whether the column is part of the table key.
    #[must_use]
    pub const fn is_key(&self) -> bool {
        self.key
    }
}

/// `column` must match a value of `references_table.references_column`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    /// Referencing column
    pub column: String,
    /// Referenced table
    pub references_table: String,
    /// Referenced column
    pub references_column: String,
}

/// Schema entry for one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    name: String,
    #[serde(default)]
    description: Option<String>,
    columns: Vec<ColumnDef>,
    #[serde(default)]
    foreign_keys: Vec<ForeignKey>,
    #[serde(default)]
    period_column: Option<String>,
    #[serde(default)]
    outcome_columns: Vec<String>,
}

impl TableSchema {
    /// Empty schema entry; add columns with [`TableSchema::column`].
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            columns: Vec::new(),
            foreign_keys: Vec::new(),
            period_column: None,
            outcome_columns: Vec::new(),
        }
    }

    /// Add a column.
    #[must_use]
    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    /// Declare a foreign key.
    #[must_use]
    pub fn foreign_key(
        mut self,
        column: impl Into<String>,
        references_table: impl Into<String>,
        references_column: impl Into<String>,
    ) -> Self {
        self.foreign_keys.push(ForeignKey {
            column: column.into(),
            references_table: references_table.into(),
            references_column: references_column.into(),
        });
        self
    }

    /// Declare the period column the leakage guard filters on.
    #[must_use]
    pub fn period_column(mut self, column: impl Into<String>) -> Self {
        self.period_column = Some(column.into());
        self
    }

    /// Declare a period column recording an event (masked past the cutoff).
    #[must_use]
    pub fn outcome_column(mut self, column: impl Into<String>) -> Self {
        self.outcome_columns.push(column.into());
        self
    }

    /// Set a human-readable description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Table name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Description, if declared.
    #[must_use]
    pub fn description_text(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Declared columns in declaration order.
    #[must_use]
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    /// Look up a column by name.
    #[must_use]
    pub fn column_def(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Names of the key columns in declaration order.
    #[must_use]
    pub fn key_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| c.key)
            .map(|c| c.name.clone())
            .collect()
    }

    /// Declared foreign keys.
    #[must_use]
    pub fn foreign_keys(&self) -> &[ForeignKey] {
        &self.foreign_keys
    }

    /// Period column, if the table is time-indexed.
    #[must_use]
    pub fn period_column_name(&self) -> Option<&str> {
        self.period_column.as_deref()
    }

    /// Outcome period columns.
    #[must_use]
    pub fn outcome_column_names(&self) -> &[String] {
        &self.outcome_columns
    }

    fn check(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::Config(format!("table '{}': {msg}", self.name)));

        if self.columns.is_empty() {
            return fail("no columns declared".to_string());
        }
        let mut seen = std::collections::BTreeSet::new();
        for column in &self.columns {
            if !seen.insert(column.name.as_str()) {
                return fail(format!("column '{}' declared twice", column.name));
            }
        }
        if let Some(period) = &self.period_column {
            match self.column_def(period) {
                Some(c) if matches!(c.column_type, ColumnType::Period | ColumnType::Integer) => {}
                Some(_) => return fail(format!("period column '{period}' must be a period")),
                None => return fail(format!("period column '{period}' is not declared")),
            }
        }
        for outcome in &self.outcome_columns {
            match self.column_def(outcome) {
                Some(c) if c.column_type == ColumnType::Period => {}
                _ => return fail(format!("outcome column '{outcome}' must be a declared period")),
            }
        }
        for fk in &self.foreign_keys {
            if self.column_def(&fk.column).is_none() {
                return fail(format!("foreign key column '{}' is not declared", fk.column));
            }
        }
        Ok(())
    }
}

/// What to do with columns a record carries but the schema does not declare.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtraColumnPolicy {
    /// Fail validation
    #[default]
    Reject,
    /// Drop the column from the stored record
    Ignore,
}

#[derive(Deserialize)]
struct RegistryFile {
    #[serde(default)]
    coerce_types: bool,
    #[serde(default)]
    extra_columns: ExtraColumnPolicy,
    tables: Vec<TableSchema>,
}

/// Read-only registry of table schemas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaRegistry {
    tables: BTreeMap<String, TableSchema>,
    coerce_types: bool,
    extra_columns: ExtraColumnPolicy,
}

impl SchemaRegistry {
    /// Build a registry, checking every entry and every foreign-key target.
    ///
    /// # Errors
    ///
    /// Returns `Config` on duplicate tables, undeclared key/period/foreign-key
    /// columns or references to unknown tables.
    pub fn new(tables: impl IntoIterator<Item = TableSchema>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for table in tables {
            table.check()?;
            let name = table.name.clone();
            if map.insert(name.clone(), table).is_some() {
                return Err(Error::Config(format!("table '{name}' declared twice")));
            }
        }
        let registry = Self::from_map(map);
        registry.check_references()?;
        Ok(registry)
    }

    /// Registry over a fixed table list that is known to be consistent.
    fn from_trusted(tables: impl IntoIterator<Item = TableSchema>) -> Self {
        Self::from_map(
            tables
                .into_iter()
                .map(|table| (table.name.clone(), table))
                .collect(),
        )
    }

    const fn from_map(tables: BTreeMap<String, TableSchema>) -> Self {
        Self {
            tables,
            coerce_types: false,
            extra_columns: ExtraColumnPolicy::Reject,
        }
    }

    fn check_references(&self) -> Result<()> {
        for table in self.tables.values() {
            for fk in &table.foreign_keys {
                let target = self.tables.get(&fk.references_table).ok_or_else(|| {
                    Error::Config(format!(
                        "table '{}': foreign key '{}' references unknown table '{}'",
                        table.name, fk.column, fk.references_table
                    ))
                })?;
                if target.column_def(&fk.references_column).is_none() {
                    return Err(Error::Config(format!(
                        "table '{}': foreign key '{}' references unknown column '{}.{}'",
                        table.name, fk.column, fk.references_table, fk.references_column
                    )));
                }
            }
        }
        Ok(())
    }

    /// Parse a registry from JSON text.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the JSON is malformed or the schema inconsistent.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let file: RegistryFile = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("schema registry: {e}")))?;
        Ok(Self::new(file.tables)?
            .with_coerce_types(file.coerce_types)
            .with_extra_columns(file.extra_columns))
    }

    /// Load a registry file.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the file cannot be read or parsed.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        let registry = Self::from_json_str(&text)?;
        tracing::info!(path = %path.display(), tables = registry.tables.len(), "schema registry loaded");
        Ok(registry)
    }

    /// Enable or disable type coercion (off by default: validate, never cast).
    #[must_use]
    pub const fn with_coerce_types(mut self, coerce: bool) -> Self {
        self.coerce_types = coerce;
        self
    }

    /// Set the extra-column policy.
    #[must_use]
    pub const fn with_extra_columns(mut self, policy: ExtraColumnPolicy) -> Self {
        self.extra_columns = policy;
        self
    }

    /// Whether values are coerced to declared types before validation.
    #[must_use]
    pub const fn coerce_types(&self) -> bool {
        self.coerce_types
    }

    /// Extra-column policy.
    #[must_use]
    pub const fn extra_columns(&self) -> ExtraColumnPolicy {
        self.extra_columns
    }

    /// Schema entry for `table`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTable` if the table is not declared.
    pub fn table(&self, table: &str) -> Result<&TableSchema> {
        self.tables
            .get(table)
            .ok_or_else(|| Error::UnknownTable(table.to_string()))
    }

    /// Whether `table` is declared.
    #[must_use]
    pub fn contains(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    /// All schema entries ordered by name.
    pub fn tables(&self) -> impl Iterator<Item = &TableSchema> {
        self.tables.values()
    }

    /// Key columns of `table`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTable` if the table is not declared.
    pub fn key_columns(&self, table: &str) -> Result<Vec<String>> {
        Ok(self.table(table)?.key_columns())
    }

    /// Validate one record, returning the normalized record to store.
    ///
    /// Missing nullable columns are filled with null; undeclared columns are
    /// rejected or dropped per [`ExtraColumnPolicy`]. Period values are
    /// stored in their integer YYYYMM form.
    ///
    /// # Errors
    ///
    /// Returns `SchemaViolation` naming `index` and the offending column, or
    /// `UnknownTable`.
    pub fn validate_record(&self, table: &str, index: usize, record: &Record) -> Result<Record> {
        let schema = self.table(table)?;
        let violation = |column: &str, reason: String| Error::SchemaViolation {
            table: table.to_string(),
            index,
            column: column.to_string(),
            reason,
        };

        if self.extra_columns == ExtraColumnPolicy::Reject {
            if let Some(extra) = record.keys().find(|c| schema.column_def(c).is_none()) {
                return Err(violation(extra, "column is not declared in the schema".into()));
            }
        }

        let mut out = Record::new();
        for def in &schema.columns {
            let value = match record.get(&def.name) {
                Some(v) if self.coerce_types => coerce(def.column_type, v.clone()),
                Some(v) => v.clone(),
                None if def.is_nullable() => Value::Null,
                None => return Err(violation(&def.name, "required column is missing".into())),
            };
            if value.is_null() {
                if !def.is_nullable() {
                    let what = if def.key { "key" } else { "non-nullable" };
                    return Err(violation(&def.name, format!("null in {what} column")));
                }
            } else if let Err(reason) = check_type(def.column_type, &value) {
                return Err(violation(&def.name, reason));
            }
            out.insert(def.name.clone(), canonical(def.column_type, value));
        }
        Ok(out)
    }

    /// Validate a batch, failing on the first violation.
    ///
    /// # Errors
    ///
    /// Returns the first `SchemaViolation` encountered.
    pub fn validate_records(&self, table: &str, records: &[Record]) -> Result<Vec<Record>> {
        records
            .iter()
            .enumerate()
            .map(|(i, r)| self.validate_record(table, i, r))
            .collect()
    }

    /// Built-in catalog of the churn pipeline tables.
    #[must_use]
    pub fn churn_default() -> Self {
        catalog::churn_tables()
    }
}

fn check_type(expected: ColumnType, value: &Value) -> std::result::Result<(), String> {
    if let Value::Float(f) = value {
        if !f.is_finite() {
            return Err(format!("non-finite float {f}"));
        }
    }
    let ok = match expected {
        ColumnType::Integer => matches!(value, Value::Int(_)),
        ColumnType::Float => matches!(value, Value::Int(_) | Value::Float(_)),
        ColumnType::Boolean => matches!(value, Value::Bool(_)),
        ColumnType::Text => matches!(value, Value::Text(_)),
        ColumnType::Period => return Period::try_from(value).map(|_| ()).map_err(|e| e.to_string()),
    };
    if ok {
        Ok(())
    } else {
        Err(format!("expected {expected}, found {} {value}", value.type_name()))
    }
}

/// Periods are stored as integer YYYYMM whatever shape they arrived in, so
/// `202401` and `"202401"` share one key.
fn canonical(column_type: ColumnType, value: Value) -> Value {
    if column_type == ColumnType::Period && matches!(value, Value::Text(_)) {
        if let Ok(period) = Period::try_from(&value) {
            return Value::Int(period.yyyymm());
        }
    }
    value
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn coerce(target: ColumnType, value: Value) -> Value {
    match (target, value) {
        (ColumnType::Float, Value::Int(v)) => Value::Float(v as f64),
        (ColumnType::Float, Value::Text(s)) => s
            .trim()
            .parse::<f64>()
            .map_or(Value::Text(s), Value::Float),
        (ColumnType::Integer | ColumnType::Period, Value::Float(f))
            if f.fract() == 0.0 && f.abs() < 9.0e15 =>
        {
            Value::Int(f as i64)
        }
        (ColumnType::Integer, Value::Text(s)) => {
            s.trim().parse::<i64>().map_or(Value::Text(s), Value::Int)
        }
        (ColumnType::Period, Value::Text(s)) => s
            .parse::<Period>()
            .map_or(Value::Text(s), |p| Value::Int(p.yyyymm())),
        (ColumnType::Boolean, Value::Int(1)) => Value::Bool(true),
        (ColumnType::Boolean, Value::Int(0)) => Value::Bool(false),
        (ColumnType::Boolean, Value::Text(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "y" => Value::Bool(true),
            "false" | "0" | "no" | "n" => Value::Bool(false),
            _ => Value::Text(s),
        },
        (ColumnType::Text, Value::Int(v)) => Value::Text(v.to_string()),
        (ColumnType::Text, Value::Float(v)) => Value::Text(v.to_string()),
        (ColumnType::Text, Value::Bool(v)) => Value::Text(v.to_string()),
        (_, v) => v,
    }
}
