//! Tagged scalar values and records
//!
//! Records are column-name → [`Value`] maps. Types are checked against the
//! schema registry at the write boundary, not enforced structurally here.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A single cell value.
///
/// Serialized untagged, so a record is plain JSON (`{"customer_id": 7}`).
/// Nested arrays and objects do not deserialize into a `Value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Missing value
    Null,
    /// Boolean
    Bool(bool),
    /// 64-bit integer
    Int(i64),
    /// 64-bit float
    Float(f64),
    /// UTF-8 string
    Text(String),
}

/// One row: column name → value, ordered by column name.
pub type Record = BTreeMap<String, Value>;

/// Build a record from `(column, value)` pairs.
///
/// ```
/// use churn_store::value::{record, Value};
///
/// let row = record([("customer_id", Value::from(7)), ("period", Value::from(202401))]);
/// assert_eq!(row["customer_id"], Value::Int(7));
/// ```
pub fn record<K, V, I>(pairs: I) -> Record
where
    K: Into<String>,
    V: Into<Value>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

impl Value {
    /// Whether the value is `Null`.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Short type name used in validation messages.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Int(_) => "integer",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
        }
    }

    /// Integer payload, if any.
    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric payload widened to `f64`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub const fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// String payload, if any.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Boolean payload, if any.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    fn key_part(&self) -> KeyPart {
        match self {
            Self::Null => KeyPart::Null,
            Self::Bool(b) => KeyPart::Bool(*b),
            Self::Int(v) => KeyPart::Int(*v),
            // -0.0 and 0.0 identify the same key
            Self::Float(v) => KeyPart::Float(if *v == 0.0 { 0 } else { v.to_bits() }),
            Self::Text(s) => KeyPart::Text(s.clone()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(s) => write!(f, "'{s}'"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl<T: Into<Self>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum KeyPart {
    Null,
    Bool(bool),
    Int(i64),
    Float(u64),
    Text(String),
}

/// Hashable projection of a record onto its key columns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyTuple(Vec<KeyPart>);

impl KeyTuple {
    /// Project `record` onto `columns` (absent columns count as null).
    #[must_use]
    pub fn project(record: &Record, columns: &[String]) -> Self {
        Self(
            columns
                .iter()
                .map(|c| record.get(c).map_or(KeyPart::Null, Value::key_part))
                .collect(),
        )
    }

    /// Key of a single value.
    #[must_use]
    pub fn single(value: &Value) -> Self {
        Self(vec![value.key_part()])
    }

    /// Identity over every column, for tables that declare no keys.
    #[must_use]
    pub fn whole(record: &Record) -> Self {
        Self(
            record
                .iter()
                .flat_map(|(c, v)| [KeyPart::Text(c.clone()), v.key_part()])
                .collect(),
        )
    }

    /// Key of `record` under `columns`, falling back to whole-record identity.
    #[must_use]
    pub fn of(record: &Record, columns: &[String]) -> Self {
        if columns.is_empty() {
            Self::whole(record)
        } else {
            Self::project(record, columns)
        }
    }
}

impl fmt::Display for KeyTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match part {
                KeyPart::Null => f.write_str("null")?,
                KeyPart::Bool(b) => write!(f, "{b}")?,
                KeyPart::Int(v) => write!(f, "{v}")?,
                KeyPart::Float(bits) => write!(f, "{}", f64::from_bits(*bits))?,
                KeyPart::Text(s) => write!(f, "'{s}'")?,
            }
        }
        f.write_str(")")
    }
}
