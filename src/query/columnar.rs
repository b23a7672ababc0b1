//! Guarded tables as Arrow record batches
//!
//! Column types follow the schema declaration: `Integer` and `Period` map to
//! Int64 (periods as `YYYYMM`), `Float` to Float64, `Boolean` to Boolean and
//! `Text` to Utf8. Undeclared tables get types inferred from their values.
//! Every field is nullable, since masked outcome values are null.

use std::sync::Arc;

use arrow::array::{ArrayRef, BooleanBuilder, Float64Builder, Int64Builder, StringBuilder};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};

use crate::guard::GuardedTable;
use crate::period::Period;
use crate::schema::{ColumnType, TableSchema};
use crate::value::{Record, Value};
use crate::{Error, Result};

/// Convert a guarded table, typed by `declared` when available.
///
/// # Errors
///
/// Returns `SchemaViolation` if a stored value does not fit its column type.
pub fn to_record_batch(guarded: &GuardedTable, declared: Option<&TableSchema>) -> Result<RecordBatch> {
    let records = guarded.table().records();
    let columns: Vec<(String, ColumnType)> = match declared {
        Some(schema) => schema
            .columns()
            .iter()
            .map(|c| (c.name().to_string(), c.column_type()))
            .collect(),
        None => guarded
            .table()
            .column_names()
            .into_iter()
            .map(|name| {
                let inferred = infer_type(records, &name);
                (name, inferred)
            })
            .collect(),
    };

    let mut fields = Vec::with_capacity(columns.len());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(columns.len());
    for (name, column_type) in &columns {
        fields.push(Field::new(name, data_type(*column_type), true));
        arrays.push(build_column(guarded.name(), name, *column_type, records)?);
    }

    let options = RecordBatchOptions::new().with_row_count(Some(records.len()));
    Ok(RecordBatch::try_new_with_options(
        Arc::new(Schema::new(fields)),
        arrays,
        &options,
    )?)
}

const fn data_type(column_type: ColumnType) -> DataType {
    match column_type {
        ColumnType::Integer | ColumnType::Period => DataType::Int64,
        ColumnType::Float => DataType::Float64,
        ColumnType::Boolean => DataType::Boolean,
        ColumnType::Text => DataType::Utf8,
    }
}

fn infer_type(records: &[Record], column: &str) -> ColumnType {
    let mut inferred: Option<ColumnType> = None;
    for value in records.iter().filter_map(|r| r.get(column)) {
        let this = match value {
            Value::Null => continue,
            Value::Bool(_) => ColumnType::Boolean,
            Value::Int(_) => ColumnType::Integer,
            Value::Float(_) => ColumnType::Float,
            Value::Text(_) => return ColumnType::Text,
        };
        inferred = Some(match (inferred, this) {
            (None, t) => t,
            (Some(a), b) if a == b => a,
            (Some(ColumnType::Integer | ColumnType::Float), ColumnType::Integer | ColumnType::Float) => {
                ColumnType::Float
            }
            _ => return ColumnType::Text,
        });
    }
    inferred.unwrap_or(ColumnType::Text)
}

fn build_column(
    table: &str,
    column: &str,
    column_type: ColumnType,
    records: &[Record],
) -> Result<ArrayRef> {
    let mismatch = |index: usize, value: &Value| Error::SchemaViolation {
        table: table.to_string(),
        index,
        column: column.to_string(),
        reason: format!("cannot convert {} {value} to {column_type}", value.type_name()),
    };
    let values = records
        .iter()
        .map(|r| r.get(column).unwrap_or(&Value::Null))
        .enumerate();

    let array: ArrayRef = match column_type {
        ColumnType::Integer => {
            let mut builder = Int64Builder::with_capacity(records.len());
            for (index, value) in values {
                match value {
                    Value::Null => builder.append_null(),
                    Value::Int(v) => builder.append_value(*v),
                    other => return Err(mismatch(index, other)),
                }
            }
            Arc::new(builder.finish())
        }
        ColumnType::Period => {
            let mut builder = Int64Builder::with_capacity(records.len());
            for (index, value) in values {
                if value.is_null() {
                    builder.append_null();
                } else {
                    let period = Period::try_from(value).map_err(|_| mismatch(index, value))?;
                    builder.append_value(period.yyyymm());
                }
            }
            Arc::new(builder.finish())
        }
        ColumnType::Float => {
            let mut builder = Float64Builder::with_capacity(records.len());
            for (index, value) in values {
                match value {
                    Value::Null => builder.append_null(),
                    other => builder.append_value(other.as_f64().ok_or_else(|| mismatch(index, other))?),
                }
            }
            Arc::new(builder.finish())
        }
        ColumnType::Boolean => {
            let mut builder = BooleanBuilder::with_capacity(records.len());
            for (index, value) in values {
                match value {
                    Value::Null => builder.append_null(),
                    Value::Bool(b) => builder.append_value(*b),
                    other => return Err(mismatch(index, other)),
                }
            }
            Arc::new(builder.finish())
        }
        ColumnType::Text => {
            let mut builder = StringBuilder::with_capacity(records.len(), records.len() * 8);
            for (_, value) in values {
                match value {
                    Value::Null => builder.append_null(),
                    Value::Text(s) => builder.append_value(s),
                    other => builder.append_value(other.to_string()),
                }
            }
            Arc::new(builder.finish())
        }
    };
    Ok(array)
}
