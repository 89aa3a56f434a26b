//! Bridge from `qb::Query` to sqlx: rendering, argument binding, row counts.

use migrabase_filter::qb::{NullKind, Value};
use migrabase_filter::Query;
use sqlx::postgres::PgArguments;
use sqlx::types::Json;
use sqlx::Arguments;

use crate::error::{Result, StoreError};

/// Most bind parameters Postgres accepts in one statement.
pub(crate) const MAX_BIND_PARAMETERS: usize = 65535;

/// Rows of `args_per_row` bound values that fit in one statement.
pub(crate) fn rows_per_statement(args_per_row: usize) -> usize {
    (MAX_BIND_PARAMETERS / args_per_row.max(1)).max(1)
}

/// Render `query` with `$n` placeholders and bind its arguments.
pub(crate) fn build(query: &Query) -> Result<(String, PgArguments)> {
    let (sql, values) = query.to_sql()?;
    tracing::debug!(sql = %compact(&sql), args = values.len(), "built query");
    Ok((sql, bind_values(values)?))
}

/// Bind rendered values in order.
pub(crate) fn bind_values(values: Vec<Value>) -> Result<PgArguments> {
    let mut arguments = PgArguments::default();
    for value in values {
        let bound = match value {
            Value::Bool(v) => arguments.add(v),
            Value::Int(v) => arguments.add(v),
            Value::Text(v) => arguments.add(v),
            Value::Timestamp(v) => arguments.add(v),
            Value::Json(v) => arguments.add(Json(v)),
            Value::TextArray(v) => arguments.add(v),
            Value::IntArray(v) => arguments.add(v),
            Value::Null(NullKind::Bool) => arguments.add(None::<bool>),
            Value::Null(NullKind::Int) => arguments.add(None::<i64>),
            Value::Null(NullKind::Text) => arguments.add(None::<String>),
            Value::Null(NullKind::Timestamp) => {
                arguments.add(None::<chrono::DateTime<chrono::Utc>>)
            }
            Value::Null(NullKind::Json) => arguments.add(None::<Json<serde_json::Value>>),
        };
        bound.map_err(|err| StoreError::Bind(err.to_string()))?;
    }
    Ok(arguments)
}

/// Collapse a list result that must hold at most one row.
pub(crate) fn at_most_one<T>(mut rows: Vec<T>, resource: &'static str) -> Result<Option<T>> {
    match rows.len() {
        0 => Ok(None),
        1 => Ok(rows.pop()),
        count => {
            tracing::warn!(resource, count, "lookup matched more than one row");
            Err(StoreError::Conflict { resource, count })
        }
    }
}

/// Single-line SQL for logs.
fn compact(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}
