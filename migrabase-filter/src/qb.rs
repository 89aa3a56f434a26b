//! Query builder
//!
//! A `Query` is a list of SQL text parts, each carrying the arguments for
//! its `?` markers. Parts are joined with a separator chosen at append time
//! (`space`, `comma`, `and`, `or`). An argument may itself be a `Query`,
//! which is rendered in place with its own arguments, so filters compiled
//! elsewhere can be dropped into a larger statement:
//!
//! ```
//! use migrabase_filter::{args, qb};
//!
//! let filter = qb::q("project.name = ?", args!["prod"]);
//! let mut query = qb::q("SELECT resource_id FROM project WHERE TRUE", args![]);
//! query.and("?", args![filter]).space("LIMIT ?", args![10i64]);
//!
//! let (sql, values) = query.to_sql().unwrap();
//! assert_eq!(sql, "SELECT resource_id FROM project WHERE TRUE AND project.name = $1 LIMIT $2");
//! assert_eq!(values.len(), 2);
//! ```
//!
//! `??` renders a literal `?` (for the JSONB `?`, `?|` and `?&` operators).

use chrono::{DateTime, Utc};

use crate::error::QueryError;

/// Build an argument list for a query part.
#[macro_export]
macro_rules! args {
    () => {
        ::std::vec::Vec::<$crate::qb::Arg>::new()
    };
    ($($arg:expr),+ $(,)?) => {
        vec![$($crate::qb::Arg::from($arg)),+]
    };
}

/// Placeholder style used when rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Placeholder {
    /// `$1`, `$2`, ... (Postgres)
    #[default]
    Dollar,
    /// `?` for every argument
    Question,
}

/// Column type of a bound NULL; Postgres needs it to type the parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullKind {
    Bool,
    Int,
    Text,
    Timestamp,
    Json,
}

/// A bound SQL parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
    TextArray(Vec<String>),
    IntArray(Vec<i64>),
    Null(NullKind),
}

impl Value {
    /// JSON view of the value, for debugging output.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::json;
        match self {
            Value::Bool(v) => json!(v),
            Value::Int(v) => json!(v),
            Value::Text(v) => json!(v),
            Value::Timestamp(v) => json!(v.to_rfc3339()),
            Value::Json(v) => v.clone(),
            Value::TextArray(v) => json!(v),
            Value::IntArray(v) => json!(v),
            Value::Null(_) => serde_json::Value::Null,
        }
    }
}

/// Argument of a query part: a bound value or a nested query.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Value(Value),
    Query(Query),
}

impl From<Value> for Arg {
    fn from(v: Value) -> Self {
        Arg::Value(v)
    }
}

impl From<Query> for Arg {
    fn from(q: Query) -> Self {
        Arg::Query(q)
    }
}

impl From<&Query> for Arg {
    fn from(q: &Query) -> Self {
        Arg::Query(q.clone())
    }
}

macro_rules! value_from {
    ($($t:ty => |$v:ident| $body:expr),+ $(,)?) => {
        $(
            impl From<$t> for Value {
                fn from($v: $t) -> Self {
                    $body
                }
            }

            impl From<$t> for Arg {
                fn from(v: $t) -> Self {
                    Arg::Value(Value::from(v))
                }
            }
        )+
    };
}

value_from! {
    bool => |v| Value::Bool(v),
    i32 => |v| Value::Int(i64::from(v)),
    i64 => |v| Value::Int(v),
    u32 => |v| Value::Int(i64::from(v)),
    usize => |v| Value::Int(i64::try_from(v).unwrap_or(i64::MAX)),
    &str => |v| Value::Text(v.to_owned()),
    String => |v| Value::Text(v),
    &String => |v| Value::Text(v.clone()),
    DateTime<Utc> => |v| Value::Timestamp(v),
    serde_json::Value => |v| Value::Json(v),
    Vec<String> => |v| Value::TextArray(v),
    Vec<&str> => |v| Value::TextArray(v.into_iter().map(str::to_owned).collect()),
    &[String] => |v| Value::TextArray(v.to_vec()),
    Vec<i64> => |v| Value::IntArray(v),
    Option<bool> => |v| v.map_or(Value::Null(NullKind::Bool), Value::Bool),
    Option<i64> => |v| v.map_or(Value::Null(NullKind::Int), Value::Int),
    Option<i32> => |v| v.map_or(Value::Null(NullKind::Int), |v| Value::Int(i64::from(v))),
    Option<String> => |v| v.map_or(Value::Null(NullKind::Text), Value::Text),
    Option<&str> => |v| v.map_or(Value::Null(NullKind::Text), |v| Value::Text(v.to_owned())),
    Option<DateTime<Utc>> => |v| v.map_or(Value::Null(NullKind::Timestamp), Value::Timestamp),
    Option<serde_json::Value> => |v| v.map_or(Value::Null(NullKind::Json), Value::Json),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Separator {
    Space,
    Comma,
    And,
    Or,
}

impl Separator {
    fn as_str(self) -> &'static str {
        match self {
            Separator::Space => " ",
            Separator::Comma => ", ",
            Separator::And => " AND ",
            Separator::Or => " OR ",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Part {
    sep: Separator,
    text: String,
    args: Vec<Arg>,
}

/// SQL fragment accumulator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    parts: Vec<Part>,
}

/// Start a query with a single part.
pub fn q(text: impl Into<String>, args: Vec<Arg>) -> Query {
    let mut query = Query::new();
    query.space(text, args);
    query
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, sep: Separator, text: impl Into<String>, args: Vec<Arg>) -> &mut Self {
        self.parts.push(Part {
            sep,
            text: text.into(),
            args,
        });
        self
    }

    /// Append a part joined with a space.
    pub fn space(&mut self, text: impl Into<String>, args: Vec<Arg>) -> &mut Self {
        self.push(Separator::Space, text, args)
    }

    /// Append a part joined with `, ` (SET lists, column lists).
    pub fn comma(&mut self, text: impl Into<String>, args: Vec<Arg>) -> &mut Self {
        self.push(Separator::Comma, text, args)
    }

    /// Append a part joined with ` AND `.
    pub fn and(&mut self, text: impl Into<String>, args: Vec<Arg>) -> &mut Self {
        self.push(Separator::And, text, args)
    }

    /// Append a part joined with ` OR `.
    pub fn or(&mut self, text: impl Into<String>, args: Vec<Arg>) -> &mut Self {
        self.push(Separator::Or, text, args)
    }

    /// Number of parts.
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Render with `$n` placeholders.
    pub fn to_sql(&self) -> Result<(String, Vec<Value>), QueryError> {
        self.to_sql_with(Placeholder::Dollar)
    }

    /// Render with the given placeholder style.
    pub fn to_sql_with(&self, placeholder: Placeholder) -> Result<(String, Vec<Value>), QueryError> {
        let mut sql = String::new();
        let mut values = Vec::new();
        self.render(&mut sql, &mut values, placeholder)?;
        Ok((sql, values))
    }

    fn render(
        &self,
        sql: &mut String,
        values: &mut Vec<Value>,
        placeholder: Placeholder,
    ) -> Result<(), QueryError> {
        for (i, part) in self.parts.iter().enumerate() {
            if i > 0 {
                sql.push_str(part.sep.as_str());
            }

            let mut args = part.args.iter();
            let mut used = 0;
            let mut chars = part.text.chars().peekable();
            while let Some(c) = chars.next() {
                if c != '?' {
                    sql.push(c);
                    continue;
                }
                if chars.peek() == Some(&'?') {
                    chars.next();
                    sql.push('?');
                    continue;
                }
                let arg = args.next().ok_or_else(|| QueryError::MissingArgument {
                    text: part.text.clone(),
                    given: part.args.len(),
                })?;
                used += 1;
                match arg {
                    Arg::Value(value) => {
                        values.push(value.clone());
                        match placeholder {
                            Placeholder::Dollar => sql.push_str(&format!("${}", values.len())),
                            Placeholder::Question => sql.push('?'),
                        }
                    }
                    // An empty condition list is vacuously true.
                    Arg::Query(sub) if sub.is_empty() => sql.push_str("TRUE"),
                    Arg::Query(sub) => sub.render(sql, values, placeholder)?,
                }
            }

            if used < part.args.len() {
                return Err(QueryError::ExtraArguments {
                    text: part.text.clone(),
                    used,
                    given: part.args.len(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_placeholders_across_parts() {
        let mut query = q("SELECT id FROM issue WHERE TRUE", args![]);
        query
            .and("issue.project = ?", args!["p1"])
            .and("issue.id = ANY(?)", args![vec![1i64, 2]])
            .space("LIMIT ? OFFSET ?", args![10i64, 20i64]);

        let (sql, values) = query.to_sql().unwrap();
        assert_eq!(
            sql,
            "SELECT id FROM issue WHERE TRUE AND issue.project = $1 AND issue.id = ANY($2) LIMIT $3 OFFSET $4"
        );
        assert_eq!(
            values,
            vec![
                Value::Text("p1".into()),
                Value::IntArray(vec![1, 2]),
                Value::Int(10),
                Value::Int(20),
            ]
        );
    }

    #[test]
    fn inlines_nested_queries() {
        let mut or = Query::new();
        or.or("a = ?", args![1i64]).or("b = ?", args![2i64]);
        let mut query = q("SELECT 1 WHERE x = ?", args!["x"]);
        query.and("(?)", args![or]).and("y = ?", args![true]);

        let (sql, values) = query.to_sql().unwrap();
        assert_eq!(sql, "SELECT 1 WHERE x = $1 AND (a = $2 OR b = $3) AND y = $4");
        assert_eq!(values.len(), 4);
    }

    #[test]
    fn question_placeholders() {
        let query = q("a = ? AND b = ?", args![1i64, "b"]);
        let (sql, _) = query.to_sql_with(Placeholder::Question).unwrap();
        assert_eq!(sql, "a = ? AND b = ?");
    }

    #[test]
    fn escaped_question_mark_is_literal() {
        let query = q("payload->'labels' ??& ?::TEXT[]", args![vec!["a", "b"]]);
        let (sql, values) = query.to_sql().unwrap();
        assert_eq!(sql, "payload->'labels' ?& $1::TEXT[]");
        assert_eq!(values.len(), 1);
    }

    #[test]
    fn comma_builds_set_lists() {
        let mut set = Query::new();
        set.comma("name = ?", args!["n"]).comma("deleted = ?", args![false]);
        let query = q("UPDATE project SET ? WHERE resource_id = ?", args![set, "p1"]);
        let (sql, _) = query.to_sql().unwrap();
        assert_eq!(sql, "UPDATE project SET name = $1, deleted = $2 WHERE resource_id = $3");
    }

    #[test]
    fn empty_subquery_renders_true() {
        let query = q("SELECT 1 WHERE ?", args![Query::new()]);
        assert_eq!(query.to_sql().unwrap().0, "SELECT 1 WHERE TRUE");
    }

    #[test]
    fn argument_count_mismatch_is_an_error() {
        let err = q("a = ? AND b = ?", args![1i64]).to_sql().unwrap_err();
        assert!(matches!(err, QueryError::MissingArgument { given: 1, .. }));

        let err = q("a = ?", args![1i64, 2i64]).to_sql().unwrap_err();
        assert!(matches!(err, QueryError::ExtraArguments { used: 1, given: 2, .. }));
    }

    #[test]
    fn typed_nulls() {
        let none: Option<i64> = None;
        let (_, values) = q("x = ?", args![none]).to_sql().unwrap();
        assert_eq!(values, vec![Value::Null(NullKind::Int)]);
    }
}
