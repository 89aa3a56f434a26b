//! Filter compiler: CEL expression → parameterized SQL predicate
//!
//! The walker handles the boolean structure (`&&`, `||`, `!(x in ...)`) and
//! hands every leaf predicate to a [`FilterSchema`], which owns the
//! variable whitelist and the mapping to columns. Leaves never splice
//! literal values into SQL text; everything goes through bound arguments.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use migrabase_core::{resource, ValidationError};

use crate::args;
use crate::cel::{self, operators, Expr, Literal};
use crate::error::FilterError;
use crate::qb::{q, Query};

/// Literal operand of a predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    String(String),
    Int(i64),
    Uint(u64),
    Double(f64),
    Bool(bool),
    Bytes(Vec<u8>),
    Null,
    List(Vec<FilterValue>),
}

impl FilterValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            FilterValue::String(_) => "string",
            FilterValue::Int(_) => "int",
            FilterValue::Uint(_) => "uint",
            FilterValue::Double(_) => "double",
            FilterValue::Bool(_) => "bool",
            FilterValue::Bytes(_) => "bytes",
            FilterValue::Null => "null_type",
            FilterValue::List(_) => "list",
        }
    }

    /// The string payload, or an error naming `variable`.
    pub fn as_str(&self, variable: &str) -> Result<&str, FilterError> {
        match self {
            FilterValue::String(s) => Ok(s),
            other => Err(FilterError::invalid_value(
                variable,
                format!("expect string, got {}", other.type_name()),
            )),
        }
    }

    pub fn as_bool(&self, variable: &str) -> Result<bool, FilterError> {
        match self {
            FilterValue::Bool(b) => Ok(*b),
            other => Err(FilterError::invalid_value(
                variable,
                format!("expect bool, got {}", other.type_name()),
            )),
        }
    }

    fn from_literal(literal: &Literal) -> Self {
        match literal {
            Literal::Int(v) => FilterValue::Int(*v),
            Literal::Uint(v) => FilterValue::Uint(*v),
            Literal::Double(v) => FilterValue::Double(*v),
            Literal::String(v) => FilterValue::String(v.clone()),
            Literal::Bytes(v) => FilterValue::Bytes(v.clone()),
            Literal::Bool(v) => FilterValue::Bool(*v),
            Literal::Null => FilterValue::Null,
        }
    }
}

/// Time comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Less,
    LessEquals,
    Greater,
    GreaterEquals,
}

impl CompareOp {
    fn from_function(function: &str) -> Option<Self> {
        match function {
            operators::LESS => Some(CompareOp::Less),
            operators::LESS_EQUALS => Some(CompareOp::LessEquals),
            operators::GREATER => Some(CompareOp::Greater),
            operators::GREATER_EQUALS => Some(CompareOp::GreaterEquals),
            _ => None,
        }
    }

    pub fn function(&self) -> &'static str {
        match self {
            CompareOp::Less => operators::LESS,
            CompareOp::LessEquals => operators::LESS_EQUALS,
            CompareOp::Greater => operators::GREATER,
            CompareOp::GreaterEquals => operators::GREATER_EQUALS,
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            CompareOp::Less => "<",
            CompareOp::LessEquals => "<=",
            CompareOp::Greater => ">",
            CompareOp::GreaterEquals => ">=",
        }
    }

    /// Operator with its operands swapped: `a < b` ⇔ `b > a`.
    pub fn flip(&self) -> Self {
        match self {
            CompareOp::Less => CompareOp::Greater,
            CompareOp::LessEquals => CompareOp::GreaterEquals,
            CompareOp::Greater => CompareOp::Less,
            CompareOp::GreaterEquals => CompareOp::LessEquals,
        }
    }
}

/// Per-entity variable whitelist.
///
/// Only `equals` is required; a schema opts into the other predicate forms
/// by overriding them. Defaults reject the variable.
pub trait FilterSchema {
    /// `variable == value`
    fn equals(&self, variable: &str, value: &FilterValue) -> Result<Query, FilterError>;

    /// `variable.matches(pattern)`; `pattern` is never empty.
    fn matches(&self, variable: &str, _pattern: &str) -> Result<Query, FilterError> {
        Err(FilterError::UnsupportedVariable(variable.to_owned()))
    }

    /// `variable in [values]`; `values` is never empty.
    fn in_list(&self, variable: &str, _values: &[FilterValue]) -> Result<Query, FilterError> {
        Err(FilterError::unsupported_operator(operators::IN, variable))
    }

    /// `variable <op> value`
    fn compare(
        &self,
        variable: &str,
        op: CompareOp,
        _value: &FilterValue,
    ) -> Result<Query, FilterError> {
        Err(FilterError::unsupported_operator(op.function(), variable))
    }
}

/// Compile `filter` against `schema`.
///
/// Returns `Ok(None)` for an empty filter. The predicate is wrapped in
/// parentheses so callers can `AND` it into their WHERE clause.
pub fn compile_filter(
    filter: &str,
    schema: &dyn FilterSchema,
) -> Result<Option<Query>, FilterError> {
    if filter.trim().is_empty() {
        return Ok(None);
    }

    let expr = cel::parse(filter).map_err(|source| FilterError::Parse {
        filter: filter.to_owned(),
        source,
    })?;
    let predicate = walk(&expr, schema)?;
    tracing::debug!(filter, parts = predicate.len(), "compiled list filter");
    Ok(Some(q("(?)", args![predicate])))
}

fn walk(expr: &Expr, schema: &dyn FilterSchema) -> Result<Query, FilterError> {
    let Expr::Call {
        target,
        function,
        args,
    } = expr
    else {
        return Err(FilterError::UnexpectedExprKind(expr.kind().to_owned()));
    };

    match function.as_str() {
        operators::LOGICAL_AND | operators::LOGICAL_OR => {
            let mut joined = Query::new();
            for arg in args {
                let sub = walk(arg, schema)?;
                if function == operators::LOGICAL_AND {
                    joined.and("?", args![sub]);
                } else {
                    joined.or("?", args![sub]);
                }
            }
            Ok(q("(?)", args![joined]))
        }
        operators::EQUALS => {
            let (variable, value, _) = variable_and_value(function, args)?;
            schema.equals(&variable, &value)
        }
        operators::IN => {
            let (variable, value, swapped) = variable_and_value(function, args)?;
            let values = match value {
                FilterValue::List(values) if !swapped => values,
                _ => {
                    return Err(FilterError::invalid_value(
                        variable,
                        "expect a list of literals after `in`",
                    ))
                }
            };
            if values.is_empty() {
                return Err(FilterError::invalid_value(variable, "empty list"));
            }
            schema.in_list(&variable, &values)
        }
        operators::LOGICAL_NOT => match args.as_slice() {
            [inner @ Expr::Call { function, .. }] if function == operators::IN => {
                let sub = walk(inner, schema)?;
                Ok(q("NOT (?)", args![sub]))
            }
            _ => Err(FilterError::invalid_expression(
                "only `in` expressions can be negated",
            )),
        },
        operators::LESS
        | operators::LESS_EQUALS
        | operators::GREATER
        | operators::GREATER_EQUALS => {
            let (variable, value, swapped) = variable_and_value(function, args)?;
            // from_function cannot fail inside this arm.
            let op = CompareOp::from_function(function)
                .ok_or_else(|| FilterError::UnexpectedFunction(function.clone()))?;
            let op = if swapped { op.flip() } else { op };
            schema.compare(&variable, op, &value)
        }
        operators::MATCHES => {
            let variable = target
                .as_deref()
                .and_then(Expr::as_path)
                .ok_or_else(|| {
                    FilterError::invalid_expression("matches() must be called on a variable")
                })?;
            let [Expr::Literal(literal)] = args.as_slice() else {
                return Err(FilterError::invalid_value(
                    variable,
                    "invalid args for matches(), expect one string literal",
                ));
            };
            let Literal::String(pattern) = literal else {
                return Err(FilterError::invalid_value(
                    variable,
                    format!(
                        "expect string, got {}, hint: filter literals should be string",
                        literal.type_name()
                    ),
                ));
            };
            if pattern.is_empty() {
                return Err(FilterError::invalid_value(variable, "empty matches() pattern"));
            }
            schema.matches(&variable, pattern)
        }
        other => Err(FilterError::UnexpectedFunction(other.to_owned())),
    }
}

/// Split a binary predicate into its variable and literal operands.
///
/// The variable may appear on either side; `swapped` reports that it was
/// on the right.
fn variable_and_value(
    function: &str,
    args: &[Expr],
) -> Result<(String, FilterValue, bool), FilterError> {
    let [left, right] = args else {
        return Err(FilterError::invalid_expression(format!(
            "{} expects two operands",
            function
        )));
    };

    if let Some(variable) = left.as_path() {
        let value = literal_value(&variable, right)?;
        return Ok((variable, value, false));
    }
    if let Some(variable) = right.as_path() {
        let value = literal_value(&variable, left)?;
        return Ok((variable, value, true));
    }
    Err(FilterError::invalid_expression(format!(
        "{} expects a variable and a literal value",
        function
    )))
}

fn literal_value(variable: &str, expr: &Expr) -> Result<FilterValue, FilterError> {
    match expr {
        Expr::Literal(literal) => Ok(FilterValue::from_literal(literal)),
        Expr::List(items) => items
            .iter()
            .map(|item| match item {
                Expr::Literal(literal) => Ok(FilterValue::from_literal(literal)),
                other => Err(FilterError::invalid_value(
                    variable,
                    format!("list elements must be literals, got {}", other.kind()),
                )),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(FilterValue::List),
        other => Err(FilterError::invalid_value(
            variable,
            format!("expect a literal value, got {}", other.kind()),
        )),
    }
}

fn escape_like(text: &str, out: &mut String) {
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
}

/// `%pattern%` for a case-insensitive LIKE, with LIKE wildcards escaped.
pub fn like_pattern(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 2);
    out.push('%');
    escape_like(&pattern.to_lowercase(), &mut out);
    out.push('%');
    out
}

/// `prefix%`, case preserved, with LIKE wildcards escaped.
pub fn like_prefix(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    escape_like(prefix, &mut out);
    out.push('%');
    out
}

/// `LOWER(column) LIKE '%pattern%'`
pub fn matches_query(column: &str, pattern: &str) -> Query {
    q(format!("LOWER({}) LIKE ?", column), args![like_pattern(pattern)])
}

/// `column = ANY(values)` for string-valued variables.
pub fn any_of_strings(
    column: &str,
    variable: &str,
    values: &[FilterValue],
) -> Result<Query, FilterError> {
    let strings = string_list(variable, values)?;
    Ok(q(format!("{} = ANY(?)", column), args![strings]))
}

/// String elements of an `in` list.
pub fn string_list(variable: &str, values: &[FilterValue]) -> Result<Vec<String>, FilterError> {
    values
        .iter()
        .map(|value| value.as_str(variable).map(str::to_owned))
        .collect()
}

/// Parse an RFC 3339 timestamp literal.
pub fn parse_time(variable: &str, value: &FilterValue) -> Result<DateTime<Utc>, FilterError> {
    let text = value.as_str(variable)?;
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|err| {
            FilterError::invalid_value(variable, format!("invalid RFC 3339 time {:?}: {}", text, err))
        })
}

/// `column <op> timestamp`
pub fn time_comparison(
    column: &str,
    variable: &str,
    op: CompareOp,
    value: &FilterValue,
) -> Result<Query, FilterError> {
    let time = parse_time(variable, value)?;
    Ok(q(format!("{} {} ?", column, op.as_sql()), args![time]))
}

/// Parse a string literal into one of the string-backed enums.
pub fn parse_enum<T>(variable: &str, value: &FilterValue) -> Result<T, FilterError>
where
    T: FromStr<Err = ValidationError>,
{
    let text = value.as_str(variable)?;
    text.parse::<T>()
        .map_err(|err| FilterError::invalid_value(variable, err.to_string()))
}

/// Enum names of an `in` list, each checked against `T`.
pub fn enum_list<T>(variable: &str, values: &[FilterValue]) -> Result<Vec<String>, FilterError>
where
    T: FromStr<Err = ValidationError> + fmt::Display,
{
    values
        .iter()
        .map(|value| parse_enum::<T>(variable, value).map(|v| v.to_string()))
        .collect()
}

/// `users/{email}` → lowercased email, as users are stored
pub fn user_email(variable: &str, value: &FilterValue) -> Result<String, FilterError> {
    let name = value.as_str(variable)?;
    resource::get_user_email(name)
        .map(|email| email.to_lowercase())
        .map_err(|err| FilterError::invalid_value(variable, err.to_string()))
}

/// `projects/{id}` → id
pub fn project_id(variable: &str, value: &FilterValue) -> Result<String, FilterError> {
    let name = value.as_str(variable)?;
    resource::get_project_id(name)
        .map_err(|err| FilterError::invalid_value(variable, err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qb::Value;

    /// Two-column schema used to exercise the walker.
    struct Toy;

    impl FilterSchema for Toy {
        fn equals(&self, variable: &str, value: &FilterValue) -> Result<Query, FilterError> {
            match variable {
                "name" => Ok(q("toy.name = ?", args![value.as_str(variable)?])),
                "archived" => Ok(q("toy.archived = ?", args![value.as_bool(variable)?])),
                _ => Err(FilterError::UnsupportedVariable(variable.to_owned())),
            }
        }

        fn matches(&self, variable: &str, pattern: &str) -> Result<Query, FilterError> {
            match variable {
                "name" => Ok(matches_query("toy.name", pattern)),
                _ => Err(FilterError::UnsupportedVariable(variable.to_owned())),
            }
        }

        fn in_list(&self, variable: &str, values: &[FilterValue]) -> Result<Query, FilterError> {
            match variable {
                "name" => any_of_strings("toy.name", variable, values),
                _ => Err(FilterError::unsupported_operator(operators::IN, variable)),
            }
        }

        fn compare(
            &self,
            variable: &str,
            op: CompareOp,
            value: &FilterValue,
        ) -> Result<Query, FilterError> {
            match variable {
                "create_time" => time_comparison("toy.created_at", variable, op, value),
                _ => Err(FilterError::unsupported_operator(op.function(), variable)),
            }
        }
    }

    fn sql(filter: &str) -> (String, Vec<Value>) {
        compile_filter(filter, &Toy)
            .unwrap()
            .expect("non-empty filter")
            .to_sql()
            .unwrap()
    }

    #[test]
    fn empty_filter_is_none() {
        assert!(compile_filter("", &Toy).unwrap().is_none());
        assert!(compile_filter("  \n", &Toy).unwrap().is_none());
    }

    #[test]
    fn single_predicate_is_wrapped() {
        let (text, values) = sql(r#"name == "a""#);
        assert_eq!(text, "(toy.name = $1)");
        assert_eq!(values, vec![Value::Text("a".into())]);
    }

    #[test]
    fn literal_on_the_left() {
        assert_eq!(sql(r#""a" == name"#).0, "(toy.name = $1)");
        assert_eq!(
            sql(r#""2024-01-01T00:00:00Z" < create_time"#).0,
            "(toy.created_at > $1)"
        );
    }

    #[test]
    fn boolean_structure_nests() {
        let (text, values) = sql(r#"name == "a" && (archived == false || name.matches("B_"))"#);
        assert_eq!(
            text,
            "((toy.name = $1 AND (toy.archived = $2 OR LOWER(toy.name) LIKE $3)))"
        );
        assert_eq!(values[2], Value::Text("%b\\_%".into()));
    }

    #[test]
    fn negated_in() {
        let (text, values) = sql(r#"!(name in ["a", "b"])"#);
        assert_eq!(text, "(NOT (toy.name = ANY($1)))");
        assert_eq!(values, vec![Value::TextArray(vec!["a".into(), "b".into()])]);
    }

    #[test]
    fn time_comparison_parses_rfc3339() {
        let (text, values) = sql(r#"create_time >= "2024-06-01T10:00:00+02:00""#);
        assert_eq!(text, "(toy.created_at >= $1)");
        let Value::Timestamp(t) = &values[0] else {
            panic!("expected timestamp, got {:?}", values[0]);
        };
        assert_eq!(t.to_rfc3339(), "2024-06-01T08:00:00+00:00");
    }

    #[test]
    fn fails_closed() {
        let cases = [
            ("color == \"red\"", "unsupport variable"),
            ("name != \"a\"", "unexpected function _!=_"),
            ("archived in [true]", "unexpected @in operator"),
            ("name in []", "empty list"),
            ("name in [other]", "list elements must be literals"),
            ("name == other", "expect a literal value"),
            ("1 == 2", "expects a variable and a literal"),
            ("!(name == \"a\")", "only `in`"),
            ("name > \"a\"", "unexpected _>_ operator"),
            ("create_time > \"yesterday\"", "RFC 3339"),
            ("name.matches(1)", "expect string"),
            ("name.matches(\"\")", "empty matches"),
            ("name.startsWith(\"a\")", "unexpected function startsWith"),
            ("name", "unexpected expr kind IdentKind"),
            ("archived == \"yes\"", "expect bool"),
            ("name ==", "failed to parse filter"),
        ];
        for (filter, expected) in cases {
            let err = compile_filter(filter, &Toy).unwrap_err();
            assert!(
                err.to_string().contains(expected),
                "{filter:?}: {err} does not mention {expected:?}"
            );
        }
    }

    #[test]
    fn long_chains_fail_with_parse_error() {
        for filter in [
            format!("name{} == \"x\"", ".b".repeat(20_000)),
            format!("1{}", "+1".repeat(20_000)),
            format!("name{} == \"x\"", "[0]".repeat(20_000)),
        ] {
            let err = compile_filter(&filter, &Toy).unwrap_err();
            assert!(matches!(err, FilterError::Parse { .. }), "{err}");
            assert!(err.to_string().contains("recursion limit"));
        }
    }

    #[test]
    fn user_email_is_lowercased() {
        let value = FilterValue::String("users/Dev@Example.com".into());
        assert_eq!(user_email("creator", &value).unwrap(), "dev@example.com");
        assert!(user_email("creator", &FilterValue::String("dev@example.com".into())).is_err());
    }

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("Ab"), "%ab%");
        assert_eq!(like_pattern("50%_\\"), "%50\\%\\_\\\\%");
    }

    #[test]
    fn like_prefix_keeps_case() {
        assert_eq!(like_prefix("instances/Prod_1/"), "instances/Prod\\_1/%");
    }
}
