use thiserror::Error;

/// Rendering errors from the query builder
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("not enough arguments for {text:?}: {given} given")]
    MissingArgument { text: String, given: usize },

    #[error("too many arguments for {text:?}: {used} placeholders, {given} given")]
    ExtraArguments {
        text: String,
        used: usize,
        given: usize,
    },
}

/// Syntax error from the CEL parser, with a 1-based position.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("ERROR: <input>:{line}:{column}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl ParseError {
    pub fn new(line: usize, column: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            column,
            message: message.into(),
        }
    }
}

/// Errors from compiling a filter expression into SQL
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FilterError {
    #[error("failed to parse filter {filter}, error: {source}")]
    Parse {
        filter: String,
        #[source]
        source: ParseError,
    },

    #[error("unsupport variable {0:?}")]
    UnsupportedVariable(String),

    #[error("unexpected {operator} operator for {variable}")]
    UnsupportedOperator { operator: String, variable: String },

    #[error("unexpected function {0}")]
    UnexpectedFunction(String),

    #[error("unexpected expr kind {0}")]
    UnexpectedExprKind(String),

    #[error("invalid value for {variable:?}: {reason}")]
    InvalidValue { variable: String, reason: String },

    #[error("invalid expression: {0}")]
    InvalidExpression(String),

    #[error(transparent)]
    Query(#[from] QueryError),
}

impl FilterError {
    pub fn invalid_value(variable: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            variable: variable.into(),
            reason: reason.into(),
        }
    }

    pub fn unsupported_operator(operator: impl Into<String>, variable: impl Into<String>) -> Self {
        Self::UnsupportedOperator {
            operator: operator.into(),
            variable: variable.into(),
        }
    }

    pub fn invalid_expression(reason: impl Into<String>) -> Self {
        Self::InvalidExpression(reason.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_keeps_position() {
        let err = FilterError::Parse {
            filter: "name ==".into(),
            source: ParseError::new(1, 8, "unexpected end of input"),
        };
        assert_eq!(
            err.to_string(),
            "failed to parse filter name ==, error: ERROR: <input>:1:8: unexpected end of input"
        );
    }

    #[test]
    fn unsupported_variable_message() {
        let err = FilterError::UnsupportedVariable("color".into());
        assert_eq!(err.to_string(), "unsupport variable \"color\"");
    }
}
