use migrabase_core::{CoreError, ValidationError};
use migrabase_filter::{FilterError, QueryError};
use thiserror::Error;

/// Store error type
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error("failed to build sql: {0}")]
    Query(#[from] QueryError),

    #[error("failed to encode payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("not found: {resource} '{id}'")]
    NotFound { resource: &'static str, id: String },

    #[error("found {count} {resource} rows, expect 1")]
    Conflict { resource: &'static str, count: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to bind argument: {0}")]
    Bind(String),
}

impl StoreError {
    pub fn not_found(resource: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            resource,
            id: id.to_string(),
        }
    }

    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument(reason.into())
    }

    /// Check if this is a "not found" error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if the database rejected the write with a unique violation.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::Sqlx(sqlx::Error::Database(err)) => err.is_unique_violation(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
