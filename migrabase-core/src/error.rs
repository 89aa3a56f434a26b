/// Structured error types for migrabase-core.
///
/// Library crates return these; the CLI wraps them with `anyhow` context.
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::validation::ValidationError;

/// Main error type for migrabase-core operations
#[derive(Error, Debug)]
pub enum CoreError {
    /// I/O operation failed
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    /// Config file could not be parsed
    #[error("Failed to parse config file {path:?}: {source}")]
    ConfigParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// Configuration error
    #[error("Configuration error: {reason}")]
    Config { reason: String },

    /// Resource name does not follow the `prefix/{id}` layout
    #[error("invalid resource name {name:?}: {reason}")]
    ResourceName { name: String, reason: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Result type alias for migrabase-core operations
pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// Create a config error
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Create a resource name error
    pub fn resource_name(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ResourceName {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::resource_name("projects/", "empty id");
        assert_eq!(
            err.to_string(),
            "invalid resource name \"projects/\": empty id"
        );

        let err = CoreError::config("database_url is empty");
        assert!(err.to_string().contains("Configuration error"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: CoreError = io_err.into();

        assert!(matches!(err, CoreError::Io { .. }));
    }
}
