//! Validation error types

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

/// Loose email shape check; the authoritative check lives in the identity layer.
static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[^\s@/]+@[^\s@/]+$").expect("invalid email regex")
});

/// Maximum length for a principal email
const MAX_EMAIL_LEN: usize = 254;

/// Validation error for domain values
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Field is empty when it shouldn't be
    Empty { field: &'static str },

    /// Field exceeds maximum length
    TooLong { field: &'static str, max: usize },

    /// String doesn't match required format
    InvalidFormat { field: &'static str, reason: &'static str },

    /// Invalid enum variant
    InvalidVariant { field: &'static str, value: String },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty { field } => write!(f, "{} cannot be empty", field),
            Self::TooLong { field, max } => {
                write!(f, "{} exceeds maximum length of {} characters", field, max)
            }
            Self::InvalidFormat { field, reason } => {
                write!(f, "{}: {}", field, reason)
            }
            Self::InvalidVariant { field, value } => {
                write!(f, "invalid {} value: '{}'", field, value)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Validate a principal email, returning it lowercased.
pub fn validate_email(email: &str) -> Result<String, ValidationError> {
    if email.is_empty() {
        return Err(ValidationError::Empty { field: "email" });
    }
    if email.len() > MAX_EMAIL_LEN {
        return Err(ValidationError::TooLong {
            field: "email",
            max: MAX_EMAIL_LEN,
        });
    }
    if !EMAIL_RE.is_match(email) {
        return Err(ValidationError::InvalidFormat {
            field: "email",
            reason: "must look like name@domain",
        });
    }
    Ok(email.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ValidationError::TooLong {
            field: "title",
            max: 256,
        };
        assert_eq!(
            err.to_string(),
            "title exceeds maximum length of 256 characters"
        );
    }

    #[test]
    fn email_is_lowercased() {
        assert_eq!(validate_email("Dev@Example.com").unwrap(), "dev@example.com");
    }

    #[test]
    fn email_rejects_bad_shapes() {
        assert!(matches!(
            validate_email(""),
            Err(ValidationError::Empty { .. })
        ));
        assert!(validate_email("no-at-sign").is_err());
        assert!(validate_email("a@b/c").is_err());
        assert!(validate_email("two words@x.io").is_err());
    }
}
