//! Validation errors shared by every BookChat crate.
//!
//! Validation happens before any branch or commit work begins, so these errors
//! never leave repository state behind.

use thiserror::Error;

/// Result type alias for validation
pub type Result<T> = std::result::Result<T, ValidationError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Invalid author: {0:?}. Must match ^[A-Za-z0-9][A-Za-z0-9_-]{{0,63}}$")]
    InvalidAuthor(String),

    #[error("Message content is empty")]
    EmptyContent,

    #[error("Message content is {size} bytes, limit is {limit}")]
    ContentTooLarge { size: usize, limit: usize },

    #[error("Invalid message id: {0:?}")]
    InvalidMessageId(String),
}

impl ValidationError {
    /// Returns the error type string (for JSON output)
    #[must_use]
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidAuthor(_) => "INVALID_AUTHOR",
            Self::EmptyContent => "EMPTY_CONTENT",
            Self::ContentTooLarge { .. } => "CONTENT_TOO_LARGE",
            Self::InvalidMessageId(_) => "INVALID_MESSAGE_ID",
        }
    }

    /// Validation failures are caller mistakes; retrying cannot help.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_types() {
        assert_eq!(
            ValidationError::InvalidAuthor("a b".into()).error_type(),
            "INVALID_AUTHOR"
        );
        assert_eq!(ValidationError::EmptyContent.error_type(), "EMPTY_CONTENT");
        assert_eq!(
            ValidationError::ContentTooLarge { size: 9, limit: 4 }.error_type(),
            "CONTENT_TOO_LARGE"
        );
    }

    #[test]
    fn test_recoverable() {
        assert!(!ValidationError::EmptyContent.is_recoverable());
    }

    #[test]
    fn display_names_the_offending_value() {
        let msg = ValidationError::InvalidAuthor("../x".into()).to_string();
        assert!(msg.contains("\"../x\""));
    }
}
