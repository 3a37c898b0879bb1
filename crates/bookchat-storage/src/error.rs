use std::fmt;

use bookchat_core::ValidationError;
use bookchat_keys::KeyError;
use thiserror::Error;

/// Coarse classification callers branch on (retry, mark stale, report).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepositoryErrorKind {
    LockTimeout,
    NetworkUnavailable,
    ConflictingState,
    NotFound,
    InvalidPath,
    Io,
    Git,
}

impl fmt::Display for RepositoryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::LockTimeout => "lock_timeout",
            Self::NetworkUnavailable => "network_unavailable",
            Self::ConflictingState => "conflicting_state",
            Self::NotFound => "not_found",
            Self::InvalidPath => "invalid_path",
            Self::Io => "io",
            Self::Git => "git",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Lock acquisition timed out: {0}")]
    LockTimeout(String),

    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("Conflicting repository state: {0}")]
    ConflictingState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(git2::Error),
}

pub type Result<T> = std::result::Result<T, RepositoryError>;

impl RepositoryError {
    #[must_use]
    pub const fn kind(&self) -> RepositoryErrorKind {
        match self {
            Self::LockTimeout(_) => RepositoryErrorKind::LockTimeout,
            Self::NetworkUnavailable(_) => RepositoryErrorKind::NetworkUnavailable,
            Self::ConflictingState(_) => RepositoryErrorKind::ConflictingState,
            Self::NotFound(_) => RepositoryErrorKind::NotFound,
            Self::InvalidPath(_) => RepositoryErrorKind::InvalidPath,
            Self::Io(_) => RepositoryErrorKind::Io,
            Self::Git(_) => RepositoryErrorKind::Git,
        }
    }

    #[must_use]
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::LockTimeout(_) => "LOCK_TIMEOUT",
            Self::NetworkUnavailable(_) => "NETWORK_UNAVAILABLE",
            Self::ConflictingState(_) => "CONFLICTING_STATE",
            Self::NotFound(_) => "NOT_FOUND",
            Self::InvalidPath(_) => "INVALID_PATH",
            Self::Io(_) => "OS_ERROR",
            Self::Git(_) => "GIT_ERROR",
        }
    }

    /// Whether retrying the same operation later can succeed.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::LockTimeout(_) | Self::NetworkUnavailable(_))
    }
}

impl From<git2::Error> for RepositoryError {
    fn from(err: git2::Error) -> Self {
        use git2::{ErrorClass, ErrorCode};

        let msg = err.message().to_string();
        match (err.class(), err.code()) {
            (ErrorClass::Net | ErrorClass::Ssh | ErrorClass::Http | ErrorClass::Ssl, _)
            | (_, ErrorCode::Auth | ErrorCode::Certificate) => Self::NetworkUnavailable(msg),
            (_, ErrorCode::Locked) => Self::LockTimeout(msg),
            (_, ErrorCode::NotFound | ErrorCode::UnbornBranch) => Self::NotFound(msg),
            (
                _,
                ErrorCode::NotFastForward
                | ErrorCode::Conflict
                | ErrorCode::MergeConflict
                | ErrorCode::Modified
                | ErrorCode::Uncommitted,
            ) => Self::ConflictingState(msg),
            _ => Self::Git(err),
        }
    }
}

/// Errors from the message store, pins and archive.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("Key error: {0}")]
    Keys(#[from] KeyError),

    #[error("Malformed message file {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl StoreError {
    #[must_use]
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::Validation(e) => e.error_type(),
            Self::Repository(e) => e.error_type(),
            Self::Keys(e) => e.error_type(),
            Self::Parse { .. } => "PARSE_ERROR",
            Self::Io(_) => "OS_ERROR",
            Self::Json(_) => "SERIALIZATION_ERROR",
        }
    }

    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::Repository(e) => e.is_recoverable(),
            Self::Keys(e) => e.is_recoverable(),
            _ => false,
        }
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::Repository(RepositoryError::NotFound(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn git_errors_are_classified() {
        let net = git2::Error::new(git2::ErrorCode::GenericError, git2::ErrorClass::Net, "down");
        assert_eq!(
            RepositoryError::from(net).kind(),
            RepositoryErrorKind::NetworkUnavailable
        );
        let nf = git2::Error::new(git2::ErrorCode::NotFound, git2::ErrorClass::Reference, "x");
        assert_eq!(RepositoryError::from(nf).kind(), RepositoryErrorKind::NotFound);
        let nff = git2::Error::new(
            git2::ErrorCode::NotFastForward,
            git2::ErrorClass::Reference,
            "rejected",
        );
        assert_eq!(
            RepositoryError::from(nff).kind(),
            RepositoryErrorKind::ConflictingState
        );
        let locked = git2::Error::new(git2::ErrorCode::Locked, git2::ErrorClass::Index, "lock");
        assert!(RepositoryError::from(locked).is_recoverable());
        let other = git2::Error::new(git2::ErrorCode::Ambiguous, git2::ErrorClass::Object, "?");
        assert_eq!(RepositoryError::from(other).kind(), RepositoryErrorKind::Git);
    }

    #[test]
    fn store_error_delegates_classification() {
        let e = StoreError::from(RepositoryError::NotFound("user/x".into()));
        assert!(e.is_not_found());
        assert_eq!(e.error_type(), "NOT_FOUND");
        let v = StoreError::from(ValidationError::EmptyContent);
        assert_eq!(v.error_type(), "EMPTY_CONTENT");
        assert!(!v.is_recoverable());
        assert!(StoreError::from(RepositoryError::NetworkUnavailable("t".into())).is_recoverable());
    }
}
