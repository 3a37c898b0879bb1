use bookchat_core::ValidationError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, KeyError>;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("No private key for author {0}; signing is only possible with a locally generated key")]
    NoPrivateKey(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed key material: {0}")]
    Malformed(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl KeyError {
    #[must_use]
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::NoPrivateKey(_) => "NO_PRIVATE_KEY",
            Self::Io(_) => "OS_ERROR",
            Self::Json(_) => "SERIALIZATION_ERROR",
            Self::Malformed(_) => "MALFORMED_KEY",
            Self::Validation(e) => e.error_type(),
        }
    }

    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}
