//! Error types for audit storage.

use thiserror::Error;

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error taxonomy shared by every backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid adapter construction input. Fatal at construction.
    Configuration,
    /// The store rejected or could not perform an operation.
    Persistence,
}

/// Errors that can occur in storage operations.
#[derive(Error, Debug)]
pub enum Error {
    // Construction errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    // Query errors
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Duplicate record id: {0}")]
    DuplicateId(String),

    // Store errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Document store error: {0}")]
    Document(#[from] surrealdb::Error),
}

impl Error {
    /// Taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_) => ErrorKind::Configuration,
            _ => ErrorKind::Persistence,
        }
    }

    /// Shorthand for a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }

    /// Shorthand for an invalid query error.
    pub fn invalid_query(message: impl Into<String>) -> Self {
        Error::InvalidQuery(message.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            Error::configuration("missing join table").kind(),
            ErrorKind::Configuration
        );
        assert_eq!(Error::invalid_query("bad field").kind(), ErrorKind::Persistence);
        assert_eq!(
            Error::Persistence("disk full".to_string()).kind(),
            ErrorKind::Persistence
        );
    }

    #[test]
    fn test_error_display() {
        let err = Error::DuplicateId("abc".to_string());
        assert!(err.to_string().contains("abc"));
    }

    #[test]
    fn test_from_serde_json() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: Error = parse_err.into();
        assert!(matches!(err, Error::SerializationError(_)));
        assert_eq!(err.kind(), ErrorKind::Persistence);
    }
}
