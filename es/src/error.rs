//! Store errors

use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors from store operations
#[derive(Debug, Error)]
pub enum Error {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the underlying connection can no longer be trusted
    ///
    /// Constraint violations, busy databases and malformed rows are transient:
    /// the next request on the same connection may well succeed. Losing the
    /// file, a corrupt image or an I/O failure is not.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                ErrorCode::CannotOpen
                    | ErrorCode::NotADatabase
                    | ErrorCode::DatabaseCorrupt
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::ReadOnly
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraint_violation_is_not_fatal() {
        let err = Error::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        ));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_corruption_is_fatal() {
        let err = Error::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CORRUPT),
            None,
        ));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_invalid_record_is_not_fatal() {
        assert!(!Error::InvalidRecord("bad".to_string()).is_fatal());
    }
}
