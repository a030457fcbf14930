//! Store error types.

use std::time::Duration;
use thiserror::Error;

/// Credential and token store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    /// Query exceeded its deadline and was cancelled
    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    /// Unique constraint violated
    #[error("Conflicting record: {0}")]
    Conflict(String),

    /// Stored data could not be mapped back to a model
    #[error("Corrupt record: {0}")]
    Corruption(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                StoreError::Conflict(db.constraint().unwrap_or("unique").to_string())
            }
            other => StoreError::Database(other),
        }
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display() {
        let err = StoreError::Timeout(Duration::from_secs(5));
        assert_eq!(err.to_string(), "Store operation timed out after 5s");
    }

    #[test]
    fn test_non_unique_database_error_is_not_conflict() {
        let err: StoreError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, StoreError::Database(_)));
    }
}
