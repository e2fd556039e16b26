//! Storage-level errors and their mapping onto the engine's error taxonomy.

use diesel::result::{DatabaseErrorKind, Error as DieselError};
use thiserror::Error;

use menusync_core::errors::{DatabaseError, Error};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Query failed: {0}")]
    Query(#[from] DieselError),

    #[error("Connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("Connection failed: {0}")]
    Connection(#[from] diesel::ConnectionError),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Writer unavailable: {0}")]
    Writer(String),

    #[error("Filesystem error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid stored value in {column}: {message}")]
    InvalidColumn { column: &'static str, message: String },
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        let database = match err {
            StorageError::Query(DieselError::NotFound) => {
                DatabaseError::NotFound("record not found".to_string())
            }
            StorageError::Query(DieselError::DatabaseError(
                DatabaseErrorKind::UniqueViolation,
                info,
            )) => DatabaseError::UniqueViolation(info.message().to_string()),
            StorageError::Query(other) => DatabaseError::QueryFailed(other.to_string()),
            StorageError::Pool(e) => DatabaseError::ConnectionFailed(e.to_string()),
            StorageError::Connection(e) => DatabaseError::ConnectionFailed(e.to_string()),
            StorageError::Writer(message) => DatabaseError::ConnectionFailed(message),
            StorageError::Io(e) => DatabaseError::ConnectionFailed(e.to_string()),
            other @ (StorageError::Migration(_) | StorageError::InvalidColumn { .. }) => {
                DatabaseError::Internal(other.to_string())
            }
        };
        Error::Database(database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use menusync_core::errors::FailureType;

    #[test]
    fn not_found_is_permanent_and_pool_errors_are_transient() {
        let not_found: Error = StorageError::Query(DieselError::NotFound).into();
        assert!(matches!(
            not_found,
            Error::Database(DatabaseError::NotFound(_))
        ));
        assert_eq!(not_found.failure_type(), FailureType::Permanent);

        let writer: Error = StorageError::Writer("stopped".to_string()).into();
        assert_eq!(writer.failure_type(), FailureType::Transient);

        let column: Error = StorageError::InvalidColumn {
            column: "status",
            message: "bogus".to_string(),
        }
        .into();
        assert_eq!(column.failure_type(), FailureType::Permanent);
    }
}
