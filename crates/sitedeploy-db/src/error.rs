//! Database error types.

use sitedeploy_core::Error;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("store lock poisoned: {0}")]
    Poisoned(String),

    #[error("contention: {0}")]
    Contention(String),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<DbError> for Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(msg) => Error::NotFound(msg),
            DbError::Corrupt(msg) => Error::Internal(msg),
            other => Error::Unavailable(other.to_string()),
        }
    }
}
