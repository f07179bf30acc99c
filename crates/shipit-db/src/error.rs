//! Database error types.

use shipit_core::JobStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("corrupt row: {0}")]
    Decode(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

/// Whether a sqlx error is a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

impl From<DbError> for shipit_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(what) => shipit_core::Error::NotFound(what),
            DbError::Duplicate(what) => shipit_core::Error::Duplicate(what),
            DbError::Conflict(what) => shipit_core::Error::Conflict(what),
            DbError::InvalidTransition { from, to } => {
                shipit_core::Error::InvalidTransition { from, to }
            }
            other => shipit_core::Error::Internal(other.to_string()),
        }
    }
}
