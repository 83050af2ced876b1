//! Errors raised inside the PostgreSQL backend and their mapping onto
//! [`StorageError`].

use sqlx_core::error::Error as SqlxError;
use wattgate_core::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum PostgresError {
    #[error("postgres: {0}")]
    Sqlx(#[from] SqlxError),

    #[error("schema migration failed: {0}")]
    Migration(String),

    #[error("bad postgres settings: {message}")]
    Config { message: String },

    /// A row holds a value the domain types reject.
    #[error("unreadable row: {message}")]
    InvalidRow { message: String },
}

impl PostgresError {
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn invalid_row(message: impl Into<String>) -> Self {
        Self::InvalidRow {
            message: message.into(),
        }
    }
}

impl From<PostgresError> for StorageError {
    fn from(err: PostgresError) -> Self {
        match err {
            PostgresError::Sqlx(e) => from_sqlx(e),
            PostgresError::InvalidRow { message } => StorageError::invalid_data(message),
            other @ (PostgresError::Migration(_) | PostgresError::Config { .. }) => {
                StorageError::internal(other.to_string())
            }
        }
    }
}

/// Unreachable pools become `Connection`, unique violations become
/// `AlreadyExists`, everything else is `Internal`.
pub(crate) fn from_sqlx(err: SqlxError) -> StorageError {
    match err {
        SqlxError::PoolTimedOut | SqlxError::PoolClosed | SqlxError::Io(_) => {
            StorageError::connection_error(err.to_string())
        }
        SqlxError::Database(ref db_err) if db_err.is_unique_violation() => {
            StorageError::already_exists("row", db_err.message().to_string())
        }
        other => StorageError::internal(other.to_string()),
    }
}

pub type Result<T> = std::result::Result<T, PostgresError>;
