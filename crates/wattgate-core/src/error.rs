//! Storage errors shared by every wattgate backend.

use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("{entity} '{key}' not found")]
    NotFound { entity: &'static str, key: String },

    /// A uniqueness constraint rejected the write.
    #[error("{entity} '{key}' already exists")]
    AlreadyExists { entity: &'static str, key: String },

    /// A stored or submitted value does not map onto the domain types.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// A batch could not be committed as a whole.
    #[error("transaction failed: {0}")]
    Transaction(String),

    /// The backend could not be reached.
    #[error("storage unreachable: {0}")]
    Connection(String),

    #[error("storage error: {0}")]
    Internal(String),
}

impl StorageError {
    pub fn not_found(entity: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            key: key.into(),
        }
    }

    pub fn already_exists(entity: &'static str, key: impl Into<String>) -> Self {
        Self::AlreadyExists {
            entity,
            key: key.into(),
        }
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData(message.into())
    }

    pub fn transaction_error(message: impl Into<String>) -> Self {
        Self::Transaction(message.into())
    }

    pub fn connection_error(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// `true` when another writer got there first. Callers re-read the
    /// winner's row instead of failing.
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// Coarse class for log fields and metric labels.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::AlreadyExists { .. } => ErrorCategory::Conflict,
            Self::InvalidData(_) => ErrorCategory::Validation,
            Self::Transaction(_) => ErrorCategory::Transaction,
            Self::Connection(_) => ErrorCategory::Infrastructure,
            Self::Internal(_) => ErrorCategory::Internal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    NotFound,
    Conflict,
    Validation,
    Transaction,
    Infrastructure,
    Internal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Validation => "validation",
            Self::Transaction => "transaction",
            Self::Infrastructure => "infrastructure",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StorageError::already_exists("credential", "metering");
        assert_eq!(err.to_string(), "credential 'metering' already exists");

        let err = StorageError::not_found("calendar_day", "2024-01-01");
        assert_eq!(err.to_string(), "calendar_day '2024-01-01' not found");
    }

    #[test]
    fn test_error_predicates() {
        assert!(StorageError::already_exists("credential", "x").is_already_exists());
        assert!(!StorageError::internal("boom").is_already_exists());
        assert!(StorageError::not_found("sync_marker", "calendar").is_not_found());
    }

    #[test]
    fn test_error_category() {
        assert_eq!(
            StorageError::already_exists("credential", "x").category(),
            ErrorCategory::Conflict
        );
        assert_eq!(
            StorageError::connection_error("refused").category(),
            ErrorCategory::Infrastructure
        );
        assert_eq!(ErrorCategory::Conflict.to_string(), "conflict");
    }
}
