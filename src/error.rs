//! Error taxonomy for the record store.
//!
//! Every error carries a machine-readable [`ErrorKind`], a human message, a
//! `context` describing the offending field/key/operation, and the instant
//! it occurred. Validation, not-found, query, and type errors are
//! recoverable (the store is left unchanged); transaction errors trigger an
//! automatic abort of the transaction that raised them.

use std::time::SystemTime;
use thiserror::Error;

/// Machine-readable error classification, independent of the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    RecordNotFound,
    IndexError,
    ConfigurationError,
    QueryError,
    TransactionError,
    TypeConstraintError,
    ConcurrencyError,
}

/// Sub-classification for [`StoreError::Index`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexErrorKind {
    DuplicateName,
    MissingName,
    UniqueViolation,
}

/// Sub-classification for [`StoreError::Transaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionErrorKind {
    WrongState,
    Timeout,
    IsolationViolation,
    ReadOnly,
    Deadlock,
}

/// The single error type returned by every fallible operation in this crate.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("validation failed for {context}: {message}")]
    Validation {
        context: String,
        message: String,
        occurred_at: SystemTime,
    },

    #[error("record not found: {context}")]
    RecordNotFound {
        context: String,
        occurred_at: SystemTime,
    },

    #[error("index error ({kind:?}) in {context}: {message}")]
    Index {
        kind: IndexErrorKind,
        context: String,
        message: String,
        occurred_at: SystemTime,
    },

    #[error("configuration error in {context}: {message}")]
    Configuration {
        context: String,
        message: String,
        occurred_at: SystemTime,
    },

    #[error("query error in {context}: {message}")]
    Query {
        context: String,
        message: String,
        occurred_at: SystemTime,
    },

    #[error("transaction error ({kind:?}) in {context}: {message}")]
    Transaction {
        kind: TransactionErrorKind,
        context: String,
        message: String,
        occurred_at: SystemTime,
    },

    #[error("type constraint violated on {context}: {message}")]
    TypeConstraint {
        context: String,
        message: String,
        occurred_at: SystemTime,
    },

    #[error("concurrency error in {context}: {message}")]
    Concurrency {
        context: String,
        message: String,
        occurred_at: SystemTime,
    },
}

impl StoreError {
    pub fn validation(context: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::Validation {
            context: context.into(),
            message: message.into(),
            occurred_at: SystemTime::now(),
        }
    }

    pub fn not_found(context: impl Into<String>) -> Self {
        StoreError::RecordNotFound {
            context: context.into(),
            occurred_at: SystemTime::now(),
        }
    }

    pub fn index(kind: IndexErrorKind, context: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::Index {
            kind,
            context: context.into(),
            message: message.into(),
            occurred_at: SystemTime::now(),
        }
    }

    pub fn configuration(context: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::Configuration {
            context: context.into(),
            message: message.into(),
            occurred_at: SystemTime::now(),
        }
    }

    pub fn query(context: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::Query {
            context: context.into(),
            message: message.into(),
            occurred_at: SystemTime::now(),
        }
    }

    pub fn transaction(
        kind: TransactionErrorKind,
        context: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        StoreError::Transaction {
            kind,
            context: context.into(),
            message: message.into(),
            occurred_at: SystemTime::now(),
        }
    }

    pub fn type_constraint(context: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::TypeConstraint {
            context: context.into(),
            message: message.into(),
            occurred_at: SystemTime::now(),
        }
    }

    pub fn concurrency(context: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::Concurrency {
            context: context.into(),
            message: message.into(),
            occurred_at: SystemTime::now(),
        }
    }

    /// Machine-readable kind, independent of the message text.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Validation { .. } => ErrorKind::Validation,
            StoreError::RecordNotFound { .. } => ErrorKind::RecordNotFound,
            StoreError::Index { .. } => ErrorKind::IndexError,
            StoreError::Configuration { .. } => ErrorKind::ConfigurationError,
            StoreError::Query { .. } => ErrorKind::QueryError,
            StoreError::Transaction { .. } => ErrorKind::TransactionError,
            StoreError::TypeConstraint { .. } => ErrorKind::TypeConstraintError,
            StoreError::Concurrency { .. } => ErrorKind::ConcurrencyError,
        }
    }

    pub fn context(&self) -> &str {
        match self {
            StoreError::Validation { context, .. }
            | StoreError::RecordNotFound { context, .. }
            | StoreError::Index { context, .. }
            | StoreError::Configuration { context, .. }
            | StoreError::Query { context, .. }
            | StoreError::Transaction { context, .. }
            | StoreError::TypeConstraint { context, .. }
            | StoreError::Concurrency { context, .. } => context,
        }
    }

    pub fn occurred_at(&self) -> SystemTime {
        match self {
            StoreError::Validation { occurred_at, .. }
            | StoreError::RecordNotFound { occurred_at, .. }
            | StoreError::Index { occurred_at, .. }
            | StoreError::Configuration { occurred_at, .. }
            | StoreError::Query { occurred_at, .. }
            | StoreError::Transaction { occurred_at, .. }
            | StoreError::TypeConstraint { occurred_at, .. }
            | StoreError::Concurrency { occurred_at, .. } => *occurred_at,
        }
    }

    /// Recoverable errors leave the store's state unchanged.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Validation | ErrorKind::RecordNotFound | ErrorKind::QueryError | ErrorKind::TypeConstraintError
        )
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::validation("serde_json", err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_violation_is_index_kind() {
        let err = StoreError::index(IndexErrorKind::UniqueViolation, "email_idx", "duplicate key a@x");
        assert_eq!(err.kind(), ErrorKind::IndexError);
        assert_eq!(err.context(), "email_idx");
    }

    #[test]
    fn validation_errors_are_recoverable() {
        let err = StoreError::validation("email", "must be a string");
        assert!(err.is_recoverable());
    }

    #[test]
    fn transaction_errors_are_not_recoverable() {
        let err = StoreError::transaction(TransactionErrorKind::WrongState, "tx-1", "already committed");
        assert!(!err.is_recoverable());
    }
}
