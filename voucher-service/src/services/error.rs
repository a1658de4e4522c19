//! Error types for custody operations.

use service_core::error::AppError;
use thiserror::Error;

/// Storage-layer failure.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Serialization failure or lost race on a unique key.
    #[error("transaction conflict: {0}")]
    Conflict(String),

    #[error("corrupt group tree: {0}")]
    CorruptTree(String),

    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            // 40001 serialization_failure, 40P01 deadlock_detected
            let conflict = matches!(db_err.code().as_deref(), Some("40001") | Some("40P01"))
                || db_err.is_unique_violation();
            if conflict {
                return StoreError::Conflict(db_err.message().to_string());
            }
        }
        StoreError::Database(err)
    }
}

/// Outcome of a rejected custody operation.
#[derive(Debug, Error)]
pub enum CustodyError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    FailedPrecondition(String),

    #[error("{0}")]
    AlreadyExists(String),

    #[error("{0}")]
    PermissionDenied(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("voucher signing failed: {0}")]
    Signing(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CustodyError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn failed_precondition(msg: impl Into<String>) -> Self {
        Self::FailedPrecondition(msg.into())
    }

    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists(msg.into())
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}

impl From<CustodyError> for AppError {
    fn from(err: CustodyError) -> Self {
        match err {
            CustodyError::NotFound(msg) => AppError::NotFound(anyhow::anyhow!(msg)),
            CustodyError::FailedPrecondition(msg) => {
                AppError::FailedPrecondition(anyhow::anyhow!(msg))
            }
            CustodyError::AlreadyExists(msg) => AppError::AlreadyExists(anyhow::anyhow!(msg)),
            CustodyError::PermissionDenied(msg) => {
                AppError::PermissionDenied(anyhow::anyhow!(msg))
            }
            CustodyError::InvalidArgument(msg) => AppError::InvalidArgument(anyhow::anyhow!(msg)),
            CustodyError::Signing(msg) => {
                AppError::InternalError(anyhow::anyhow!("voucher signing failed: {}", msg))
            }
            CustodyError::Store(StoreError::Conflict(msg)) => AppError::Aborted(anyhow::anyhow!(
                "concurrent modification, retry the request: {}",
                msg
            )),
            CustodyError::Store(StoreError::Database(e)) => {
                AppError::DatabaseError(anyhow::Error::new(e))
            }
            CustodyError::Store(e @ StoreError::CorruptTree(_)) => {
                AppError::InternalError(anyhow::Error::new(e))
            }
        }
    }
}
