//! Error conversion utilities between `AppError` and `tonic::Status`.
//!
//! | AppError | gRPC Status |
//! |----------|-------------|
//! | `InvalidArgument` | `INVALID_ARGUMENT` |
//! | `NotFound` | `NOT_FOUND` |
//! | `AlreadyExists` | `ALREADY_EXISTS` |
//! | `FailedPrecondition` | `FAILED_PRECONDITION` |
//! | `Unauthenticated` | `UNAUTHENTICATED` |
//! | `PermissionDenied` | `PERMISSION_DENIED` |
//! | `Aborted` | `ABORTED` |
//! | `ServiceUnavailable` | `UNAVAILABLE` |
//! | `InternalError`, `DatabaseError`, `ConfigError` | `INTERNAL` |

use tonic::Status;

use crate::error::AppError;

/// Extension trait for converting types into `tonic::Status`.
pub trait IntoStatus {
    /// Convert into a `tonic::Status`.
    fn into_status(self) -> Status;
}

impl IntoStatus for AppError {
    fn into_status(self) -> Status {
        match self {
            AppError::InvalidArgument(err) => Status::invalid_argument(err.to_string()),
            AppError::NotFound(err) => Status::not_found(err.to_string()),
            AppError::AlreadyExists(err) => Status::already_exists(err.to_string()),
            AppError::FailedPrecondition(err) => Status::failed_precondition(err.to_string()),
            AppError::Unauthenticated(err) => Status::unauthenticated(err.to_string()),
            AppError::PermissionDenied(err) => Status::permission_denied(err.to_string()),
            AppError::Aborted(err) => Status::aborted(err.to_string()),
            AppError::ServiceUnavailable => Status::unavailable("Service unavailable"),
            AppError::InternalError(err) => {
                // Log the full error but don't expose it to clients
                tracing::error!(error = %err, "Internal error");
                Status::internal("Internal server error")
            }
            AppError::DatabaseError(err) => {
                tracing::error!(error = %err, "Database error");
                Status::internal("Database error")
            }
            AppError::ConfigError(err) => {
                tracing::error!(error = %err, "Configuration error");
                Status::internal("Configuration error")
            }
        }
    }
}

impl From<AppError> for Status {
    fn from(err: AppError) -> Self {
        err.into_status()
    }
}
