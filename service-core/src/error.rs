use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(anyhow::Error),

    #[error("Not found: {0}")]
    NotFound(anyhow::Error),

    #[error("Already exists: {0}")]
    AlreadyExists(anyhow::Error),

    #[error("Failed precondition: {0}")]
    FailedPrecondition(anyhow::Error),

    #[error("Unauthenticated: {0}")]
    Unauthenticated(anyhow::Error),

    #[error("Permission denied: {0}")]
    PermissionDenied(anyhow::Error),

    /// Concurrent transaction conflict; the caller may retry.
    #[error("Aborted: {0}")]
    Aborted(anyhow::Error),

    #[error("Service Unavailable")]
    ServiceUnavailable,

    #[error("Internal server error: {0}")]
    InternalError(#[from] anyhow::Error),

    #[error("Database error: {0}")]
    DatabaseError(anyhow::Error),

    #[error("Configuration error: {0}")]
    ConfigError(anyhow::Error),
}

impl AppError {
    /// Short machine-readable label, used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::InvalidArgument(_) => "invalid_argument",
            AppError::NotFound(_) => "not_found",
            AppError::AlreadyExists(_) => "already_exists",
            AppError::FailedPrecondition(_) => "failed_precondition",
            AppError::Unauthenticated(_) => "unauthenticated",
            AppError::PermissionDenied(_) => "permission_denied",
            AppError::Aborted(_) => "aborted",
            AppError::ServiceUnavailable => "unavailable",
            AppError::InternalError(_) => "internal",
            AppError::DatabaseError(_) => "database",
            AppError::ConfigError(_) => "config",
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(anyhow::Error::new(err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(anyhow::Error::new(err))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: String,
            #[serde(skip_serializing_if = "Option::is_none")]
            details: Option<String>,
        }

        let (status, error_message, details) = match self {
            AppError::InvalidArgument(err) => (StatusCode::BAD_REQUEST, err.to_string(), None),
            AppError::NotFound(err) => (StatusCode::NOT_FOUND, err.to_string(), None),
            AppError::AlreadyExists(err) => (StatusCode::CONFLICT, err.to_string(), None),
            AppError::FailedPrecondition(err) => {
                (StatusCode::PRECONDITION_FAILED, err.to_string(), None)
            }
            AppError::Unauthenticated(err) => (StatusCode::UNAUTHORIZED, err.to_string(), None),
            AppError::PermissionDenied(err) => (StatusCode::FORBIDDEN, err.to_string(), None),
            AppError::Aborted(err) => (StatusCode::CONFLICT, err.to_string(), None),
            AppError::ServiceUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Service unavailable".to_string(),
                None,
            ),
            AppError::InternalError(err) => {
                tracing::error!(error = %err, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    None,
                )
            }
            AppError::DatabaseError(err) => {
                tracing::error!(error = %err, "Database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Database error".to_string(),
                    None,
                )
            }
            AppError::ConfigError(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Configuration error".to_string(),
                Some(err.to_string()),
            ),
        };

        (
            status,
            Json(ErrorResponse {
                error: error_message,
                details,
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_error_hides_details() {
        let response = AppError::InternalError(anyhow::anyhow!("secret path")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(
            AppError::PermissionDenied(anyhow::anyhow!("no")).kind(),
            "permission_denied"
        );
        assert_eq!(AppError::ServiceUnavailable.kind(), "unavailable");
    }

    #[test]
    fn test_failed_precondition_maps_to_412() {
        let response =
            AppError::FailedPrecondition(anyhow::anyhow!("group not empty")).into_response();
        assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
    }
}
