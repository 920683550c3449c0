// crates/backend-lib/src/error.rs

//! Central error type + Axum integration.
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Application error types with error codes and context
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Room is full (limit {limit})")]
    Capacity { limit: u32 },

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidState(_) | AppError::Capacity { .. } => StatusCode::CONFLICT,
            AppError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::TransientIo(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VAL_001",
            AppError::Unauthorized(_) => "AUTH_001",
            AppError::Forbidden(_) => "AUTH_002",
            AppError::NotFound(_) => "NF_001",
            AppError::InvalidState(_) => "STATE_001",
            AppError::Capacity { .. } => "CAP_001",
            AppError::Timeout(_) => "TIME_001",
            AppError::RateLimited => "RATE_001",
            AppError::TransientIo(_) => "IO_002",
            AppError::Io(_) => "IO_001",
            AppError::Json(_) => "JSON_001",
            AppError::Internal(_) => "INT_001",
        }
    }

    /// Get a sanitized message suitable for production use
    pub fn sanitized_message(&self) -> String {
        match self {
            AppError::Validation(_) => "Invalid input provided".to_string(),
            AppError::Unauthorized(_) => "Authentication failed".to_string(),
            AppError::Forbidden(_) => "Not permitted".to_string(),
            AppError::NotFound(_) => "Resource not found".to_string(),
            AppError::InvalidState(_) => "Operation not valid in the current state".to_string(),
            AppError::Capacity { .. } => "The room is full".to_string(),
            AppError::Timeout(_) => "The operation timed out".to_string(),
            AppError::RateLimited => "Rate limit exceeded, please try again later".to_string(),
            AppError::TransientIo(_) => "Temporary storage failure, please retry".to_string(),
            AppError::Json(_) => "Invalid request format".to_string(),
            AppError::Io(_) | AppError::Internal(_) => {
                "An internal server error occurred".to_string()
            },
        }
    }

    /// Whether the caller may usefully retry the operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::TransientIo(_) | AppError::Timeout(_))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_code = self.error_code();

        // Use detailed messages in development, sanitized in production
        let message = if cfg!(debug_assertions) {
            self.to_string()
        } else {
            self.sanitized_message()
        };

        let body = serde_json::json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        });

        (status, axum::Json(body)).into_response()
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for AppError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        AppError::Internal("Room actor is gone".to_string())
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for AppError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        AppError::Internal("Room actor dropped the response channel".to_string())
    }
}

impl From<crate::validation::ValidationError> for AppError {
    fn from(err: crate::validation::ValidationError) -> Self {
        AppError::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    #[test]
    fn test_app_error_status_codes() {
        assert_eq!(
            AppError::Validation("bad title".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::Unauthorized("bad token".to_string()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::Forbidden("not host".to_string()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AppError::InvalidState("already live".to_string()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::Capacity { limit: 2 }.status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(AppError::RateLimited.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            AppError::TransientIo("disk".to_string()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_app_error_error_codes() {
        assert_eq!(AppError::NotFound("x".to_string()).error_code(), "NF_001");
        assert_eq!(AppError::Capacity { limit: 5 }.error_code(), "CAP_001");
        assert_eq!(AppError::RateLimited.error_code(), "RATE_001");
        assert_eq!(
            AppError::Timeout("join".to_string()).error_code(),
            "TIME_001"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(AppError::TransientIo("disk".to_string()).is_transient());
        assert!(AppError::Timeout("join".to_string()).is_transient());
        assert!(!AppError::Forbidden("nope".to_string()).is_transient());
    }

    #[test]
    fn test_app_error_into_response() {
        let response = AppError::NotFound("session".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response_headers = response.headers();
        assert!(response_headers
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .contains("application/json"));
    }
}
