use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Failed to create resource: {0}")]
    Creation(String),

    #[error("ETag mismatch for resource {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("reserved")]
    MethodNotAllowed,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Conflict(_) => StatusCode::PRECONDITION_FAILED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!(
                error_type = std::any::type_name_of_val(&self),
                error_message = %message,
                "Request failed"
            );
        } else {
            tracing::debug!(status = %status, error_message = %message, "Request rejected");
        }

        (status, message).into_response()
    }
}

/// Result type alias for handlers
pub type Result<T> = std::result::Result<T, AppError>;
