//! Server-specific error types

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// API error types
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The graph database or the mapping store failed
    #[error("Upstream error: {0}")]
    Upstream(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            ApiError::Unauthorized(ref message) => (StatusCode::UNAUTHORIZED, message.clone()),
            ApiError::Forbidden(ref message) => (StatusCode::FORBIDDEN, message.clone()),
            ApiError::Upstream(ref e) => {
                tracing::error!("Mapping refresh failed: {:#}", e);
                (StatusCode::BAD_GATEWAY, "Mapping refresh failed".to_string())
            }
        };

        let body = Json(json!({
            "error": {
                "message": error_message,
                "status": status.as_u16(),
            }
        }));

        (status, body).into_response()
    }
}
