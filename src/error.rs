//! # Error Handling
//!
//! HTTP-facing error type. Every handler returns `Result<HttpResponse, AppError>`
//! and actix-web turns the error into a JSON body through [`ResponseError`].
//!
//! ## Response Format:
//! ```json
//! {"error": {"type": "service_unavailable", "message": "...", "timestamp": "2024-..."}}
//! ```
//!
//! ## Error Sources:
//! - **anyhow::Error**: Internal failures (500)
//! - **serde_json / config**: Bad request bodies and configuration problems
//! - **CodecError**: Undecodable audio uploads (400)
//! - **SessionLimitReached**: Too many streaming sessions (503)

use crate::audio::codec::CodecError;
use crate::audio::session::SessionLimitReached;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

#[derive(Debug)]
pub enum AppError {
    /// Unexpected server-side failure (500)
    Internal(String),

    /// Malformed request (400)
    BadRequest(String),

    ConfigError(String),

    /// Well-formed request with values that fail validation (400)
    ValidationError(String),

    /// Temporarily unable to serve, e.g. session cap reached (503)
    ServiceUnavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

impl AppError {
    /// Machine-readable type and human-readable message.
    fn parts(&self) -> (&'static str, &str) {
        match self {
            AppError::Internal(msg) => ("internal_error", msg),
            AppError::BadRequest(msg) => ("bad_request", msg),
            AppError::ConfigError(msg) => ("config_error", msg),
            AppError::ValidationError(msg) => ("validation_error", msg),
            AppError::ServiceUnavailable(msg) => ("service_unavailable", msg),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = self.parts();

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<CodecError> for AppError {
    fn from(err: CodecError) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

impl From<SessionLimitReached> for AppError {
    fn from(err: SessionLimitReached) -> Self {
        AppError::ServiceUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    #[test]
    fn test_status_codes() {
        assert_eq!(AppError::BadRequest("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            AppError::from(SessionLimitReached { max_sessions: 3 }).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::from(anyhow::anyhow!("boom")).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[actix_web::test]
    async fn test_error_body_shape() {
        let error = AppError::from(CodecError::InvalidWav("truncated".to_string()));
        let response = error.error_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = to_bytes(response.into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["type"], "bad_request");
        assert_eq!(value["error"]["message"], "Invalid WAV file: truncated");
        assert!(value["error"]["timestamp"].is_string());
    }
}
