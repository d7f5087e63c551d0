use std::collections::BTreeMap;

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Authentication error: {0}")]
    Unauthorized(String),

    /// Field name -> human readable reason
    #[error("Validation failed: {0:?}")]
    Validation(BTreeMap<&'static str, String>),

    #[error("Rate limit exceeded, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },

    #[error("Connection capacity exceeded")]
    CapacityExceeded { retry_after: u64 },

    #[error("Server is draining")]
    Draining { retry_after: u64 },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Check if running in production mode (based on RUN_MODE env var)
fn is_production() -> bool {
    std::env::var("RUN_MODE")
        .map(|m| m == "production" || m == "prod")
        .unwrap_or(false)
}

fn masked(detail: &str, public: &str) -> String {
    if is_production() {
        public.to_string()
    } else {
        detail.to_string()
    }
}

impl AppError {
    fn parts(&self) -> (StatusCode, Value, Option<u64>) {
        match self {
            AppError::Config(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({
                    "error": "internal_error",
                    "message": masked(&e.to_string(), "Configuration error"),
                }),
                None,
            ),
            AppError::Unauthorized(msg) => (
                StatusCode::UNAUTHORIZED,
                json!({ "error": "unauthorized", "message": msg }),
                None,
            ),
            AppError::Validation(errors) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "validation_failed", "errors": errors }),
                None,
            ),
            AppError::RateLimited { retry_after } => (
                StatusCode::TOO_MANY_REQUESTS,
                json!({ "error": "rate_limit_exceeded", "retryAfter": retry_after }),
                Some(*retry_after),
            ),
            AppError::CapacityExceeded { retry_after } => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "error": "capacity_exceeded", "retryAfter": retry_after }),
                Some(*retry_after),
            ),
            AppError::Draining { retry_after } => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "error": "server_draining", "retryAfter": retry_after }),
                Some(*retry_after),
            ),
            AppError::Internal(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({
                    "error": "internal_error",
                    "message": masked(e, "Internal server error"),
                }),
                None,
            ),
            AppError::Store(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({
                    "error": "internal_error",
                    "message": masked(&e.to_string(), "Service temporarily unavailable"),
                }),
                None,
            ),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body, retry_after) = self.parts();

        if status.is_server_error() {
            // Always log the detailed error server-side
            tracing::error!(status = %status.as_u16(), error = %self, "API error");
        } else {
            tracing::debug!(status = %status.as_u16(), error = %self, "Request rejected");
        }

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_body_and_status() {
        let (status, body, retry) = AppError::RateLimited { retry_after: 17 }.parts();
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"], "rate_limit_exceeded");
        assert_eq!(body["retryAfter"], 17);
        assert_eq!(retry, Some(17));
    }

    #[test]
    fn test_validation_lists_fields() {
        let mut errors = BTreeMap::new();
        errors.insert("message", "Message is required".to_string());
        let (status, body, _) = AppError::Validation(errors).parts();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation_failed");
        assert_eq!(body["errors"]["message"], "Message is required");
    }

    #[test]
    fn test_retry_after_header_is_set() {
        let response = AppError::Draining { retry_after: 5 }.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "5");
    }
}
