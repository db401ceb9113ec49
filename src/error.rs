//! # Error Handling
//!
//! Central error taxonomy and its mapping to HTTP responses.
//!
//! ## Error Categories:
//! - **Internal/ConfigError**: server-side problems (500)
//! - **BadRequest/ValidationError**: client sent invalid data (400)
//! - **NotFound**: requested resource doesn't exist (404)
//! - **RateLimited**: admission denied by the sliding-window limiter (429,
//!   with `Retry-After` and `X-RateLimit-*` headers so clients can back off)
//!
//! Backend and playback failures deliberately do NOT appear here as HTTP
//! errors: the core recovers from both locally (fallback analyzer, queue
//! advance) and the caller still gets a usable response.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

#[derive(Debug)]
pub enum AppError {
    /// Internal server errors
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource was not found
    NotFound(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// User input failed validation rules
    ValidationError(String),

    /// Rate limit exceeded for this client
    RateLimited {
        /// Requests left in the window (always 0 when denied)
        remaining: u32,
        /// Seconds until the client should retry
        retry_after_secs: u64,
    },
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::RateLimited { retry_after_secs, .. } => {
                write!(f, "Rate limit exceeded, retry in {}s", retry_after_secs)
            }
        }
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        // Rate limiting carries extra headers, so it builds its own response.
        if let AppError::RateLimited { remaining, retry_after_secs } = self {
            return HttpResponse::TooManyRequests()
                .insert_header(("Retry-After", retry_after_secs.to_string()))
                .insert_header(("X-RateLimit-Remaining", remaining.to_string()))
                .insert_header(("X-RateLimit-Reset", retry_after_secs.to_string()))
                .json(json!({
                    "error": {
                        "type": "rate_limited",
                        "message": format!(
                            "Too many requests. Try again in {} seconds.",
                            retry_after_secs
                        ),
                        "remaining": remaining,
                        "reset": retry_after_secs,
                        "timestamp": chrono::Utc::now().to_rfc3339()
                    }
                }));
        }

        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,
                "not_found",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                msg.clone(),
            ),
            AppError::ValidationError(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "validation_error",
                msg.clone(),
            ),
            AppError::RateLimited { .. } => unreachable!("handled above"),
        };

        HttpResponse::build(status).json(json!({
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
        AppError::Internal(err.to_string())
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

/// Shorthand for handler results.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;

    #[test]
    fn rate_limited_maps_to_429_with_headers() {
        let err = AppError::RateLimited {
            remaining: 0,
            retry_after_secs: 42,
        };
        let response = err.error_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let headers = response.headers();
        assert_eq!(headers.get("Retry-After").unwrap(), "42");
        assert_eq!(headers.get("X-RateLimit-Remaining").unwrap(), "0");
        assert_eq!(headers.get("X-RateLimit-Reset").unwrap(), "42");
    }

    #[test]
    fn bad_request_maps_to_400() {
        let err = AppError::BadRequest("code too short".to_string());
        assert_eq!(err.error_response().status(), StatusCode::BAD_REQUEST);
    }
}
