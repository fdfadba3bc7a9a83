//! # Error Handling
//!
//! Request-level errors and how they are turned into HTTP responses.
//!
//! ## Where errors surface:
//! Most failures in this service are *not* HTTP errors. Recognition and codec
//! failures complete the request with a `QueryRetry` part in the bespoke
//! multipart reply (see `protocol::response`), because the dictation client only
//! understands that format. `AppError` covers the remaining cases:
//! - the upload cannot be framed at all (no boundary in `content-type`)
//! - the upload body cannot be read, or stalls past the read timeout
//! - the upload exceeds the configured size or frame limit
//! - diagnostics endpoints fail (missing recording, I/O failure)
//! - configuration problems at startup
//!
//! ## Response Format:
//! ```json
//! {
//!   "error": {
//!     "type": "bad_request",
//!     "message": "content-type header carries no boundary parameter",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors that end a request with a non-protocol HTTP response.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500)
/// - **BadRequest**: Client sent an upload we cannot frame or read (400)
/// - **Timeout**: Client stopped sending body bytes (408)
/// - **PayloadTooLarge**: Upload exceeded the configured size or frame limit (413)
/// - **NotFound**: Requested diagnostic resource does not exist (404)
/// - **ConfigError**: Configuration problems (500)
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors (I/O failures, engine construction, etc.)
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// The request body stalled for longer than the configured read timeout
    Timeout(String),

    /// The upload grew past `audio.max_upload_bytes` or `audio.max_frames`
    PayloadTooLarge(String),

    /// Requested resource was not found
    NotFound(String),

    /// Configuration file or environment variable problems
    ConfigError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::Timeout(msg) => write!(f, "Timed out: {}", msg),
            AppError::PayloadTooLarge(msg) => write!(f, "Payload too large: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

/// Converts errors into JSON HTTP responses.
///
/// ## HTTP Status Code Mapping:
/// - Internal/ConfigError → 500
/// - BadRequest → 400
/// - Timeout → 408
/// - PayloadTooLarge → 413
/// - NotFound → 404
impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = match self {
            AppError::Internal(msg) => ("internal_error", msg),
            AppError::BadRequest(msg) => ("bad_request", msg),
            AppError::Timeout(msg) => ("timeout", msg),
            AppError::PayloadTooLarge(msg) => ("payload_too_large", msg),
            AppError::NotFound(msg) => ("not_found", msg),
            AppError::ConfigError(msg) => ("config_error", msg),
        };

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Any `anyhow` error reaching a handler is a server-side failure.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

/// JSON errors only occur while rendering diagnostics, never from client input.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(format!("JSON serialization error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => AppError::NotFound(err.to_string()),
            _ => AppError::Internal(err.to_string()),
        }
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;
