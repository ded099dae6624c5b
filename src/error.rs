use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::token::TokenKind;
use crate::validation::Violation;

/// Application-wide error types with appropriate HTTP status codes.
///
/// # Token Errors
///
/// Token failures are distinguished internally so they can be logged and
/// counted separately, but every one of them is rendered to the client as the
/// same `invalid_token` response. A caller probing with forged or revoked
/// tokens learns nothing about which check rejected it.
///
/// # Store Errors
///
/// `StoreUnavailable` is an infrastructure fault, not a client error. Whether
/// it reaches the client at all depends on the configured
/// [`StoreFailurePolicy`](crate::store::StoreFailurePolicy).
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Token has expired")]
    ExpiredToken,

    #[error("Token integrity check failed: {0}")]
    InvalidSignature(String),

    #[error("Token has been revoked")]
    RevokedToken,

    #[error("Wrong token kind: expected {expected}, got {actual}")]
    WrongTokenKind {
        expected: TokenKind,
        actual: TokenKind,
    },

    #[error("Missing credentials: {0}")]
    MissingCredentials(String),

    #[error("Insufficient scope: requires {}", .required.join(" "))]
    InsufficientScope { required: Vec<String> },

    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Unknown encryption key: {0}")]
    UnknownEncryptionKey(String),

    #[error("Encrypted payload failed authentication")]
    AuthenticationFailure,

    #[error("Request failed input validation ({} violations)", .0.len())]
    ValidationViolation(Vec<Violation>),

    #[error("Request too large: {0}")]
    PayloadTooLarge(String),

    #[error("Shared store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Malformed encrypted payload: {0}")]
    MalformedPayload(String),

    #[error("Keyring error: {0}")]
    KeyringError(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl AppError {
    /// Short, stable label for logs and metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            AppError::ExpiredToken => "expired_token",
            AppError::InvalidSignature(_) => "invalid_signature",
            AppError::RevokedToken => "revoked_token",
            AppError::WrongTokenKind { .. } => "wrong_token_kind",
            AppError::MissingCredentials(_) => "missing_credentials",
            AppError::InsufficientScope { .. } => "insufficient_scope",
            AppError::RateLimited { .. } => "rate_limited",
            AppError::UnknownEncryptionKey(_) => "unknown_encryption_key",
            AppError::AuthenticationFailure => "authentication_failure",
            AppError::ValidationViolation(_) => "validation_violation",
            AppError::PayloadTooLarge(_) => "payload_too_large",
            AppError::StoreUnavailable(_) => "store_unavailable",
            AppError::MalformedPayload(_) => "malformed_payload",
            AppError::KeyringError(_) => "keyring_error",
            AppError::BadRequest(_) => "bad_request",
            AppError::Internal(_) => "internal_error",
            AppError::ConfigError(_) => "config_error",
            AppError::SerializationError(_) => "serialization_error",
        }
    }

    /// Whether this error is one of the bearer-token failures that map to 401.
    pub fn is_token_error(&self) -> bool {
        matches!(
            self,
            AppError::ExpiredToken
                | AppError::InvalidSignature(_)
                | AppError::RevokedToken
                | AppError::WrongTokenKind { .. }
                | AppError::MissingCredentials(_)
        )
    }
}

/// Error response body for API endpoints.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Server faults are logged here; client rejections are logged by the
        // pipeline stage that produced them, with request context attached.
        match &self {
            AppError::Internal(_)
            | AppError::ConfigError(_)
            | AppError::KeyringError(_)
            | AppError::StoreUnavailable(_) => {
                tracing::error!(error = %self, "Request failed");
            }
            _ => tracing::debug!(error = %self, reason = self.reason(), "Request rejected"),
        }

        let mut details = None;
        let mut www_authenticate: Option<String> = None;
        let mut retry_after: Option<u64> = None;

        let (status, error_type, message) = match &self {
            // Every token failure reads the same from the outside
            AppError::ExpiredToken
            | AppError::InvalidSignature(_)
            | AppError::RevokedToken
            | AppError::WrongTokenKind { .. } => {
                www_authenticate = Some(r#"Bearer error="invalid_token""#.to_string());
                (
                    StatusCode::UNAUTHORIZED,
                    "invalid_token",
                    "The access token is invalid.".to_string(),
                )
            }
            AppError::MissingCredentials(msg) => {
                www_authenticate = Some("Bearer".to_string());
                (StatusCode::UNAUTHORIZED, "unauthorized", msg.clone())
            }
            AppError::InsufficientScope { required } => {
                let scope = required.join(" ");
                www_authenticate = Some(format!(
                    r#"Bearer error="insufficient_scope", scope="{scope}""#
                ));
                (
                    StatusCode::FORBIDDEN,
                    "insufficient_scope",
                    format!("Not enough permissions. Required: {scope}"),
                )
            }
            AppError::RateLimited { retry_after_secs } => {
                retry_after = Some(*retry_after_secs);
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    "too_many_requests",
                    "Rate limit exceeded. Please retry later.".to_string(),
                )
            }
            AppError::ValidationViolation(violations) => {
                details = serde_json::to_value(violations).ok();
                (
                    StatusCode::BAD_REQUEST,
                    "validation_violation",
                    "Request contains potentially malicious input.".to_string(),
                )
            }
            AppError::PayloadTooLarge(_) => (
                StatusCode::PAYLOAD_TOO_LARGE,
                "payload_too_large",
                "Request is too large.".to_string(),
            ),

            // Decryption failures never say which check failed
            AppError::UnknownEncryptionKey(_) | AppError::AuthenticationFailure => (
                StatusCode::BAD_REQUEST,
                "decryption_failed",
                "Payload could not be decrypted.".to_string(),
            ),
            AppError::MalformedPayload(_) => (
                StatusCode::BAD_REQUEST,
                "malformed_payload",
                "Encrypted payload is malformed.".to_string(),
            ),

            // Infrastructure - don't leak store or keyring details
            AppError::StoreUnavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "store_unavailable",
                "Security backend is temporarily unavailable. Please try again later.".to_string(),
            ),
            AppError::KeyringError(_) | AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "An internal error occurred. Please contact support if the issue persists."
                    .to_string(),
            ),
            AppError::ConfigError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                "Service configuration error. Please contact support.".to_string(),
            ),

            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            AppError::SerializationError(e) => (
                StatusCode::BAD_REQUEST,
                "serialization_error",
                sanitize_serde_error(e),
            ),
        };

        let body = ErrorResponse {
            error: error_type.to_string(),
            message,
            details,
        };

        let mut response = (status, axum::Json(body)).into_response();
        let headers = response.headers_mut();
        if let Some(value) = www_authenticate
            && let Ok(value) = HeaderValue::from_str(&value)
        {
            headers.insert(header::WWW_AUTHENTICATE, value);
        }
        if let Some(secs) = retry_after {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

/// Sanitize serde error messages to avoid leaking internal type information.
fn sanitize_serde_error(e: &serde_json::Error) -> String {
    let msg = e.to_string();

    if msg.contains("missing field")
        && let Some(start) = msg.find('`')
        && let Some(end) = msg[start + 1..].find('`')
    {
        let field = &msg[start + 1..start + 1 + end];
        return format!("Missing required field: {field}");
    }

    if msg.contains("invalid type") {
        return "Invalid data type in request body".to_string();
    }

    if msg.contains("EOF while parsing") || msg.contains("expected") {
        return "Malformed JSON in request body".to_string();
    }

    "Invalid request format".to_string()
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;
