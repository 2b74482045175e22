//! HTTP API error types shared by the surveyor services.
//!
//! Provides a unified `ApiError` enum for consistent error responses across
//! every HTTP surface. Implements Axum's `IntoResponse` trait so handlers can
//! bubble errors with `?` and get the right status and `{"detail": ...}`
//! body.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors surfaced by HTTP handlers, mapped 1:1 onto response statuses.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Missing or unparseable bearer credential.
    #[error("Not authenticated")]
    NotAuthenticated,

    /// Signature/format/expiry/kind failure. The reason is deliberately not
    /// included in the response.
    #[error("Invalid or expired token")]
    InvalidToken,

    /// Role guard failed.
    #[error("{0}")]
    Forbidden(String),

    /// Entity or tenant absent.
    #[error("{0}")]
    NotFound(String),

    /// Duplicate permission, duplicate provider link, and similar.
    #[error("{0}")]
    Conflict(String),

    /// Daily quota or per-hour cap exceeded. Carries the retry-after hint.
    #[error("{detail}")]
    RateLimited { detail: String, retry_after: u64 },

    /// Downstream connect failure.
    #[error("{0}")]
    UpstreamUnavailable(String),

    /// Downstream timeout.
    #[error("{0}")]
    UpstreamTimeout(String),

    /// Schema or parse failure in the request.
    #[error("{0}")]
    Validation(String),

    /// Anything else.
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotAuthenticated | ApiError::InvalidToken => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// ---------------------------------------------------------------------------
// IntoResponse implementation
// ---------------------------------------------------------------------------

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let detail = self.to_string();

        match self {
            ApiError::RateLimited { retry_after, .. } => (
                status,
                [("Retry-After", retry_after.to_string())],
                Json(json!({ "detail": detail })),
            )
                .into_response(),
            ApiError::NotAuthenticated | ApiError::InvalidToken => (
                status,
                [("WWW-Authenticate", "Bearer".to_string())],
                Json(json!({ "detail": detail })),
            )
                .into_response(),
            _ => (status, Json(json!({ "detail": detail }))).into_response(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
