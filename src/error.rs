// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Application error types with consistent API responses.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Application error type that converts to HTTP responses.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// A tier or provider budget is exhausted. `reset_at` is epoch milliseconds.
    #[error("Quota exceeded: {reason}")]
    QuotaExceeded { reason: String, reset_at: i64 },

    /// The provider rejected the athlete's refresh token. Terminal for that athlete.
    #[error("Provider credentials invalid for athlete {0}")]
    CredentialsInvalid(u64),

    /// Non-2xx or network failure talking to the provider. Retryable.
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Malformed job: {0}")]
    MalformedJob(String),

    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Whether a queued job failing with this error may be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::ProviderUnavailable(_)
                | AppError::StoreUnavailable(_)
                | AppError::Database(_)
                | AppError::QuotaExceeded { .. }
        )
    }

    /// Whether the error means the athlete's provider grant is gone.
    pub fn is_credentials_error(&self) -> bool {
        matches!(self, AppError::CredentialsInvalid(_))
    }
}

impl From<crate::store::StoreError> for AppError {
    fn from(err: crate::store::StoreError) -> Self {
        AppError::StoreUnavailable(err.to_string())
    }
}

/// JSON error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reset_at: Option<i64>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, reason) = match &self {
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized", None),
            AppError::InvalidToken => (StatusCode::UNAUTHORIZED, "invalid_token", None),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", Some(msg.clone())),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", Some(msg.clone())),
            AppError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, "bad_request", Some(msg.clone()))
            }
            AppError::QuotaExceeded { reason, .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                "quota_exceeded",
                Some(reason.clone()),
            ),
            AppError::CredentialsInvalid(_) => {
                (StatusCode::FORBIDDEN, "credentials_invalid", None)
            }
            AppError::ProviderUnavailable(msg) => {
                // Raw provider text stays in the logs, not in the response.
                tracing::warn!(error = %msg, "Provider unavailable");
                (
                    StatusCode::BAD_GATEWAY,
                    "provider_unavailable",
                    Some("provider_error".to_string()),
                )
            }
            AppError::MalformedJob(msg) => {
                (StatusCode::BAD_REQUEST, "malformed_job", Some(msg.clone()))
            }
            AppError::StoreUnavailable(msg) => {
                tracing::error!(error = %msg, "Counter store unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "store_unavailable",
                    Some("counter_store".to_string()),
                )
            }
            AppError::Database(msg) => {
                tracing::error!(error = %msg, "Database error");
                (StatusCode::INTERNAL_SERVER_ERROR, "database_error", None)
            }
            AppError::Internal(err) => {
                tracing::error!(error = %err, "Internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", None)
            }
        };

        let reset_at = match &self {
            AppError::QuotaExceeded { reset_at, .. } => Some(*reset_at),
            _ => None,
        };

        let body = ErrorResponse {
            error: error.to_string(),
            reason,
            reset_at,
        };

        let mut response = (status, Json(body)).into_response();

        if let Some(reset_at) = reset_at {
            let wait_secs = (reset_at - chrono::Utc::now().timestamp_millis()).max(0) / 1000 + 1;
            if let Ok(value) = HeaderValue::from_str(&wait_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}

/// Result type alias for handlers
pub type Result<T> = std::result::Result<T, AppError>;
