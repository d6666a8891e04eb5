// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Shared-secret authentication for `/tasks/*` routes.

use crate::AppState;
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// Header carrying the task secret.
pub const TASK_SECRET_HEADER: &str = "x-task-secret";

/// Require the configured task secret, compared in constant time.
pub async fn require_tasks_auth(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let provided = request
        .headers()
        .get(TASK_SECRET_HEADER)
        .map(|h| h.as_bytes())
        .unwrap_or_default();
    let expected = state.config.task_secret.as_bytes();

    if expected.is_empty() || !bool::from(provided.ct_eq(expected)) {
        tracing::warn!(
            path = %request.uri().path(),
            present = !provided.is_empty(),
            "Blocked tasks request with invalid secret"
        );
        return Err(StatusCode::FORBIDDEN);
    }

    Ok(next.run(request).await)
}
