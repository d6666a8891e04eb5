// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Webhook routes for Strava events.

use crate::services::ingest::{IngestOutcome, WebhookEvent};
use crate::AppState;
use axum::{
    body::Bytes,
    extract::{Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Webhook routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/webhook", get(verify).post(handle_event))
}

/// Strava webhook verification query params.
#[derive(Deserialize)]
struct VerifyParams {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
    #[serde(rename = "hub.verify_token")]
    verify_token: Option<String>,
}

/// Verification response.
#[derive(Serialize)]
struct VerifyResponse {
    #[serde(rename = "hub.challenge")]
    challenge: String,
}

/// Verify webhook subscription (GET).
async fn verify(
    State(state): State<Arc<AppState>>,
    Query(params): Query<VerifyParams>,
) -> Result<Json<VerifyResponse>, crate::error::AppError> {
    tracing::debug!(mode = ?params.mode, "Webhook verification request");
    let challenge = state
        .ingester
        .verify(params.challenge, params.verify_token.as_deref())?;
    Ok(Json(VerifyResponse { challenge }))
}

/// Handle incoming webhook events (POST). Always acknowledged.
async fn handle_event(State(state): State<Arc<AppState>>, body: Bytes) -> impl IntoResponse {
    let event: WebhookEvent = match serde_json::from_slice(&body) {
        Ok(e) => e,
        Err(e) => {
            tracing::error!(
                error = %e,
                payload = %String::from_utf8_lossy(&body),
                "Failed to parse webhook event"
            );
            return (StatusCode::OK, "ok");
        }
    };

    tracing::info!(
        object_type = %event.object_type,
        object_id = event.object_id,
        aspect_type = %event.aspect_type,
        owner_id = event.owner_id,
        "Webhook event received"
    );

    match state.ingester.ingest(&event).await {
        Ok(IngestOutcome::Ignored(why)) => {
            tracing::debug!(object_id = event.object_id, why, "Webhook event ignored");
        }
        Ok(outcome) => {
            tracing::debug!(object_id = event.object_id, ?outcome, "Webhook event handled");
        }
        Err(e) => {
            tracing::error!(
                object_id = event.object_id,
                owner_id = event.owner_id,
                error = %e,
                "Webhook event processing failed"
            );
        }
    }

    (StatusCode::OK, "ok")
}
