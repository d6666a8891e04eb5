// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Task routes for scheduled and operator-triggered maintenance.
//!
//! These endpoints are called by an external scheduler or an operator, not
//! by users. They are protected by the shared task secret.

use crate::config::STRAVA_PROVIDER;
use crate::error::Result;
use crate::middleware::tasks_auth::require_tasks_auth;
use crate::services::drainer::DrainReport;
use crate::services::queue::{DeadLetter, Lane, RedriveReport};
use crate::services::rate_limit::WindowKind;
use crate::AppState;
use axum::{
    extract::{Json, Query, State},
    middleware,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_DEAD_LETTER_LIMIT: usize = 50;
const MAX_DEAD_LETTER_LIMIT: usize = 500;

/// Task routes, guarded by the task secret.
pub fn routes(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/tasks/drain", post(drain))
        .route("/tasks/drain-batch", post(drain_batch))
        .route("/tasks/prune-audit", post(prune_audit))
        .route("/tasks/dead-letters", get(list_dead_letters))
        .route("/tasks/dead-letters/redrive", post(redrive_dead_letters))
        .route("/tasks/usage", get(usage))
        .route_layer(middleware::from_fn_with_state(state, require_tasks_auth))
}

#[derive(Deserialize)]
struct DrainParams {
    live: Option<usize>,
    backfill: Option<usize>,
}

/// Drain the live then backfill lanes.
async fn drain(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DrainParams>,
) -> Result<Json<DrainReport>> {
    let settings = &state.config.drain;
    let report = state
        .drainer
        .drain(
            params.live.unwrap_or(settings.live_batch),
            params.backfill.unwrap_or(settings.backfill_batch),
        )
        .await?;
    Ok(Json(report))
}

#[derive(Deserialize)]
struct BatchParams {
    max: Option<usize>,
    delay_ms: Option<u64>,
}

/// Drain the batch lane.
async fn drain_batch(
    State(state): State<Arc<AppState>>,
    Query(params): Query<BatchParams>,
) -> Result<Json<DrainReport>> {
    let settings = &state.config.drain;
    let report = state
        .drainer
        .drain_batch(
            params.max.unwrap_or(settings.batch_max),
            Duration::from_millis(params.delay_ms.unwrap_or(settings.batch_delay_ms)),
        )
        .await?;
    Ok(Json(report))
}

#[derive(Serialize)]
struct PruneResponse {
    removed: usize,
}

/// Delete audit entries past retention.
async fn prune_audit(State(state): State<Arc<AppState>>) -> Result<Json<PruneResponse>> {
    let removed = state.audit.prune().await?;
    Ok(Json(PruneResponse { removed }))
}

#[derive(Deserialize)]
struct LimitParams {
    limit: Option<usize>,
}

impl LimitParams {
    fn limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_DEAD_LETTER_LIMIT)
            .min(MAX_DEAD_LETTER_LIMIT)
    }
}

#[derive(Serialize)]
struct DeadLettersResponse {
    total: u64,
    letters: Vec<DeadLetter>,
}

/// List the oldest dead letters.
async fn list_dead_letters(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LimitParams>,
) -> Result<Json<DeadLettersResponse>> {
    let total = state.queue.len(Lane::Dead).await?;
    let letters = state.queue.list_dead_letters(params.limit()).await?;
    Ok(Json(DeadLettersResponse { total, letters }))
}

/// Move dead letters back onto their lanes.
async fn redrive_dead_letters(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LimitParams>,
) -> Result<Json<RedriveReport>> {
    Ok(Json(state.queue.redrive(params.limit()).await?))
}

#[derive(Serialize)]
struct UsageResponse {
    provider: &'static str,
    /// Aggregate provider calls in the current window
    aggregate: BTreeMap<WindowKind, u64>,
    /// Queue depth per lane
    queues: BTreeMap<&'static str, u64>,
    /// Counter keys whose TTL is still being retried
    pending_ttls: usize,
}

/// Provider usage and queue depths.
async fn usage(State(state): State<Arc<AppState>>) -> Result<Json<UsageResponse>> {
    let aggregate = state.limiter.aggregate_usage(STRAVA_PROVIDER).await?;
    let mut queues = BTreeMap::new();
    for lane in [Lane::Live, Lane::Backfill, Lane::Batch, Lane::Dead] {
        queues.insert(lane.as_str(), state.queue.len(lane).await?);
    }
    Ok(Json(UsageResponse {
        provider: STRAVA_PROVIDER,
        aggregate,
        queues,
        pending_ttls: state.limiter.pending_ttls(),
    }))
}
