// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! API routes for authenticated mobile clients.
//!
//! Read endpoints carry edge cache headers: `Cache-Control` with
//! `max-age`/`s-maxage`, `Vary: Authorization` so one athlete's response is
//! never served to another, and a content `ETag` for conditional requests.

use crate::error::{AppError, Result};
use crate::middleware::auth::AuthUser;
use crate::services::queue::{Job, Lane};
use crate::services::rate_limit::StoreErrorPolicy;
use crate::services::reader::ReadResult;
use crate::services::strava::STREAM_KEYS;
use crate::AppState;
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Tier route name for on-demand sync.
const ROUTE_SYNC: &str = "sync";
/// Lookback for `POST /api/sync` when no `since` is given.
const DEFAULT_SYNC_LOOKBACK_DAYS: i64 = 7;

/// API routes (require authentication via JWT).
/// The auth middleware is applied in routes/mod.rs for these routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/activities/{id}", get(get_activity))
        .route("/api/activities/{id}/streams", get(get_streams))
        .route("/api/sync", post(request_sync))
}

// ─── Edge caching ────────────────────────────────────────────

/// Strong ETag over the serialized body.
pub fn etag_for(body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    format!("\"{}\"", &hex::encode(digest)[..32])
}

fn if_none_match(headers: &HeaderMap, etag: &str) -> bool {
    headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(',').any(|candidate| candidate.trim() == etag || candidate.trim() == "*"))
}

/// Build a JSON response with edge cache headers, or `304` when the
/// client's copy is current.
fn edge_response(result: ReadResult, edge_ttl: u64, request_headers: &HeaderMap) -> Result<Response> {
    let body = serde_json::to_vec(&result.value)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to encode response: {}", e)))?;
    let etag = etag_for(&body);
    let not_modified = if_none_match(request_headers, &etag);

    let mut response = if not_modified {
        StatusCode::NOT_MODIFIED.into_response()
    } else {
        let mut response = Response::new(Body::from(body));
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        response
    };

    let headers = response.headers_mut();
    let cache_control = format!("public, max-age={0}, s-maxage={0}", edge_ttl);
    if let Ok(value) = HeaderValue::from_str(&cache_control) {
        headers.insert(header::CACHE_CONTROL, value);
    }
    headers.insert(header::VARY, HeaderValue::from_static("Authorization"));
    if let Ok(value) = HeaderValue::from_str(&etag) {
        headers.insert(header::ETAG, value);
    }
    headers.insert(
        "x-cache",
        HeaderValue::from_static(if result.cache_hit { "HIT" } else { "MISS" }),
    );
    if let Some(remaining) = result.remaining {
        headers.insert("x-ratelimit-remaining", HeaderValue::from(remaining));
    }
    if let Some(reset_at) = result.reset_at {
        headers.insert("x-ratelimit-reset", HeaderValue::from(reset_at / 1000));
    }

    Ok(response)
}

// ─── Activities ──────────────────────────────────────────────

/// Get an activity summary.
async fn get_activity(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(activity_id): Path<u64>,
    headers: HeaderMap,
) -> Result<Response> {
    let result = state.reader.get_activity(&user.caller(), activity_id).await?;
    edge_response(result, state.cache.edge_ttl(), &headers)
}

#[derive(Deserialize)]
pub struct StreamsQuery {
    /// Comma-separated stream types
    pub keys: Option<String>,
}

/// Parse and validate `keys=watts,heartrate`.
fn parse_stream_keys(raw: Option<&str>) -> Result<Vec<String>> {
    let raw = raw.ok_or_else(|| AppError::BadRequest("keys is required".to_string()))?;
    let mut keys: Vec<String> = Vec::new();
    for key in raw.split(',').map(str::trim).filter(|k| !k.is_empty()) {
        if !STREAM_KEYS.contains(&key) {
            return Err(AppError::BadRequest(format!("unknown stream key: {}", key)));
        }
        if !keys.iter().any(|k| k == key) {
            keys.push(key.to_string());
        }
    }
    if keys.is_empty() {
        return Err(AppError::BadRequest("keys is required".to_string()));
    }
    Ok(keys)
}

/// Get telemetry streams keyed by type.
async fn get_streams(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(activity_id): Path<u64>,
    Query(query): Query<StreamsQuery>,
    headers: HeaderMap,
) -> Result<Response> {
    let keys = parse_stream_keys(query.keys.as_deref())?;
    let result = state
        .reader
        .get_streams(&user.caller(), activity_id, &keys)
        .await?;
    edge_response(result, state.cache.edge_ttl(), &headers)
}

// ─── On-demand sync ──────────────────────────────────────────

#[derive(Deserialize)]
pub struct SyncRequest {
    /// Unix seconds; defaults to one week ago
    pub since: Option<i64>,
}

#[derive(Serialize)]
pub struct SyncResponse {
    pub queued: bool,
    pub since: i64,
    pub queue_len: u64,
}

/// Queue a reconcile scan for the caller (`POST /api/sync?since=<unix>`).
async fn request_sync(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(request): Query<SyncRequest>,
) -> Result<(StatusCode, Json<SyncResponse>)> {
    let now = state.clock.now();
    let since = request
        .since
        .unwrap_or_else(|| (now - chrono::Duration::days(DEFAULT_SYNC_LOOKBACK_DAYS)).timestamp());
    if since > now.timestamp() {
        return Err(AppError::BadRequest("since is in the future".to_string()));
    }

    let decision = state
        .limiter
        .check_tier(
            &user.athlete_id.to_string(),
            user.athlete_id,
            &user.tier,
            ROUTE_SYNC,
            StoreErrorPolicy::FailClosed,
        )
        .await?;
    if !decision.allowed {
        return Err(AppError::QuotaExceeded {
            reason: format!("tier_quota_exceeded:{}:hour", user.tier),
            reset_at: decision.reset_at,
        });
    }

    let queue_len = state
        .queue
        .enqueue(Lane::Live, Job::reconcile(user.athlete_id, since))
        .await?;

    tracing::info!(athlete_id = user.athlete_id, since, "On-demand sync queued");
    Ok((
        StatusCode::ACCEPTED,
        Json(SyncResponse {
            queued: true,
            since,
            queue_len,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_keys_are_validated_and_deduplicated() {
        assert_eq!(
            parse_stream_keys(Some("watts, heartrate,watts")).unwrap(),
            vec!["watts".to_string(), "heartrate".to_string()]
        );
        assert!(parse_stream_keys(Some("watts,secret_sauce")).is_err());
        assert!(parse_stream_keys(Some(" , ")).is_err());
        assert!(parse_stream_keys(None).is_err());
    }

    #[test]
    fn etag_is_stable_and_quoted() {
        let a = etag_for(b"{\"a\":1}");
        assert_eq!(a, etag_for(b"{\"a\":1}"));
        assert_ne!(a, etag_for(b"{\"a\":2}"));
        assert!(a.starts_with('"') && a.ends_with('"'));
        assert_eq!(a.len(), 34);
    }

    #[test]
    fn if_none_match_accepts_lists() {
        let mut headers = HeaderMap::new();
        headers.insert(header::IF_NONE_MATCH, HeaderValue::from_static("\"x\", \"y\""));
        assert!(if_none_match(&headers, "\"y\""));
        assert!(!if_none_match(&headers, "\"z\""));
    }
}
