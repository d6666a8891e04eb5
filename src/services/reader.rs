// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Read path for the mobile API: cache, then budgets, then the provider.

use crate::config::STRAVA_PROVIDER;
use crate::db::Persistence;
use crate::error::AppError;
use crate::services::audit::AuditLog;
use crate::services::cache::{CacheKey, CacheLayer, CacheNamespace};
use crate::services::ingest::remove_athlete;
use crate::services::rate_limit::{RateLimiter, StoreErrorPolicy};
use crate::services::strava::StravaClient;
use crate::services::tokens::TokenManager;
use crate::time_utils::SharedClock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Tier route names.
pub const ROUTE_ACTIVITY: &str = "activity";
pub const ROUTE_STREAMS: &str = "streams";

/// Authenticated caller of a read path.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: String,
    pub athlete_id: u64,
    pub tier: String,
}

/// Value returned to the API layer.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadResult {
    pub value: Value,
    pub cache_hit: bool,
    /// Remaining budget after this call, when budgets were consulted
    pub remaining: Option<u64>,
    /// Epoch milliseconds
    pub reset_at: Option<i64>,
}

/// Streams cache entry. Strava omits stream types an activity does not
/// have, so the keys asked for are kept alongside what came back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct CachedStreams {
    requested: BTreeSet<String>,
    streams: Map<String, Value>,
}

impl CachedStreams {
    fn covers(&self, keys: &[String]) -> bool {
        keys.iter()
            .all(|k| self.requested.contains(k) || self.streams.contains_key(k))
    }
}

impl ReadResult {
    fn hit(value: Value) -> Self {
        Self {
            value,
            cache_hit: true,
            remaining: None,
            reset_at: None,
        }
    }
}

#[derive(Clone)]
pub struct ActivityReader {
    limiter: RateLimiter,
    tokens: TokenManager,
    strava: StravaClient,
    cache: CacheLayer,
    db: Arc<dyn Persistence>,
    audit: AuditLog,
    clock: SharedClock,
}

impl ActivityReader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        limiter: RateLimiter,
        tokens: TokenManager,
        strava: StravaClient,
        cache: CacheLayer,
        db: Arc<dyn Persistence>,
        audit: AuditLog,
        clock: SharedClock,
    ) -> Self {
        Self {
            limiter,
            tokens,
            strava,
            cache,
            db,
            audit,
            clock,
        }
    }

    /// A rejected refresh token means the grant is gone: run the same
    /// local deauthorization as the webhook path before reporting it.
    async fn revoked(&self, error: AppError, route: &str) -> AppError {
        if let AppError::CredentialsInvalid(athlete_id) = error {
            tracing::warn!(athlete_id, route, "Credentials revoked on read, deauthorizing");
            if let Err(e) = remove_athlete(
                self.db.as_ref(),
                &self.tokens,
                &self.audit,
                athlete_id,
                route,
                "provider rejected credentials",
            )
            .await
            {
                tracing::error!(athlete_id, error = %e, "Failed to remove deauthorized athlete");
            }
        }
        error
    }

    /// Activity summary for the caller's own activity.
    pub async fn get_activity(&self, caller: &Caller, activity_id: u64) -> Result<ReadResult, AppError> {
        let key = CacheKey::new(CacheNamespace::Activity, caller.athlete_id, activity_id);
        if let Some(hit) = self.cache.get(&key).await {
            tracing::debug!(athlete_id = caller.athlete_id, activity_id, "Activity cache hit");
            return Ok(ReadResult::hit(hit.value));
        }

        let decision = self
            .limiter
            .check_combined(
                &caller.user_id,
                caller.athlete_id,
                &caller.tier,
                ROUTE_ACTIVITY,
                STRAVA_PROVIDER,
                StoreErrorPolicy::FailOpen,
            )
            .await?
            .into_result()?;

        let strava = &self.strava;
        let activity = match self
            .tokens
            .call_with_token(caller.athlete_id, |token| async move {
                strava.get_activity(&token, activity_id).await
            })
            .await
        {
            Ok(activity) => activity,
            Err(e) => return Err(self.revoked(e, ROUTE_ACTIVITY).await),
        };

        let summary = activity.to_summary(caller.athlete_id, "api", self.clock.now());
        if let Err(e) = self.db.upsert_activity_summary(&summary).await {
            tracing::warn!(activity_id, error = %e, "Failed to store fetched summary");
        }

        let value = serde_json::to_value(&summary)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to encode summary: {}", e)))?;
        self.cache.set(&key, value.clone(), None).await;

        Ok(ReadResult {
            value,
            cache_hit: false,
            remaining: Some(decision.remaining),
            reset_at: Some(decision.reset_at),
        })
    }

    /// Telemetry streams keyed by type, restricted to `keys`.
    ///
    /// One cache entry holds every stream type requested so far for the
    /// activity; a request for a key not yet asked for refetches the union.
    pub async fn get_streams(
        &self,
        caller: &Caller,
        activity_id: u64,
        keys: &[String],
    ) -> Result<ReadResult, AppError> {
        let key = CacheKey::new(CacheNamespace::Streams, caller.athlete_id, activity_id);
        let cached = self
            .cache
            .get(&key)
            .await
            .and_then(|hit| serde_json::from_value::<CachedStreams>(hit.value).ok());

        if let Some(entry) = &cached {
            if entry.covers(keys) {
                tracing::debug!(athlete_id = caller.athlete_id, activity_id, "Streams cache hit");
                return Ok(ReadResult::hit(select(&entry.streams, keys)));
            }
        }

        let decision = self
            .limiter
            .check_combined(
                &caller.user_id,
                caller.athlete_id,
                &caller.tier,
                ROUTE_STREAMS,
                STRAVA_PROVIDER,
                StoreErrorPolicy::FailOpen,
            )
            .await?
            .into_result()?;

        let mut wanted: Vec<String> = keys.to_vec();
        if let Some(entry) = &cached {
            for k in &entry.requested {
                if !wanted.contains(k) {
                    wanted.push(k.clone());
                }
            }
        }
        let requested: BTreeSet<String> = wanted.iter().cloned().collect();

        let strava = &self.strava;
        let wanted_ref = &wanted;
        let fetched = match self
            .tokens
            .call_with_token(caller.athlete_id, |token| async move {
                strava.get_streams(&token, activity_id, wanted_ref).await
            })
            .await
        {
            Ok(fetched) => fetched,
            Err(e) => return Err(self.revoked(e, ROUTE_STREAMS).await),
        };

        let streams = match fetched {
            Value::Object(map) => map,
            other => {
                return Err(AppError::ProviderUnavailable(format!(
                    "unexpected streams payload: {}",
                    other
                )))
            }
        };

        let entry = CachedStreams { requested, streams };
        match serde_json::to_value(&entry) {
            Ok(value) => self.cache.set(&key, value, None).await,
            Err(e) => tracing::warn!(activity_id, error = %e, "Failed to encode streams for cache"),
        }

        Ok(ReadResult {
            value: select(&entry.streams, keys),
            cache_hit: false,
            remaining: Some(decision.remaining),
            reset_at: Some(decision.reset_at),
        })
    }
}

fn select(map: &Map<String, Value>, keys: &[String]) -> Value {
    Value::Object(
        keys.iter()
            .filter_map(|k| map.get(k).map(|v| (k.clone(), v.clone())))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn select_keeps_only_requested_present_keys() {
        let map = json!({"watts": [1], "heartrate": [2], "time": [3]});
        let Value::Object(map) = map else { unreachable!() };
        let picked = select(&map, &["watts".to_string(), "cadence".to_string()]);
        assert_eq!(picked, json!({"watts": [1]}));
    }

    #[test]
    fn requested_but_absent_streams_count_as_cached() {
        let entry = CachedStreams {
            requested: BTreeSet::from(["watts".to_string(), "heartrate".to_string()]),
            streams: match json!({"watts": {"data": [1]}}) {
                Value::Object(map) => map,
                _ => unreachable!(),
            },
        };
        assert!(entry.covers(&["heartrate".to_string()]));
        assert!(entry.covers(&["watts".to_string(), "heartrate".to_string()]));
        assert!(!entry.covers(&["cadence".to_string()]));
    }
}
