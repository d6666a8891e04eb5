// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Read-through cache for provider data.
//!
//! The blob tier is the shared store (`SETEX`/`GET`/`DEL`). A process-local
//! map is consulted only when the blob tier errors. Population failures are
//! logged and never surface to the caller.
//!
//! Raw telemetry may not be kept longer than the provider's retention
//! limit, so `streams` TTLs are clamped. Summaries and generated text are
//! derived data and exempt.

use crate::config::{CacheTtls, MAX_TELEMETRY_RETENTION_SECS};
use crate::store::KvStore;
use crate::time_utils::SharedClock;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Upper bound on fallback entries held in process.
const FALLBACK_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheNamespace {
    /// Raw telemetry streams
    Streams,
    /// Activity summaries
    Activity,
    /// Generated text
    AiText,
}

impl CacheNamespace {
    pub const fn as_str(self) -> &'static str {
        match self {
            CacheNamespace::Streams => "streams",
            CacheNamespace::Activity => "activity",
            CacheNamespace::AiText => "ai",
        }
    }

    /// Whether entries count as raw telemetry for retention purposes.
    pub const fn is_raw_telemetry(self) -> bool {
        matches!(self, CacheNamespace::Streams)
    }
}

/// Cache key. Always scoped to one athlete's activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub namespace: CacheNamespace,
    pub athlete_id: u64,
    pub activity_id: u64,
}

impl CacheKey {
    pub fn new(namespace: CacheNamespace, athlete_id: u64, activity_id: u64) -> Self {
        Self {
            namespace,
            athlete_id,
            activity_id,
        }
    }

    /// Every namespace entry held for one activity.
    pub fn all_for(athlete_id: u64, activity_id: u64) -> [CacheKey; 3] {
        [
            Self::new(CacheNamespace::Streams, athlete_id, activity_id),
            Self::new(CacheNamespace::Activity, athlete_id, activity_id),
            Self::new(CacheNamespace::AiText, athlete_id, activity_id),
        ]
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.namespace.as_str(),
            self.athlete_id,
            self.activity_id
        )
    }
}

/// Stored value plus freshness metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedValue {
    pub value: serde_json::Value,
    /// Epoch milliseconds
    pub cached_at: i64,
    pub ttl_seconds: u64,
}

impl CachedValue {
    fn expires_at_ms(&self) -> i64 {
        self.cached_at + (self.ttl_seconds as i64) * 1000
    }
}

#[derive(Clone)]
pub struct CacheLayer {
    blob: Arc<dyn KvStore>,
    fallback: Arc<DashMap<String, CachedValue>>,
    clock: SharedClock,
    ttls: CacheTtls,
    prefix: String,
}

impl CacheLayer {
    pub fn new(
        blob: Arc<dyn KvStore>,
        clock: SharedClock,
        ttls: CacheTtls,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            blob,
            fallback: Arc::new(DashMap::new()),
            clock,
            ttls,
            prefix: prefix.into(),
        }
    }

    fn blob_key(&self, key: &CacheKey) -> String {
        format!("{}:cache:{}", self.prefix, key)
    }

    /// Configured TTL for a namespace.
    pub fn ttl_for(&self, namespace: CacheNamespace) -> u64 {
        let ttl = match namespace {
            CacheNamespace::Streams => self.ttls.streams,
            CacheNamespace::Activity => self.ttls.activities,
            CacheNamespace::AiText => self.ttls.ai_text,
        };
        clamp_ttl(namespace, ttl)
    }

    /// Edge `max-age` in seconds.
    pub fn edge_ttl(&self) -> u64 {
        self.ttls.edge
    }

    pub async fn get(&self, key: &CacheKey) -> Option<CachedValue> {
        match self.blob.get(&self.blob_key(key)).await {
            Ok(Some(raw)) => match serde_json::from_str::<CachedValue>(&raw) {
                Ok(cached) => Some(cached),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Discarding unreadable cache entry");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Blob cache read failed, using fallback");
                self.fallback_get(key)
            }
        }
    }

    /// Store a value. `ttl` defaults to the namespace TTL and is clamped to
    /// the telemetry retention limit for raw streams.
    pub async fn set(&self, key: &CacheKey, value: serde_json::Value, ttl: Option<u64>) {
        let ttl_seconds = clamp_ttl(
            key.namespace,
            ttl.unwrap_or_else(|| self.ttl_for(key.namespace)),
        );
        if ttl_seconds == 0 {
            return;
        }

        let cached = CachedValue {
            value,
            cached_at: self.clock.now_ms(),
            ttl_seconds,
        };
        let encoded = match serde_json::to_string(&cached) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to encode cache entry");
                return;
            }
        };

        match self.blob.set_ex(&self.blob_key(key), ttl_seconds, &encoded).await {
            Ok(()) => {
                self.fallback.remove(&key.to_string());
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Blob cache write failed, holding locally");
                self.fallback_put(key, cached);
            }
        }
    }

    pub async fn purge(&self, key: &CacheKey) {
        self.fallback.remove(&key.to_string());
        if let Err(e) = self.blob.del(&self.blob_key(key)).await {
            tracing::warn!(key = %key, error = %e, "Blob cache purge failed");
        }
    }

    /// Drop every namespace entry for an activity.
    pub async fn purge_activity(&self, athlete_id: u64, activity_id: u64) {
        for key in CacheKey::all_for(athlete_id, activity_id) {
            self.purge(&key).await;
        }
    }

    fn fallback_get(&self, key: &CacheKey) -> Option<CachedValue> {
        let now = self.clock.now_ms();
        let name = key.to_string();
        let hit = self
            .fallback
            .get(&name)
            .filter(|c| c.expires_at_ms() > now)
            .map(|c| c.clone());
        if hit.is_none() {
            self.fallback.remove_if(&name, |_, c| c.expires_at_ms() <= now);
        }
        hit
    }

    fn fallback_put(&self, key: &CacheKey, cached: CachedValue) {
        if self.fallback.len() >= FALLBACK_CAPACITY {
            let now = self.clock.now_ms();
            self.fallback.retain(|_, c| c.expires_at_ms() > now);
            if self.fallback.len() >= FALLBACK_CAPACITY {
                tracing::debug!(key = %key, "Fallback cache full, skipping");
                return;
            }
        }
        self.fallback.insert(key.to_string(), cached);
    }
}

/// Apply the raw-telemetry retention cap.
pub fn clamp_ttl(namespace: CacheNamespace, ttl: u64) -> u64 {
    if namespace.is_raw_telemetry() {
        ttl.min(MAX_TELEMETRY_RETENTION_SECS)
    } else {
        ttl
    }
}
