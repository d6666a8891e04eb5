// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Application configuration loaded from environment variables.
//!
//! Secrets are injected as environment variables by the deployment and read
//! once at startup. Budgets and TTLs have defaults matching the provider's
//! published quotas and retention rules.

use crate::services::rate_limit::{ProviderLimits, TierLimits, WindowKind};
use std::collections::BTreeMap;
use std::env;

/// Provider key used for the primary activity API.
pub const STRAVA_PROVIDER: &str = "strava";

/// Raw telemetry may not be retained longer than this (7 days).
pub const MAX_TELEMETRY_RETENTION_SECS: u64 = 7 * 24 * 60 * 60;

/// Cache lifetimes per namespace, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtls {
    pub streams: u64,
    pub activities: u64,
    pub ai_text: u64,
    /// `max-age` / `s-maxage` sent to the edge.
    pub edge: u64,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            streams: 6 * 24 * 60 * 60,
            activities: 24 * 60 * 60,
            ai_text: 24 * 60 * 60,
            edge: 60,
        }
    }
}

/// Queue drain sizing and pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainSettings {
    /// Jobs popped from the live lane per invocation.
    pub live_batch: usize,
    /// Jobs popped from the backfill lane per invocation.
    pub backfill_batch: usize,
    /// Jobs popped from the batch lane per scheduled run.
    pub batch_max: usize,
    /// Fixed sleep between batch-lane jobs, in milliseconds.
    pub batch_delay_ms: u64,
    pub drain_interval_secs: u64,
    pub batch_interval_secs: u64,
    /// Attempts before a job is moved to the dead-letter lane.
    pub max_job_attempts: u32,
    /// Delay before the first retry of a failed job; doubles per attempt.
    pub retry_backoff_secs: u64,
}

impl Default for DrainSettings {
    fn default() -> Self {
        Self {
            live_batch: 10,
            backfill_batch: 3,
            batch_max: 200,
            batch_delay_ms: 10_000,
            drain_interval_secs: 60,
            batch_interval_secs: 6 * 60 * 60,
            max_job_attempts: 3,
            retry_backoff_secs: 60,
        }
    }
}

impl DrainSettings {
    /// Milliseconds to wait after a job's `failures`-th failed attempt.
    pub fn retry_delay_ms(&self, failures: u32) -> i64 {
        let factor = 1u64 << failures.saturating_sub(1).min(16);
        let secs = self.retry_backoff_secs.saturating_mul(factor);
        i64::try_from(secs.saturating_mul(1000)).unwrap_or(i64::MAX)
    }
}

/// Application configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    // --- Environment Variables (non-sensitive) ---
    /// Strava OAuth client ID (public)
    pub strava_client_id: String,
    /// Strava REST base URL
    pub strava_api_url: String,
    /// Strava OAuth token endpoint
    pub strava_token_url: String,
    /// Expected webhook subscription ID (events from others are ignored)
    pub strava_subscription_id: Option<u64>,
    /// Frontend URL for CORS
    pub frontend_url: String,
    /// Firestore project for persistence (in-memory when unset)
    pub firestore_project_id: Option<String>,
    /// Server port
    pub port: u16,
    /// Prefix for every key written to the shared store
    pub key_prefix: String,
    pub tier_limits: TierLimits,
    pub provider_limits: ProviderLimits,
    pub cache_ttls: CacheTtls,
    pub drain: DrainSettings,
    pub audit_retention_days: i64,
    /// Whether to run drain/prune loops inside this process
    pub scheduler_enabled: bool,

    // --- Secrets ---
    /// Strava OAuth client secret
    pub strava_client_secret: String,
    /// JWT signing key for session tokens (raw bytes)
    pub jwt_signing_key: Vec<u8>,
    /// Webhook verification token
    pub webhook_verify_token: String,
    /// Shared secret for `/tasks/*` callers (scheduler, operators)
    pub task_secret: String,
    /// REST key-value store URL (in-memory store when unset)
    pub kv_rest_url: Option<String>,
    pub kv_rest_token: Option<String>,
}

impl Config {
    /// Config for tests only.
    pub fn test_default() -> Self {
        Self {
            strava_client_id: "test_client_id".to_string(),
            strava_api_url: "http://127.0.0.1:9/api/v3".to_string(),
            strava_token_url: "http://127.0.0.1:9/oauth/token".to_string(),
            strava_subscription_id: None,
            frontend_url: "http://localhost:5173".to_string(),
            firestore_project_id: None,
            port: 8080,
            key_prefix: "test".to_string(),
            tier_limits: TierLimits::default(),
            provider_limits: ProviderLimits::default(),
            cache_ttls: CacheTtls::default(),
            drain: DrainSettings {
                batch_delay_ms: 0,
                ..DrainSettings::default()
            },
            audit_retention_days: 30,
            scheduler_enabled: false,
            strava_client_secret: "test_secret".to_string(),
            jwt_signing_key: b"test_jwt_key_32_bytes_minimum!!".to_vec(),
            webhook_verify_token: "test_verify_token".to_string(),
            task_secret: "test_task_secret".to_string(),
            kv_rest_url: None,
            kv_rest_token: None,
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let defaults = DrainSettings::default();
        let drain = DrainSettings {
            live_batch: parse_or("DRAIN_LIVE_BATCH", defaults.live_batch)?,
            backfill_batch: parse_or("DRAIN_BACKFILL_BATCH", defaults.backfill_batch)?,
            batch_max: parse_or("DRAIN_BATCH_MAX", defaults.batch_max)?,
            batch_delay_ms: parse_or("DRAIN_BATCH_DELAY_MS", defaults.batch_delay_ms)?,
            drain_interval_secs: parse_or("DRAIN_INTERVAL_SECS", defaults.drain_interval_secs)?,
            batch_interval_secs: parse_or("BATCH_INTERVAL_SECS", defaults.batch_interval_secs)?,
            max_job_attempts: parse_or("MAX_JOB_ATTEMPTS", defaults.max_job_attempts)?,
            retry_backoff_secs: parse_or("RETRY_BACKOFF_SECS", defaults.retry_backoff_secs)?,
        };

        let ttl_defaults = CacheTtls::default();
        let cache_ttls = CacheTtls {
            streams: parse_or("CACHE_TTL_STREAMS", ttl_defaults.streams)?,
            activities: parse_or("CACHE_TTL_ACTIVITIES", ttl_defaults.activities)?,
            ai_text: parse_or("CACHE_TTL_AI_TEXT", ttl_defaults.ai_text)?,
            edge: parse_or("EDGE_CACHE_SECS", ttl_defaults.edge)?,
        };
        if cache_ttls.streams > MAX_TELEMETRY_RETENTION_SECS {
            return Err(ConfigError::Invalid {
                name: "CACHE_TTL_STREAMS",
                reason: format!(
                    "raw telemetry may not be cached longer than {} seconds",
                    MAX_TELEMETRY_RETENTION_SECS
                ),
            });
        }

        let tier_limits = match env::var("TIER_LIMITS") {
            Ok(raw) => parse_tier_limits(&raw)?,
            Err(_) => TierLimits::default(),
        };
        let provider_limits = match env::var("PROVIDER_LIMITS") {
            Ok(raw) => parse_provider_limits(&raw)?,
            Err(_) => ProviderLimits::default(),
        };

        Ok(Self {
            strava_client_id: required("STRAVA_CLIENT_ID")?,
            strava_api_url: env::var("STRAVA_API_URL")
                .unwrap_or_else(|_| "https://www.strava.com/api/v3".to_string()),
            strava_token_url: env::var("STRAVA_TOKEN_URL")
                .unwrap_or_else(|_| "https://www.strava.com/oauth/token".to_string()),
            strava_subscription_id: optional_parse("STRAVA_SUBSCRIPTION_ID")?,
            frontend_url: env::var("FRONTEND_URL")
                .unwrap_or_else(|_| "http://localhost:5173".to_string()),
            firestore_project_id: env::var("FIRESTORE_PROJECT_ID").ok(),
            port: parse_or("PORT", 8080)?,
            key_prefix: env::var("KV_KEY_PREFIX").unwrap_or_else(|_| "velo".to_string()),
            tier_limits,
            provider_limits,
            cache_ttls,
            drain,
            audit_retention_days: parse_or("AUDIT_RETENTION_DAYS", 30)?,
            scheduler_enabled: parse_or("SCHEDULER_ENABLED", true)?,

            strava_client_secret: required("STRAVA_CLIENT_SECRET")?,
            jwt_signing_key: required("JWT_SIGNING_KEY")?.into_bytes(),
            webhook_verify_token: required("WEBHOOK_VERIFY_TOKEN")?,
            task_secret: required("TASK_SECRET")?,
            kv_rest_url: env::var("KV_REST_URL").ok(),
            kv_rest_token: env::var("KV_REST_TOKEN").ok().map(|v| v.trim().to_string()),
        })
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name)
        .map(|v| v.trim().to_string())
        .map_err(|_| ConfigError::Missing(name))
}

fn parse_or<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            name,
            reason: format!("cannot parse {:?}", raw),
        }),
        Err(_) => Ok(default),
    }
}

fn optional_parse<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                name,
                reason: format!("cannot parse {:?}", raw),
            }),
        Err(_) => Ok(None),
    }
}

/// Parse `free=100,trial=500,pro=2000` (requests per hour).
pub fn parse_tier_limits(raw: &str) -> Result<TierLimits, ConfigError> {
    let mut limits = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (tier, limit) = pair.split_once('=').ok_or_else(|| ConfigError::Invalid {
            name: "TIER_LIMITS",
            reason: format!("expected tier=limit, got {:?}", pair),
        })?;
        let limit = limit.trim().parse().map_err(|_| ConfigError::Invalid {
            name: "TIER_LIMITS",
            reason: format!("bad limit for tier {:?}", tier),
        })?;
        limits.insert(tier.trim().to_lowercase(), limit);
    }
    if limits.is_empty() {
        return Err(ConfigError::Invalid {
            name: "TIER_LIMITS",
            reason: "no tiers configured".to_string(),
        });
    }
    Ok(TierLimits::new(limits))
}

/// Parse `strava:15min=100,day=1000;intervals:hour=300`.
pub fn parse_provider_limits(raw: &str) -> Result<ProviderLimits, ConfigError> {
    let invalid = |reason: String| ConfigError::Invalid {
        name: "PROVIDER_LIMITS",
        reason,
    };

    let mut providers = BTreeMap::new();
    for section in raw.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        let (provider, windows) = section
            .split_once(':')
            .ok_or_else(|| invalid(format!("expected provider:windows, got {:?}", section)))?;

        let mut budget = BTreeMap::new();
        for pair in windows.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (window, limit) = pair
                .split_once('=')
                .ok_or_else(|| invalid(format!("expected window=limit, got {:?}", pair)))?;
            let window: WindowKind = window
                .trim()
                .parse()
                .map_err(|_| invalid(format!("unknown window {:?}", window)))?;
            let limit: u64 = limit
                .trim()
                .parse()
                .map_err(|_| invalid(format!("bad limit {:?}", limit)))?;
            budget.insert(window, limit);
        }
        if budget.is_empty() {
            return Err(invalid(format!("provider {:?} has no windows", provider)));
        }
        providers.insert(provider.trim().to_lowercase(), budget);
    }
    Ok(ProviderLimits::new(providers))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}
