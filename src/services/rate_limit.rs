// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Multi-window fixed-window rate limiter.
//!
//! Two independent budget classes share the counter store:
//! - **Tier budgets**: per athlete, per API route, one hourly window, limit
//!   taken from the subscription tier table.
//! - **Provider budgets**: per external provider and athlete, evaluated across
//!   every configured window (15 min / hour / day). A parallel aggregate
//!   counter per provider records every attempted call for monitoring.
//!
//! Counters are incremented first and compared second, so the request that
//! crosses the limit is itself counted. A window's TTL is set by the
//! increment that created it; if that `EXPIRE` fails the key is remembered
//! and the TTL retried on the next counter hit.

use crate::error::AppError;
use crate::store::{KvStore, StoreError};
use crate::time_utils::SharedClock;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Fixed window granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WindowKind {
    #[serde(rename = "15min")]
    FifteenMinutes,
    #[serde(rename = "hour")]
    Hour,
    #[serde(rename = "day")]
    Day,
}

impl WindowKind {
    pub const ALL: [WindowKind; 3] = [WindowKind::FifteenMinutes, WindowKind::Hour, WindowKind::Day];

    pub const fn duration_ms(self) -> i64 {
        match self {
            WindowKind::FifteenMinutes => 15 * 60 * 1000,
            WindowKind::Hour => 60 * 60 * 1000,
            WindowKind::Day => 24 * 60 * 60 * 1000,
        }
    }

    pub const fn duration_secs(self) -> u64 {
        (self.duration_ms() / 1000) as u64
    }

    pub const fn label(self) -> &'static str {
        match self {
            WindowKind::FifteenMinutes => "15min",
            WindowKind::Hour => "hour",
            WindowKind::Day => "day",
        }
    }
}

impl fmt::Display for WindowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for WindowKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "15min" | "15m" | "quarter" => Ok(WindowKind::FifteenMinutes),
            "hour" | "1h" | "hourly" => Ok(WindowKind::Hour),
            "day" | "1d" | "daily" => Ok(WindowKind::Day),
            other => Err(format!("unknown window kind: {}", other)),
        }
    }
}

/// One aligned window instance: `index = floor(now / duration)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedWindow {
    pub kind: WindowKind,
    pub index: i64,
    /// Epoch milliseconds at which the next window starts.
    pub reset_at_ms: i64,
}

impl FixedWindow {
    pub fn containing(kind: WindowKind, now_ms: i64) -> Self {
        let duration = kind.duration_ms();
        let index = now_ms.div_euclid(duration);
        Self {
            kind,
            index,
            reset_at_ms: (index + 1) * duration,
        }
    }
}

/// Requests per hour for each subscription tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierLimits(BTreeMap<String, u64>);

impl Default for TierLimits {
    fn default() -> Self {
        Self(BTreeMap::from([
            ("free".to_string(), 100),
            ("trial".to_string(), 500),
            ("pro".to_string(), 2000),
        ]))
    }
}

impl TierLimits {
    pub fn new(limits: BTreeMap<String, u64>) -> Self {
        Self(limits)
    }

    pub fn limit_for(&self, tier: &str) -> Option<u64> {
        self.0.get(&tier.to_ascii_lowercase()).copied()
    }

    /// Limit applied to an unknown tier: `free` if configured, else the smallest.
    fn fallback_limit(&self) -> u64 {
        self.0
            .get("free")
            .copied()
            .or_else(|| self.0.values().min().copied())
            .unwrap_or(0)
    }
}

/// Window budgets for each external provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderLimits(BTreeMap<String, BTreeMap<WindowKind, u64>>);

impl Default for ProviderLimits {
    fn default() -> Self {
        Self(BTreeMap::from([
            (
                crate::config::STRAVA_PROVIDER.to_string(),
                BTreeMap::from([(WindowKind::FifteenMinutes, 100), (WindowKind::Day, 1000)]),
            ),
            (
                "intervals".to_string(),
                BTreeMap::from([(WindowKind::Hour, 300)]),
            ),
        ]))
    }
}

impl ProviderLimits {
    pub fn new(limits: BTreeMap<String, BTreeMap<WindowKind, u64>>) -> Self {
        Self(limits)
    }

    pub fn windows_for(&self, provider: &str) -> Option<&BTreeMap<WindowKind, u64>> {
        self.0.get(&provider.to_ascii_lowercase())
    }
}

/// What to do when the counter store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorPolicy {
    /// Allow the request and log a warning. Default for read paths.
    FailOpen,
    /// Surface `AppError::StoreUnavailable`. Used ahead of destructive work.
    FailClosed,
}

/// Outcome of a tier budget check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Epoch milliseconds.
    pub reset_at: i64,
}

/// Outcome of a provider budget check across all configured windows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderDecision {
    pub allowed: bool,
    pub remaining: BTreeMap<WindowKind, u64>,
    pub reset_at: BTreeMap<WindowKind, i64>,
    /// Windows whose budget this call exceeded.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub violated: Vec<WindowKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ProviderDecision {
    fn unlimited() -> Self {
        Self {
            allowed: true,
            remaining: BTreeMap::new(),
            reset_at: BTreeMap::new(),
            violated: Vec::new(),
            reason: None,
        }
    }

    /// The most restrictive `(remaining, reset_at)` pair: fewest calls left,
    /// and on a tie the later reset.
    pub fn tightest(&self) -> Option<(u64, i64)> {
        self.remaining
            .iter()
            .filter_map(|(kind, remaining)| {
                self.reset_at.get(kind).map(|reset| (*remaining, *reset))
            })
            .min_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)))
    }

    /// When every violated window has reopened.
    pub fn retry_at(&self) -> i64 {
        self.violated
            .iter()
            .filter_map(|kind| self.reset_at.get(kind).copied())
            .max()
            .unwrap_or_default()
    }
}

/// Outcome of a tier check followed by a provider check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CombinedDecision {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CombinedDecision {
    /// Convert a denial into `AppError::QuotaExceeded`.
    pub fn into_result(self) -> Result<Self, AppError> {
        if self.allowed {
            Ok(self)
        } else {
            Err(AppError::QuotaExceeded {
                reason: self
                    .reason
                    .clone()
                    .unwrap_or_else(|| "quota_exceeded".to_string()),
                reset_at: self.reset_at,
            })
        }
    }
}

/// `(allowed, remaining)` for a post-increment count.
pub fn evaluate(count: i64, limit: u64) -> (bool, u64) {
    let count = count.max(0) as u64;
    (count <= limit, limit.saturating_sub(count))
}

/// Rate limiter backed by the shared counter store.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn KvStore>,
    tiers: TierLimits,
    providers: ProviderLimits,
    clock: SharedClock,
    prefix: String,
    /// Counter keys whose TTL could not be set, with the TTL to apply.
    pending_ttls: Arc<DashMap<String, u64>>,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn KvStore>,
        tiers: TierLimits,
        providers: ProviderLimits,
        clock: SharedClock,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            tiers,
            providers,
            clock,
            prefix: prefix.into(),
            pending_ttls: Arc::new(DashMap::new()),
        }
    }

    /// Counter keys still waiting for a TTL.
    pub fn pending_ttls(&self) -> usize {
        self.pending_ttls.len()
    }

    pub fn tier_key(&self, tier: &str, athlete_id: u64, route: &str, window: &FixedWindow) -> String {
        format!(
            "{}:rl:tier:{}:{}:{}:{}:{}",
            self.prefix,
            tier.to_ascii_lowercase(),
            athlete_id,
            route,
            window.kind,
            window.index
        )
    }

    pub fn provider_key(&self, provider: &str, athlete_id: u64, window: &FixedWindow) -> String {
        format!(
            "{}:rl:provider:{}:{}:{}:{}",
            self.prefix, provider, athlete_id, window.kind, window.index
        )
    }

    pub fn aggregate_key(&self, provider: &str, window: &FixedWindow) -> String {
        format!(
            "{}:rl:provider:{}:all:{}:{}",
            self.prefix, provider, window.kind, window.index
        )
    }

    /// Increment a window counter, setting its TTL if this call created it.
    async fn hit(&self, key: &str, window: &FixedWindow) -> Result<i64, StoreError> {
        let count = self.store.incr_by(key, 1).await?;
        self.retry_pending_ttls().await;
        if count == 1 {
            // Two first-requests may both land here; EXPIRE is idempotent.
            let ttl = window.kind.duration_secs();
            if let Err(e) = self.store.expire(key, ttl).await {
                tracing::warn!(key, error = %e, "Failed to set window TTL, will retry");
                self.pending_ttls.insert(key.to_string(), ttl);
            }
        }
        Ok(count)
    }

    async fn retry_pending_ttls(&self) {
        if self.pending_ttls.is_empty() {
            return;
        }
        let pending: Vec<(String, u64)> = self
            .pending_ttls
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        for (key, ttl) in pending {
            match self.store.expire(&key, ttl).await {
                Ok(_) => {
                    self.pending_ttls.remove(&key);
                    tracing::info!(key = %key, "Window TTL set on retry");
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Window TTL retry failed");
                    return;
                }
            }
        }
    }

    /// Check and consume one request from an athlete's tier budget for a route.
    pub async fn check_tier(
        &self,
        user_id: &str,
        subject_id: u64,
        tier: &str,
        route: &str,
        policy: StoreErrorPolicy,
    ) -> Result<TierDecision, AppError> {
        let limit = self.tiers.limit_for(tier).unwrap_or_else(|| {
            tracing::warn!(tier, "Unknown subscription tier, applying fallback limit");
            self.tiers.fallback_limit()
        });
        let window = FixedWindow::containing(WindowKind::Hour, self.clock.now_ms());
        let key = self.tier_key(tier, subject_id, route, &window);

        let count = match self.hit(&key, &window).await {
            Ok(count) => count,
            Err(e) => {
                return match policy {
                    StoreErrorPolicy::FailOpen => {
                        tracing::warn!(
                            user_id,
                            athlete_id = subject_id,
                            route,
                            error = %e,
                            "Counter store unavailable, tier check failing open"
                        );
                        Ok(TierDecision {
                            allowed: true,
                            limit,
                            remaining: limit,
                            reset_at: window.reset_at_ms,
                        })
                    }
                    StoreErrorPolicy::FailClosed => Err(e.into()),
                };
            }
        };

        let (allowed, remaining) = evaluate(count, limit);
        if !allowed {
            tracing::info!(
                user_id,
                athlete_id = subject_id,
                tier,
                route,
                count,
                limit,
                "Tier budget exhausted"
            );
        }

        Ok(TierDecision {
            allowed,
            limit,
            remaining,
            reset_at: window.reset_at_ms,
        })
    }

    /// Check and consume one call from the athlete's provider budget in
    /// every configured window.
    pub async fn check_provider(
        &self,
        provider: &str,
        athlete_id: u64,
        policy: StoreErrorPolicy,
    ) -> Result<ProviderDecision, AppError> {
        let provider = provider.to_ascii_lowercase();
        let windows = match self.providers.windows_for(&provider) {
            Some(windows) => windows,
            None => {
                tracing::debug!(provider = %provider, "No budget configured for provider");
                return Ok(ProviderDecision::unlimited());
            }
        };

        let now_ms = self.clock.now_ms();
        let mut decision = ProviderDecision::unlimited();

        for (&kind, &limit) in windows {
            let window = FixedWindow::containing(kind, now_ms);

            // Attempted calls are counted in aggregate whether or not the
            // athlete's own budget allows them.
            let aggregate_key = self.aggregate_key(&provider, &window);
            if let Err(e) = self.hit(&aggregate_key, &window).await {
                tracing::warn!(provider = %provider, window = %kind, error = %e, "Failed to count aggregate provider call");
            }

            let key = self.provider_key(&provider, athlete_id, &window);
            let count = match self.hit(&key, &window).await {
                Ok(count) => count,
                Err(e) => match policy {
                    StoreErrorPolicy::FailOpen => {
                        tracing::warn!(
                            provider = %provider,
                            athlete_id,
                            window = %kind,
                            error = %e,
                            "Counter store unavailable, provider check failing open"
                        );
                        0
                    }
                    StoreErrorPolicy::FailClosed => return Err(e.into()),
                },
            };

            let (allowed, remaining) = evaluate(count, limit);
            if !allowed {
                decision.violated.push(kind);
            }
            decision.remaining.insert(kind, remaining);
            decision.reset_at.insert(kind, window.reset_at_ms);
        }

        if !decision.violated.is_empty() {
            let labels: Vec<&str> = decision.violated.iter().map(|k| k.label()).collect();
            decision.allowed = false;
            decision.reason = Some(format!(
                "provider_quota_exceeded:{}:{}",
                provider,
                labels.join(",")
            ));
            tracing::info!(
                provider = %provider,
                athlete_id,
                windows = %labels.join(","),
                "Provider budget exhausted"
            );
        }

        Ok(decision)
    }

    /// Tier check, then provider check. A tier denial short-circuits so the
    /// provider budget is not consumed.
    pub async fn check_combined(
        &self,
        user_id: &str,
        athlete_id: u64,
        tier: &str,
        route: &str,
        provider: &str,
        policy: StoreErrorPolicy,
    ) -> Result<CombinedDecision, AppError> {
        let tier_decision = self
            .check_tier(user_id, athlete_id, tier, route, policy)
            .await?;
        if !tier_decision.allowed {
            return Ok(CombinedDecision {
                allowed: false,
                remaining: 0,
                reset_at: tier_decision.reset_at,
                reason: Some(format!(
                    "tier_quota_exceeded:{}:{}",
                    tier.to_ascii_lowercase(),
                    WindowKind::Hour
                )),
            });
        }

        let provider_decision = self.check_provider(provider, athlete_id, policy).await?;

        let (mut remaining, mut reset_at) = (tier_decision.remaining, tier_decision.reset_at);
        if let Some((p_remaining, p_reset)) = provider_decision.tightest() {
            if p_remaining < remaining || (p_remaining == remaining && p_reset > reset_at) {
                remaining = p_remaining;
                reset_at = p_reset;
            }
        }

        if !provider_decision.allowed {
            reset_at = provider_decision.retry_at();
            remaining = 0;
        }

        Ok(CombinedDecision {
            allowed: provider_decision.allowed,
            remaining,
            reset_at,
            reason: provider_decision.reason,
        })
    }

    /// Gate a provider call, converting a denial into `QuotaExceeded`.
    pub async fn require_provider(
        &self,
        provider: &str,
        athlete_id: u64,
        policy: StoreErrorPolicy,
    ) -> Result<ProviderDecision, AppError> {
        let decision = self.check_provider(provider, athlete_id, policy).await?;
        if decision.allowed {
            return Ok(decision);
        }
        Err(AppError::QuotaExceeded {
            reason: decision
                .reason
                .clone()
                .unwrap_or_else(|| "provider_quota_exceeded".to_string()),
            reset_at: decision.retry_at(),
        })
    }

    /// Current aggregate call counts for a provider, per configured window.
    pub async fn aggregate_usage(&self, provider: &str) -> Result<BTreeMap<WindowKind, u64>, AppError> {
        let provider = provider.to_ascii_lowercase();
        let mut usage = BTreeMap::new();
        let Some(windows) = self.providers.windows_for(&provider) else {
            return Ok(usage);
        };

        let now_ms = self.clock.now_ms();
        for &kind in windows.keys() {
            let window = FixedWindow::containing(kind, now_ms);
            let count = self
                .store
                .get(&self.aggregate_key(&provider, &window))
                .await?
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0);
            usage.insert(kind, count);
        }
        Ok(usage)
    }
}
