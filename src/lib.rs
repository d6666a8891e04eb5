// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Velo-Sync: rate-limited Strava ingestion and read API.
//!
//! This crate receives Strava webhook events, queues them onto durable
//! lanes in a shared key-value store, and drains those lanes under
//! per-athlete and aggregate provider budgets. Mobile clients read cached
//! activity data through tier-limited endpoints.

pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod store;
pub mod time_utils;

use config::Config;
use db::Persistence;
use error::AppError;
use services::{
    ActivityReader, AuditLog, CacheLayer, Drainer, RateLimiter, StravaClient, TokenManager,
    WebhookIngester, WorkQueue,
};
use std::sync::Arc;
use store::KvStore;
use time_utils::SharedClock;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub clock: SharedClock,
    pub store: Arc<dyn KvStore>,
    pub db: Arc<dyn Persistence>,
    pub limiter: RateLimiter,
    pub tokens: TokenManager,
    pub cache: CacheLayer,
    pub queue: WorkQueue,
    pub audit: AuditLog,
    pub strava: StravaClient,
    pub ingester: WebhookIngester,
    pub drainer: Drainer,
    pub reader: ActivityReader,
}

impl AppState {
    /// Wire every component from explicitly supplied collaborators.
    pub fn build(
        config: Config,
        store: Arc<dyn KvStore>,
        db: Arc<dyn Persistence>,
        clock: SharedClock,
    ) -> Result<Self, AppError> {
        let prefix = config.key_prefix.clone();

        let strava = StravaClient::new(
            config.strava_client_id.clone(),
            config.strava_client_secret.clone(),
            config.strava_api_url.clone(),
            config.strava_token_url.clone(),
        )?;
        let limiter = RateLimiter::new(
            store.clone(),
            config.tier_limits.clone(),
            config.provider_limits.clone(),
            clock.clone(),
            prefix.clone(),
        );
        let tokens = TokenManager::new(Arc::new(strava.clone()), db.clone(), clock.clone());
        let cache = CacheLayer::new(store.clone(), clock.clone(), config.cache_ttls, prefix.clone());
        let queue = WorkQueue::new(store.clone(), clock.clone(), prefix);
        let audit = AuditLog::new(db.clone(), clock.clone(), config.audit_retention_days);

        let ingester = WebhookIngester::new(
            queue.clone(),
            db.clone(),
            tokens.clone(),
            audit.clone(),
            config.webhook_verify_token.clone(),
            config.strava_subscription_id,
        );
        let drainer = Drainer::new(
            queue.clone(),
            limiter.clone(),
            tokens.clone(),
            strava.clone(),
            db.clone(),
            cache.clone(),
            audit.clone(),
            clock.clone(),
            config.drain,
        );
        let reader = ActivityReader::new(
            limiter.clone(),
            tokens.clone(),
            strava.clone(),
            cache.clone(),
            db.clone(),
            audit.clone(),
            clock.clone(),
        );

        Ok(Self {
            config,
            clock,
            store,
            db,
            limiter,
            tokens,
            cache,
            queue,
            audit,
            strava,
            ingester,
            drainer,
            reader,
        })
    }
}
