// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Provider access-token lifecycle.
//!
//! Tokens are refreshed when they expire within five minutes. A refreshed
//! credential is persisted before it is returned, so a crash between the two
//! never loses a rotated refresh token.

use crate::db::Persistence;
use crate::error::AppError;
use crate::models::AthleteCredential;
use crate::services::strava::{StravaError, TokenRefreshResponse};
use crate::time_utils::SharedClock;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Margin before token expiration when we proactively refresh (5 minutes).
pub const TOKEN_REFRESH_MARGIN_SECS: i64 = 5 * 60;

/// Exchanges a refresh token for a new credential pair.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenRefreshResponse, StravaError>;
}

/// Cached access token with expiry information.
#[derive(Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

/// Owns athlete credentials: cache, refresh, persist.
#[derive(Clone)]
pub struct TokenManager {
    refresher: Arc<dyn TokenRefresher>,
    db: Arc<dyn Persistence>,
    clock: SharedClock,
    /// Access tokens known to be valid, shared across requests.
    cache: Arc<DashMap<u64, CachedToken>>,
    /// Per-athlete mutex to serialize refresh calls.
    refresh_locks: Arc<DashMap<u64, Arc<Mutex<()>>>>,
}

impl TokenManager {
    pub fn new(
        refresher: Arc<dyn TokenRefresher>,
        db: Arc<dyn Persistence>,
        clock: SharedClock,
    ) -> Self {
        Self {
            refresher,
            db,
            clock,
            cache: Arc::new(DashMap::new()),
            refresh_locks: Arc::new(DashMap::new()),
        }
    }

    fn margin() -> Duration {
        Duration::seconds(TOKEN_REFRESH_MARGIN_SECS)
    }

    fn cached(&self, athlete_id: u64) -> Option<String> {
        let now = self.clock.now();
        self.cache
            .get(&athlete_id)
            .filter(|c| c.expires_at - now >= Self::margin())
            .map(|c| c.access_token.clone())
    }

    fn remember(&self, credential: &AthleteCredential) {
        self.cache.insert(
            credential.athlete_id,
            CachedToken {
                access_token: credential.access_token.clone(),
                expires_at: credential.expires_at,
            },
        );
    }

    fn lock_for(&self, athlete_id: u64) -> Arc<Mutex<()>> {
        self.refresh_locks
            .entry(athlete_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Get an access token valid for at least the refresh margin.
    ///
    /// Fails with `NotFound` when no credential is stored,
    /// `CredentialsInvalid` when the provider refuses the refresh token and
    /// `ProviderUnavailable` on transient refresh failures.
    pub async fn get_valid_access_token(&self, athlete_id: u64) -> Result<String, AppError> {
        if let Some(token) = self.cached(athlete_id) {
            return Ok(token);
        }

        let lock = self.lock_for(athlete_id);
        let _guard = lock.lock().await;

        // Another task may have refreshed while we were waiting.
        if let Some(token) = self.cached(athlete_id) {
            return Ok(token);
        }

        let credential = self.load(athlete_id).await?;
        if !credential.needs_refresh(self.clock.now(), Self::margin()) {
            self.remember(&credential);
            return Ok(credential.access_token);
        }

        tracing::info!(athlete_id, expires_at = %credential.expires_at, "Access token expiring, refreshing");
        self.refresh(credential).await
    }

    /// Replace an access token the provider rejected, refreshing even if it
    /// has not reached its expiry.
    pub async fn force_refresh(&self, athlete_id: u64, rejected: &str) -> Result<String, AppError> {
        self.cache.remove(&athlete_id);

        let lock = self.lock_for(athlete_id);
        let _guard = lock.lock().await;

        if let Some(token) = self.cached(athlete_id).filter(|t| t != rejected) {
            return Ok(token);
        }

        let credential = self.load(athlete_id).await?;
        if credential.access_token != rejected
            && !credential.needs_refresh(self.clock.now(), Self::margin())
        {
            self.remember(&credential);
            return Ok(credential.access_token);
        }

        tracing::info!(athlete_id, "Access token rejected by provider, refreshing");
        self.refresh(credential).await
    }

    /// Run a provider call with the athlete's token. A 401 evicts the token
    /// and the call is tried once more after a forced refresh.
    pub async fn call_with_token<T, F, Fut>(&self, athlete_id: u64, call: F) -> Result<T, AppError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, StravaError>>,
    {
        let token = self.get_valid_access_token(athlete_id).await?;
        match call(token.clone()).await {
            Err(StravaError::Unauthorized) => {
                tracing::warn!(athlete_id, "Provider rejected access token, retrying after refresh");
                let token = self.force_refresh(athlete_id, &token).await?;
                call(token).await.map_err(|e| e.for_athlete(athlete_id))
            }
            result => result.map_err(|e| e.for_athlete(athlete_id)),
        }
    }

    /// Exchange the stored refresh token and persist the new pair before
    /// returning it. Caller holds the athlete's refresh lock.
    async fn refresh(&self, credential: AthleteCredential) -> Result<String, AppError> {
        let athlete_id = credential.athlete_id;
        let refreshed = match self.refresher.refresh(&credential.refresh_token).await {
            Ok(refreshed) => refreshed,
            Err(StravaError::InvalidGrant(detail)) => {
                return self.recover_rotated(credential, &detail).await;
            }
            Err(e) => {
                tracing::warn!(athlete_id, error = %e, "Token refresh failed");
                return Err(e.for_athlete(athlete_id));
            }
        };

        let updated = AthleteCredential {
            athlete_id,
            access_token: refreshed.access_token,
            refresh_token: refreshed.refresh_token,
            expires_at: DateTime::from_timestamp(refreshed.expires_at, 0).unwrap_or(self.clock.now()),
            scopes: credential.scopes,
        };

        self.db.set_credentials(&updated).await?;
        self.remember(&updated);

        tracing::info!(athlete_id, "Token refreshed and persisted");
        Ok(updated.access_token)
    }

    /// The provider refused our refresh token. If another process rotated
    /// it in the meantime the stored credential is newer and still usable.
    async fn recover_rotated(
        &self,
        stale: AthleteCredential,
        detail: &str,
    ) -> Result<String, AppError> {
        let athlete_id = stale.athlete_id;
        let current = self.db.get_credentials(athlete_id).await?;

        if let Some(current) = current {
            if current.refresh_token != stale.refresh_token
                && !current.needs_refresh(self.clock.now(), Self::margin())
            {
                tracing::info!(athlete_id, "Refresh token already rotated elsewhere, using stored token");
                self.remember(&current);
                return Ok(current.access_token);
            }
        }

        tracing::warn!(athlete_id, detail, "Refresh token rejected, credentials invalid");
        self.forget(athlete_id);
        Err(AppError::CredentialsInvalid(athlete_id))
    }

    async fn load(&self, athlete_id: u64) -> Result<AthleteCredential, AppError> {
        self.db
            .get_credentials(athlete_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Credentials for athlete {}", athlete_id)))
    }

    /// Drop any cached token for an athlete.
    pub fn forget(&self, athlete_id: u64) {
        self.cache.remove(&athlete_id);
        self.refresh_locks.remove(&athlete_id);
    }
}
