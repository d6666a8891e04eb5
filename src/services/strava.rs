// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Strava API client for fetching activities and telemetry streams.
//!
//! Handles:
//! - Activity detail and paginated activity lists
//! - Telemetry streams keyed by type
//! - OAuth token refresh
//! - Status classification (rate limit, revoked grant, missing object)

use crate::error::AppError;
use crate::models::ActivitySummary;
use crate::services::tokens::TokenRefresher;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Stream types the API accepts in `keys`.
pub const STREAM_KEYS: [&str; 11] = [
    "time",
    "distance",
    "latlng",
    "altitude",
    "velocity_smooth",
    "heartrate",
    "cadence",
    "watts",
    "temp",
    "moving",
    "grade_smooth",
];

/// Classified Strava failure. Converted into [`AppError`] once the caller
/// knows which athlete the call was for.
#[derive(Debug, thiserror::Error)]
pub enum StravaError {
    /// 401 on a data call: the access token was rejected.
    #[error("access token rejected")]
    Unauthorized,

    /// Refresh token revoked or already rotated.
    #[error("refresh token rejected: {0}")]
    InvalidGrant(String),

    #[error("not found")]
    NotFound,

    /// 429 from Strava itself.
    #[error("rate limited by provider")]
    RateLimited,

    /// Network failure, timeout, 5xx or unparseable body.
    #[error("{0}")]
    Unavailable(String),
}

impl StravaError {
    /// Map to the application taxonomy for a given athlete.
    ///
    /// Only a rejected refresh token means the grant is gone. A 401 on a
    /// data call that survives a forced refresh is a per-object denial
    /// (private activity, missing scope) and maps to `Forbidden`.
    pub fn for_athlete(self, athlete_id: u64) -> AppError {
        match self {
            StravaError::InvalidGrant(_) => AppError::CredentialsInvalid(athlete_id),
            StravaError::Unauthorized => {
                AppError::Forbidden(format!("Strava denied access for athlete {}", athlete_id))
            }
            StravaError::NotFound => AppError::NotFound(format!("Strava object for athlete {}", athlete_id)),
            StravaError::RateLimited => {
                AppError::ProviderUnavailable("strava rate limited (429)".to_string())
            }
            StravaError::Unavailable(msg) => AppError::ProviderUnavailable(msg),
        }
    }
}

/// Strava API client.
#[derive(Clone)]
pub struct StravaClient {
    http: reqwest::Client,
    base_url: String,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl StravaClient {
    /// Create a new Strava client with OAuth credentials and endpoints.
    pub fn new(
        client_id: String,
        client_secret: String,
        base_url: impl Into<String>,
        token_url: impl Into<String>,
    ) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AppError::Internal(anyhow::anyhow!("HTTP client build failed: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token_url: token_url.into(),
            client_id,
            client_secret,
        })
    }

    /// Get a detailed activity by ID.
    pub async fn get_activity(
        &self,
        access_token: &str,
        activity_id: u64,
    ) -> Result<StravaActivity, StravaError> {
        let url = format!("{}/activities/{}", self.base_url, activity_id);
        self.get_json(&url, access_token, &[]).await
    }

    /// List activities started after `after` (Unix seconds), paginated.
    pub async fn list_activities(
        &self,
        access_token: &str,
        after: i64,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<StravaActivity>, StravaError> {
        let url = format!("{}/athlete/activities", self.base_url);
        self.get_json(
            &url,
            access_token,
            &[
                ("after", after.to_string()),
                ("page", page.to_string()),
                ("per_page", per_page.to_string()),
            ],
        )
        .await
    }

    /// Fetch telemetry streams keyed by type, e.g. `{"watts": {"data": [...]}}`.
    pub async fn get_streams(
        &self,
        access_token: &str,
        activity_id: u64,
        keys: &[String],
    ) -> Result<serde_json::Value, StravaError> {
        let url = format!("{}/activities/{}/streams", self.base_url, activity_id);
        self.get_json(
            &url,
            access_token,
            &[
                ("keys", keys.join(",")),
                ("key_by_type", "true".to_string()),
            ],
        )
        .await
    }

    /// Exchange a refresh token for a new access/refresh pair.
    pub async fn refresh_token(
        &self,
        refresh_token: &str,
    ) -> Result<TokenRefreshResponse, StravaError> {
        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| StravaError::Unavailable(format!("Token refresh request failed: {}", e)))?;

        let status = response.status();
        if status.as_u16() == 400 || status.as_u16() == 401 {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, "Strava rejected refresh token");
            return Err(StravaError::InvalidGrant(body));
        }

        check_response_json(response).await
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        access_token: &str,
        query: &[(&str, String)],
    ) -> Result<T, StravaError> {
        let response = self
            .http
            .get(url)
            .bearer_auth(access_token)
            .query(query)
            .send()
            .await
            .map_err(|e| StravaError::Unavailable(e.to_string()))?;

        check_response_json(response).await
    }
}

/// Check response status and parse the JSON body.
async fn check_response_json<T: for<'de> Deserialize<'de>>(
    response: reqwest::Response,
) -> Result<T, StravaError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();

        return Err(match status.as_u16() {
            429 => {
                tracing::warn!("Strava rate limit hit (429)");
                StravaError::RateLimited
            }
            401 => StravaError::Unauthorized,
            404 => StravaError::NotFound,
            _ => StravaError::Unavailable(format!("HTTP {}: {}", status, body)),
        });
    }

    response
        .json()
        .await
        .map_err(|e| StravaError::Unavailable(format!("JSON parse error: {}", e)))
}

#[async_trait]
impl TokenRefresher for StravaClient {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenRefreshResponse, StravaError> {
        self.refresh_token(refresh_token).await
    }
}

/// Token refresh response from Strava.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenRefreshResponse {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix seconds
    pub expires_at: i64,
}

/// Activity as returned by the detail and list endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct StravaActivity {
    pub id: u64,
    pub name: String,
    pub sport_type: String,
    pub start_date: String,
    #[serde(default)]
    pub distance: f64,
    #[serde(default)]
    pub moving_time: u64,
    #[serde(default)]
    pub average_watts: Option<f64>,
    #[serde(default)]
    pub average_heartrate: Option<f64>,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub visibility: Option<String>,
}

impl StravaActivity {
    pub fn to_summary(&self, athlete_id: u64, source: &str, synced_at: DateTime<Utc>) -> ActivitySummary {
        ActivitySummary {
            activity_id: self.id,
            athlete_id,
            name: self.name.clone(),
            sport_type: self.sport_type.clone(),
            start_date: self.start_date.clone(),
            distance_meters: self.distance,
            moving_time_secs: self.moving_time,
            average_watts: self.average_watts,
            average_heartrate: self.average_heartrate,
            private: self.private,
            visibility: self.visibility.clone(),
            source: source.to_string(),
            synced_at,
        }
    }
}
