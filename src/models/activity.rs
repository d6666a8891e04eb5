// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Activity summary model for storage and API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stored activity summary, upserted after each successful provider fetch.
///
/// Summaries are metadata, not raw telemetry, so they are exempt from the
/// provider's retention limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivitySummary {
    /// Provider activity ID (also used as document ID)
    pub activity_id: u64,
    /// Provider athlete ID (owner)
    pub athlete_id: u64,
    /// Activity name/title
    pub name: String,
    /// Sport type (Ride, VirtualRide, Run, etc.)
    pub sport_type: String,
    /// Start date/time (ISO 8601)
    pub start_date: String,
    /// Distance in meters
    pub distance_meters: f64,
    pub moving_time_secs: u64,
    pub average_watts: Option<f64>,
    pub average_heartrate: Option<f64>,
    /// Whether the activity is private on the provider
    pub private: bool,
    /// Provider visibility setting ("everyone", "followers_only", "only_me")
    pub visibility: Option<String>,
    /// Lane the sync came through: "live", "backfill" or "batch"
    pub source: String,
    /// When this summary was last synced
    pub synced_at: DateTime<Utc>,
}
