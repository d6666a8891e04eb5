// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Strava webhook ingestion.
//!
//! Events are audit-logged, classified and turned into queued jobs. The only
//! work done inline is deauthorization, which must remove athlete data
//! before anything else can touch it.

use crate::db::Persistence;
use crate::error::AppError;
use crate::models::{AuditKind, AuditLogEntry};
use crate::services::audit::AuditLog;
use crate::services::queue::{Job, Lane, WorkQueue};
use crate::services::tokens::TokenManager;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Update fields that change what we store about an activity.
const RELEVANT_UPDATE_FIELDS: [&str; 4] = ["title", "type", "visibility", "private"];

/// Strava webhook event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    /// "activity" or "athlete"
    pub object_type: String,
    pub object_id: u64,
    /// "create", "update" or "delete"
    pub aspect_type: String,
    pub owner_id: u64,
    #[serde(default)]
    pub subscription_id: Option<u64>,
    #[serde(default)]
    pub event_time: Option<i64>,
    /// For athlete events, contains {"authorized": "false"} on deauthorization
    #[serde(default, deserialize_with = "null_as_empty")]
    pub updates: Map<String, Value>,
}

/// Strava sends `"updates": null` on some create and delete events.
fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Map<String, Value>, D::Error> {
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

impl WebhookEvent {
    /// Strava sends: object_type="athlete", aspect_type="update",
    /// updates={"authorized": "false"}
    pub fn is_deauthorization(&self) -> bool {
        self.object_type == "athlete"
            && self
                .updates
                .get("authorized")
                .is_some_and(|v| v == false || v == "false")
    }

    pub fn has_relevant_update(&self) -> bool {
        RELEVANT_UPDATE_FIELDS
            .iter()
            .any(|field| self.updates.contains_key(*field))
    }
}

/// What ingestion did with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Enqueued(Lane),
    Deauthorized,
    Ignored(&'static str),
}

#[derive(Clone)]
pub struct WebhookIngester {
    queue: WorkQueue,
    db: Arc<dyn Persistence>,
    tokens: TokenManager,
    audit: AuditLog,
    verify_token: String,
    subscription_id: Option<u64>,
}

impl WebhookIngester {
    pub fn new(
        queue: WorkQueue,
        db: Arc<dyn Persistence>,
        tokens: TokenManager,
        audit: AuditLog,
        verify_token: impl Into<String>,
        subscription_id: Option<u64>,
    ) -> Self {
        Self {
            queue,
            db,
            tokens,
            audit,
            verify_token: verify_token.into(),
            subscription_id,
        }
    }

    /// Answer a subscription handshake. Returns the challenge to echo.
    pub fn verify(
        &self,
        challenge: Option<String>,
        verify_token: Option<&str>,
    ) -> Result<String, AppError> {
        if let Some(token) = verify_token {
            if token != self.verify_token {
                tracing::warn!("Webhook verification failed: invalid token");
                return Err(AppError::Forbidden("verify token mismatch".to_string()));
            }
        }
        let challenge =
            challenge.ok_or_else(|| AppError::BadRequest("missing hub.challenge".to_string()))?;
        tracing::info!("Webhook subscription verified");
        Ok(challenge)
    }

    /// Process one event.
    pub async fn ingest(&self, event: &WebhookEvent) -> Result<IngestOutcome, AppError> {
        let ref_id = format!("{}:{}", event.object_type, event.object_id);
        self.audit
            .record(
                AuditLogEntry::new(
                    AuditKind::Webhook,
                    ref_id,
                    format!(
                        "{} {}",
                        event.aspect_type,
                        Value::Object(event.updates.clone())
                    ),
                )
                .athlete(event.owner_id),
            )
            .await;

        if let (Some(expected), Some(received)) = (self.subscription_id, event.subscription_id) {
            if expected != received {
                tracing::warn!(
                    received_id = received,
                    expected_id = expected,
                    "Webhook subscription ID mismatch, ignoring event"
                );
                return Ok(IngestOutcome::Ignored("foreign subscription"));
            }
        }

        let athlete_id = event.owner_id;
        let activity_id = event.object_id;

        let (lane, job) = match (event.object_type.as_str(), event.aspect_type.as_str()) {
            ("activity", "create") => (
                Lane::Batch,
                Job::SyncActivity {
                    athlete_id,
                    activity_id,
                },
            ),
            ("activity", "update") => {
                if !event.has_relevant_update() {
                    tracing::debug!(activity_id, "Activity update has no relevant fields");
                    return Ok(IngestOutcome::Ignored("irrelevant update"));
                }
                (
                    Lane::Live,
                    Job::SyncActivity {
                        athlete_id,
                        activity_id,
                    },
                )
            }
            ("activity", "delete") => (
                Lane::Live,
                Job::DeleteActivity {
                    athlete_id,
                    activity_id,
                },
            ),
            ("athlete", _) if event.is_deauthorization() => {
                remove_athlete(
                    self.db.as_ref(),
                    &self.tokens,
                    &self.audit,
                    athlete_id,
                    "webhook",
                    "athlete revoked access",
                )
                .await?;
                self.queue
                    .enqueue(Lane::Live, Job::Deauth { athlete_id })
                    .await?;
                return Ok(IngestOutcome::Deauthorized);
            }
            (object_type, aspect_type) => {
                tracing::debug!(object_type, aspect_type, "Unhandled webhook event");
                return Ok(IngestOutcome::Ignored("unhandled event"));
            }
        };

        self.queue.enqueue(lane, job).await?;
        tracing::info!(
            athlete_id,
            activity_id,
            aspect_type = %event.aspect_type,
            lane = %lane,
            "Webhook event queued"
        );
        Ok(IngestOutcome::Enqueued(lane))
    }
}

/// Deauthorize an athlete locally: audit, delete stored data, drop cached
/// tokens. Returns the number of records removed.
pub async fn remove_athlete(
    db: &dyn Persistence,
    tokens: &TokenManager,
    audit: &AuditLog,
    athlete_id: u64,
    ref_id: &str,
    note: &str,
) -> Result<usize, AppError> {
    audit
        .athlete_event(AuditKind::Deauth, athlete_id, ref_id, note)
        .await;
    let removed = db.delete_athlete(athlete_id).await?;
    tokens.forget(athlete_id);
    tracing::info!(athlete_id, removed, "Athlete deauthorized, local data removed");
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(value: Value) -> WebhookEvent {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn deauthorization_accepts_string_or_bool() {
        for authorized in [json!("false"), json!(false)] {
            let e = event(json!({
                "object_type": "athlete",
                "object_id": 5,
                "aspect_type": "update",
                "owner_id": 5,
                "updates": {"authorized": authorized}
            }));
            assert!(e.is_deauthorization());
        }
    }

    #[test]
    fn activity_event_is_never_deauthorization() {
        let e = event(json!({
            "object_type": "activity",
            "object_id": 5,
            "aspect_type": "update",
            "owner_id": 5,
            "updates": {"authorized": "false"}
        }));
        assert!(!e.is_deauthorization());
    }

    #[test]
    fn relevant_updates() {
        let title = event(json!({
            "object_type": "activity", "object_id": 1, "aspect_type": "update",
            "owner_id": 2, "updates": {"title": "New"}
        }));
        let distance = event(json!({
            "object_type": "activity", "object_id": 1, "aspect_type": "update",
            "owner_id": 2, "updates": {"distance": 100}
        }));
        assert!(title.has_relevant_update());
        assert!(!distance.has_relevant_update());
    }

    #[test]
    fn null_updates_parse_as_empty() {
        let e = event(json!({
            "object_type": "activity", "object_id": 1, "aspect_type": "create",
            "owner_id": 2, "updates": null
        }));
        assert!(e.updates.is_empty());
        assert!(!e.has_relevant_update());
    }
}
