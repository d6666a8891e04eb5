// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Firestore client wrapper with typed operations.
//!
//! Provides high-level operations for:
//! - Activities (synced activity summaries)
//! - Credentials (provider OAuth tokens)
//! - Audit log (append-only compliance records)

use super::{collections, Persistence};
use crate::error::AppError;
use crate::models::{ActivitySummary, AthleteCredential, AuditLogEntry};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};

// Firestore limits batch/transaction writes to 500 operations.
// We use a safe limit of 400 to allow headroom.
const BATCH_SIZE: usize = 400;

/// Firestore database client.
#[derive(Clone)]
pub struct FirestoreDb {
    client: Option<firestore::FirestoreDb>,
}

fn activity_doc_id(athlete_id: u64, activity_id: u64) -> String {
    format!("{}_{}", athlete_id, activity_id)
}

fn audit_doc_id(entry: &AuditLogEntry) -> String {
    format!(
        "{}_{}_{}",
        entry.at.timestamp_millis(),
        entry.kind,
        entry.ref_id.replace('/', "_")
    )
}

/// Same textual form serde uses for `DateTime<Utc>`, so string range
/// filters line up with stored values.
fn timestamp_field(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

impl FirestoreDb {
    /// Create a new Firestore client.
    ///
    /// For local development with emulator, set FIRESTORE_EMULATOR_HOST.
    pub async fn new(project_id: &str) -> Result<Self, AppError> {
        if std::env::var("FIRESTORE_EMULATOR_HOST").is_ok() {
            return Self::create_emulator_client(project_id).await;
        }

        let client = firestore::FirestoreDb::new(project_id)
            .await
            .map_err(|e| AppError::Database(format!("Failed to connect to Firestore: {}", e)))?;

        tracing::info!(project = project_id, "Connected to Firestore");

        Ok(Self {
            client: Some(client),
        })
    }

    /// Create a Firestore client for the emulator with unauthenticated access.
    async fn create_emulator_client(project_id: &str) -> Result<Self, AppError> {
        tracing::info!("Using unauthenticated connection for Firestore Emulator");

        let token_source = gcloud_sdk::ExternalJwtFunctionSource::new(|| async {
            Ok(gcloud_sdk::Token {
                token_type: "Bearer".to_string(),
                token: gcloud_sdk::SecretValue::new(
                    "eyJhbGciOiJub25lIn0.eyJ1aWQiOiJ0ZXN0In0."
                        .to_string()
                        .into(),
                ),
                expiry: chrono::Utc::now() + chrono::Duration::hours(1),
            })
        });

        let options = firestore::FirestoreDbOptions::new(project_id.to_string());

        let client = firestore::FirestoreDb::with_options_token_source(
            options,
            gcloud_sdk::GCP_DEFAULT_SCOPES.clone(),
            gcloud_sdk::TokenSourceType::ExternalSource(Box::new(token_source)),
        )
        .await
        .map_err(|e| {
            AppError::Database(format!("Failed to connect to Firestore Emulator: {}", e))
        })?;

        tracing::info!(
            project = project_id,
            "Connected to Firestore (Emulator/Unauthenticated)"
        );

        Ok(Self {
            client: Some(client),
        })
    }

    /// Create an offline client. Every operation returns `AppError::Database`.
    pub fn new_mock() -> Self {
        Self { client: None }
    }

    fn get_client(&self) -> Result<&firestore::FirestoreDb, AppError> {
        self.client
            .as_ref()
            .ok_or_else(|| AppError::Database("Database not connected (offline mode)".to_string()))
    }

    /// Delete documents in transactional chunks.
    async fn batch_delete(&self, collection: &str, doc_ids: &[String]) -> Result<(), AppError> {
        let client = self.get_client()?;

        for chunk in doc_ids.chunks(BATCH_SIZE) {
            let mut transaction = client
                .begin_transaction()
                .await
                .map_err(|e| AppError::Database(format!("Failed to begin transaction: {}", e)))?;

            for doc_id in chunk {
                client
                    .fluent()
                    .delete()
                    .from(collection)
                    .document_id(doc_id)
                    .add_to_transaction(&mut transaction)
                    .map_err(|e| {
                        AppError::Database(format!(
                            "Failed to add deletion to transaction for {}: {}",
                            collection, e
                        ))
                    })?;
            }

            transaction.commit().await.map_err(|e| {
                AppError::Database(format!("Failed to commit batch deletion: {}", e))
            })?;
        }

        Ok(())
    }
}

#[async_trait]
impl Persistence for FirestoreDb {
    async fn upsert_activity_summary(&self, activity: &ActivitySummary) -> Result<(), AppError> {
        let _: () = self
            .get_client()?
            .fluent()
            .update()
            .in_col(collections::ACTIVITIES)
            .document_id(activity_doc_id(activity.athlete_id, activity.activity_id))
            .object(activity)
            .execute()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    async fn get_activity_summary(
        &self,
        athlete_id: u64,
        activity_id: u64,
    ) -> Result<Option<ActivitySummary>, AppError> {
        self.get_client()?
            .fluent()
            .select()
            .by_id_in(collections::ACTIVITIES)
            .obj()
            .one(&activity_doc_id(athlete_id, activity_id))
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    async fn delete_activity_summary(
        &self,
        athlete_id: u64,
        activity_id: u64,
    ) -> Result<bool, AppError> {
        if self
            .get_activity_summary(athlete_id, activity_id)
            .await?
            .is_none()
        {
            return Ok(false);
        }

        self.get_client()?
            .fluent()
            .delete()
            .from(collections::ACTIVITIES)
            .document_id(activity_doc_id(athlete_id, activity_id))
            .execute()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(true)
    }

    async fn get_credentials(
        &self,
        athlete_id: u64,
    ) -> Result<Option<AthleteCredential>, AppError> {
        self.get_client()?
            .fluent()
            .select()
            .by_id_in(collections::CREDENTIALS)
            .obj()
            .one(&athlete_id.to_string())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    async fn set_credentials(&self, credential: &AthleteCredential) -> Result<(), AppError> {
        let _: () = self
            .get_client()?
            .fluent()
            .update()
            .in_col(collections::CREDENTIALS)
            .document_id(credential.athlete_id.to_string())
            .object(credential)
            .execute()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    async fn delete_athlete(&self, athlete_id: u64) -> Result<usize, AppError> {
        let activities: Vec<ActivitySummary> = self
            .get_client()?
            .fluent()
            .select()
            .from(collections::ACTIVITIES)
            .filter(|q| q.for_all([q.field("athlete_id").eq(athlete_id)]))
            .obj()
            .query()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        let doc_ids: Vec<String> = activities
            .iter()
            .map(|a| activity_doc_id(a.athlete_id, a.activity_id))
            .collect();
        self.batch_delete(collections::ACTIVITIES, &doc_ids).await?;
        let mut deleted_count = doc_ids.len();
        tracing::debug!(athlete_id, count = doc_ids.len(), "Deleted activity summaries");

        if self.get_credentials(athlete_id).await?.is_some() {
            self.get_client()?
                .fluent()
                .delete()
                .from(collections::CREDENTIALS)
                .document_id(athlete_id.to_string())
                .execute()
                .await
                .map_err(|e| AppError::Database(e.to_string()))?;
            deleted_count += 1;
        }

        tracing::info!(athlete_id, deleted_count, "Athlete data deletion complete");
        Ok(deleted_count)
    }

    async fn append_audit_log(&self, entry: &AuditLogEntry) -> Result<(), AppError> {
        let _: () = self
            .get_client()?
            .fluent()
            .update()
            .in_col(collections::AUDIT_LOG)
            .document_id(audit_doc_id(entry))
            .object(entry)
            .execute()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    async fn list_audit_log(
        &self,
        athlete_id: u64,
        limit: u32,
    ) -> Result<Vec<AuditLogEntry>, AppError> {
        self.get_client()?
            .fluent()
            .select()
            .from(collections::AUDIT_LOG)
            .filter(move |q| q.for_all([q.field("athlete_id").eq(athlete_id)]))
            .order_by([("at", firestore::FirestoreQueryDirection::Descending)])
            .limit(limit)
            .obj()
            .query()
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    async fn prune_audit_log(&self, before: DateTime<Utc>) -> Result<usize, AppError> {
        let cutoff = timestamp_field(before);
        let stale: Vec<AuditLogEntry> = self
            .get_client()?
            .fluent()
            .select()
            .from(collections::AUDIT_LOG)
            .filter(move |q| q.for_all([q.field("at").less_than(cutoff.clone())]))
            .obj()
            .query()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        let doc_ids: Vec<String> = stale.iter().map(audit_doc_id).collect();
        self.batch_delete(collections::AUDIT_LOG, &doc_ids).await?;
        Ok(doc_ids.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AuditKind;

    #[test]
    fn activity_ids_are_scoped_by_athlete() {
        assert_eq!(activity_doc_id(7, 42), "7_42");
    }

    #[test]
    fn audit_ids_sort_by_time_and_avoid_slashes() {
        let at = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let entry = AuditLogEntry::new(AuditKind::Webhook, "a/b", "").at(at);
        assert_eq!(audit_doc_id(&entry), "1700000000000_webhook_a_b");
    }

    #[tokio::test]
    async fn offline_client_reports_database_error() {
        let db = FirestoreDb::new_mock();
        assert!(matches!(
            db.get_credentials(1).await,
            Err(AppError::Database(_))
        ));
    }
}
