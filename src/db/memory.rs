// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! In-memory persistence for tests and single-process development.

use super::Persistence;
use crate::error::AppError;
use crate::models::{ActivitySummary, AthleteCredential, AuditLogEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Memory-backed [`Persistence`].
#[derive(Clone, Default)]
pub struct MemoryDb {
    activities: Arc<DashMap<(u64, u64), ActivitySummary>>,
    credentials: Arc<DashMap<u64, AthleteCredential>>,
    audit: Arc<Mutex<Vec<AuditLogEntry>>>,
    fail_audit: Arc<AtomicBool>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `append_audit_log` fail, to exercise best-effort logging paths.
    pub fn set_audit_failing(&self, failing: bool) {
        self.fail_audit.store(failing, Ordering::SeqCst);
    }

    /// Every audit entry in insertion order.
    pub fn audit_entries(&self) -> Vec<AuditLogEntry> {
        self.audit
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    pub fn activity_count(&self) -> usize {
        self.activities.len()
    }

    fn audit_lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<AuditLogEntry>>, AppError> {
        self.audit
            .lock()
            .map_err(|_| AppError::Database("audit log lock poisoned".to_string()))
    }
}

#[async_trait]
impl Persistence for MemoryDb {
    async fn upsert_activity_summary(&self, activity: &ActivitySummary) -> Result<(), AppError> {
        self.activities
            .insert((activity.athlete_id, activity.activity_id), activity.clone());
        Ok(())
    }

    async fn get_activity_summary(
        &self,
        athlete_id: u64,
        activity_id: u64,
    ) -> Result<Option<ActivitySummary>, AppError> {
        Ok(self
            .activities
            .get(&(athlete_id, activity_id))
            .map(|a| a.clone()))
    }

    async fn delete_activity_summary(
        &self,
        athlete_id: u64,
        activity_id: u64,
    ) -> Result<bool, AppError> {
        Ok(self.activities.remove(&(athlete_id, activity_id)).is_some())
    }

    async fn get_credentials(
        &self,
        athlete_id: u64,
    ) -> Result<Option<AthleteCredential>, AppError> {
        Ok(self.credentials.get(&athlete_id).map(|c| c.clone()))
    }

    async fn set_credentials(&self, credential: &AthleteCredential) -> Result<(), AppError> {
        self.credentials
            .insert(credential.athlete_id, credential.clone());
        Ok(())
    }

    async fn delete_athlete(&self, athlete_id: u64) -> Result<usize, AppError> {
        let before = self.activities.len();
        self.activities.retain(|(owner, _), _| *owner != athlete_id);
        let mut deleted = before - self.activities.len();
        if self.credentials.remove(&athlete_id).is_some() {
            deleted += 1;
        }
        Ok(deleted)
    }

    async fn append_audit_log(&self, entry: &AuditLogEntry) -> Result<(), AppError> {
        if self.fail_audit.load(Ordering::SeqCst) {
            return Err(AppError::Database("audit log unavailable".to_string()));
        }
        self.audit_lock()?.push(entry.clone());
        Ok(())
    }

    async fn list_audit_log(
        &self,
        athlete_id: u64,
        limit: u32,
    ) -> Result<Vec<AuditLogEntry>, AppError> {
        let mut entries: Vec<AuditLogEntry> = self
            .audit_lock()?
            .iter()
            .filter(|e| e.athlete_id == Some(athlete_id))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.at.cmp(&a.at));
        entries.truncate(limit as usize);
        Ok(entries)
    }

    async fn prune_audit_log(&self, before: DateTime<Utc>) -> Result<usize, AppError> {
        let mut entries = self.audit_lock()?;
        let count = entries.len();
        entries.retain(|e| e.at >= before);
        Ok(count - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AuditKind;
    use chrono::Duration;

    fn summary(athlete_id: u64, activity_id: u64) -> ActivitySummary {
        ActivitySummary {
            activity_id,
            athlete_id,
            name: "Morning Ride".to_string(),
            sport_type: "Ride".to_string(),
            start_date: "2026-01-01T08:00:00Z".to_string(),
            distance_meters: 1000.0,
            moving_time_secs: 300,
            average_watts: None,
            average_heartrate: None,
            private: false,
            visibility: None,
            source: "live".to_string(),
            synced_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn delete_athlete_removes_only_their_records() {
        let db = MemoryDb::new();
        db.upsert_activity_summary(&summary(1, 10)).await.unwrap();
        db.upsert_activity_summary(&summary(1, 11)).await.unwrap();
        db.upsert_activity_summary(&summary(2, 20)).await.unwrap();
        db.set_credentials(&AthleteCredential {
            athlete_id: 1,
            access_token: "a".to_string(),
            refresh_token: "r".to_string(),
            expires_at: Utc::now(),
            scopes: vec![],
        })
        .await
        .unwrap();

        assert_eq!(db.delete_athlete(1).await.unwrap(), 3);
        assert_eq!(db.activity_count(), 1);
        assert!(db.get_credentials(1).await.unwrap().is_none());
        assert!(db.get_activity_summary(2, 20).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn audit_prune_keeps_recent_entries() {
        let db = MemoryDb::new();
        let now = Utc::now();
        db.append_audit_log(
            &AuditLogEntry::new(AuditKind::Sync, "1", "old")
                .athlete(5)
                .at(now - Duration::days(100)),
        )
        .await
        .unwrap();
        db.append_audit_log(&AuditLogEntry::new(AuditKind::Sync, "2", "new").athlete(5).at(now))
            .await
            .unwrap();

        assert_eq!(db.prune_audit_log(now - Duration::days(90)).await.unwrap(), 1);
        let left = db.list_audit_log(5, 10).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].ref_id, "2");
    }
}
