// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Persistence collaborator.
//!
//! The ingestion core only needs a handful of per-call transactional
//! operations. `FirestoreDb` is the production backend; `MemoryDb` backs
//! tests and local development.

pub mod firestore;
pub mod memory;

pub use firestore::FirestoreDb;
pub use memory::MemoryDb;

use crate::error::AppError;
use crate::models::{ActivitySummary, AthleteCredential, AuditLogEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Collection names as constants.
pub mod collections {
    pub const ACTIVITIES: &str = "activities";
    pub const CREDENTIALS: &str = "credentials";
    pub const AUDIT_LOG: &str = "audit_log";
}

/// Storage operations consumed by the ingestion core.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Create or replace an activity summary.
    async fn upsert_activity_summary(&self, activity: &ActivitySummary) -> Result<(), AppError>;

    async fn get_activity_summary(
        &self,
        athlete_id: u64,
        activity_id: u64,
    ) -> Result<Option<ActivitySummary>, AppError>;

    /// Remove one summary. Returns false when it did not exist.
    async fn delete_activity_summary(
        &self,
        athlete_id: u64,
        activity_id: u64,
    ) -> Result<bool, AppError>;

    async fn get_credentials(&self, athlete_id: u64)
        -> Result<Option<AthleteCredential>, AppError>;

    async fn set_credentials(&self, credential: &AthleteCredential) -> Result<(), AppError>;

    /// Delete everything held for an athlete (credentials and summaries).
    /// Returns the number of records removed. Audit entries are kept.
    async fn delete_athlete(&self, athlete_id: u64) -> Result<usize, AppError>;

    async fn append_audit_log(&self, entry: &AuditLogEntry) -> Result<(), AppError>;

    /// Most recent entries for an athlete, newest first.
    async fn list_audit_log(
        &self,
        athlete_id: u64,
        limit: u32,
    ) -> Result<Vec<AuditLogEntry>, AppError>;

    /// Remove entries older than `before`. Returns the number removed.
    async fn prune_audit_log(&self, before: DateTime<Utc>) -> Result<usize, AppError>;
}
