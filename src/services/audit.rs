// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Best-effort audit logging.
//!
//! A failed audit write is logged and swallowed; it never fails the
//! operation being audited.

use crate::db::Persistence;
use crate::error::AppError;
use crate::models::{AuditKind, AuditLogEntry};
use crate::time_utils::SharedClock;
use chrono::Duration;
use std::sync::Arc;

#[derive(Clone)]
pub struct AuditLog {
    db: Arc<dyn Persistence>,
    clock: SharedClock,
    retention_days: i64,
}

impl AuditLog {
    pub fn new(db: Arc<dyn Persistence>, clock: SharedClock, retention_days: i64) -> Self {
        Self {
            db,
            clock,
            retention_days,
        }
    }

    /// Append an entry stamped with the current time.
    pub async fn record(&self, entry: AuditLogEntry) {
        let entry = entry.at(self.clock.now());
        if let Err(e) = self.db.append_audit_log(&entry).await {
            tracing::warn!(
                kind = %entry.kind,
                ref_id = %entry.ref_id,
                error = %e,
                "Failed to write audit log entry"
            );
        }
    }

    /// Shorthand for an athlete-scoped entry.
    pub async fn athlete_event(
        &self,
        kind: AuditKind,
        athlete_id: u64,
        ref_id: impl Into<String>,
        note: impl Into<String>,
    ) {
        self.record(AuditLogEntry::new(kind, ref_id, note).athlete(athlete_id))
            .await;
    }

    /// Delete entries older than the retention period.
    pub async fn prune(&self) -> Result<usize, AppError> {
        let cutoff = self.clock.now() - Duration::days(self.retention_days);
        let removed = self.db.prune_audit_log(cutoff).await?;
        tracing::info!(removed, retention_days = self.retention_days, "Pruned audit log");
        Ok(removed)
    }
}
