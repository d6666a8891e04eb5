// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Append-only audit log entries (compliance evidence and diagnosis).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What an audit entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// Raw inbound webhook event
    Webhook,
    /// Athlete revoked access; local data removed
    Deauth,
    /// Activity summary synced from the provider
    Sync,
    /// Local activity summary removed
    Delete,
    /// Backfill / reconcile scan queued follow-up jobs
    Backfill,
    /// Job failed and will be retried
    JobFailed,
    /// Job moved to the dead-letter lane
    DeadLetter,
}

impl AuditKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditKind::Webhook => "webhook",
            AuditKind::Deauth => "deauth",
            AuditKind::Sync => "sync",
            AuditKind::Delete => "delete",
            AuditKind::Backfill => "backfill",
            AuditKind::JobFailed => "job_failed",
            AuditKind::DeadLetter => "dead_letter",
        }
    }
}

impl fmt::Display for AuditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audit log record. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub kind: AuditKind,
    /// Object the entry refers to (activity ID, event ID, job kind, ...)
    pub ref_id: String,
    pub note: String,
    pub athlete_id: Option<u64>,
    pub user_id: Option<String>,
    pub at: DateTime<Utc>,
}

impl AuditLogEntry {
    pub fn new(kind: AuditKind, ref_id: impl Into<String>, note: impl Into<String>) -> Self {
        Self {
            kind,
            ref_id: ref_id.into(),
            note: note.into(),
            athlete_id: None,
            user_id: None,
            at: Utc::now(),
        }
    }

    pub fn athlete(mut self, athlete_id: u64) -> Self {
        self.athlete_id = Some(athlete_id);
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = at;
        self
    }
}
