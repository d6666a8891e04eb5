// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Durable FIFO work queue on top of the shared store's list commands.
//!
//! Each lane is one list: enqueue is `RPUSH`, pop is `LPOP`. Envelopes are
//! serialized once here and parsed once on pop; anything that fails to parse
//! is surfaced as [`Dequeued::Malformed`] with its raw payload kept intact.

use crate::error::AppError;
use crate::store::KvStore;
use crate::time_utils::SharedClock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Queue lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    /// Latency-sensitive work (updates, deletes, on-demand sync)
    Live,
    /// Follow-up syncs from backfill/reconcile scans
    Backfill,
    /// New activities, drained slowly in bulk
    Batch,
    /// Dead letters
    Dead,
}

impl Lane {
    pub const fn as_str(self) -> &'static str {
        match self {
            Lane::Live => "live",
            Lane::Backfill => "backfill",
            Lane::Batch => "batch",
            Lane::Dead => "dead",
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unit of deferred work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Job {
    SyncActivity { athlete_id: u64, activity_id: u64 },
    DeleteActivity { athlete_id: u64, activity_id: u64 },
    Deauth { athlete_id: u64 },
    BackfillAthlete {
        athlete_id: u64,
        window_days: u32,
        /// Scan start in Unix seconds, fixed once the first page is listed
        #[serde(default, skip_serializing_if = "Option::is_none")]
        after: Option<i64>,
        /// Next list page to fetch
        #[serde(default = "first_page")]
        page: u32,
    },
    /// `since` is Unix seconds.
    ReconcileSince {
        athlete_id: u64,
        since: i64,
        #[serde(default = "first_page")]
        page: u32,
    },
}

fn first_page() -> u32 {
    1
}

impl Job {
    pub fn backfill(athlete_id: u64, window_days: u32) -> Self {
        Job::BackfillAthlete {
            athlete_id,
            window_days,
            after: None,
            page: first_page(),
        }
    }

    pub fn reconcile(athlete_id: u64, since: i64) -> Self {
        Job::ReconcileSince {
            athlete_id,
            since,
            page: first_page(),
        }
    }

    /// Whether running the job spends provider budget.
    pub fn uses_provider(&self) -> bool {
        !matches!(self, Job::DeleteActivity { .. } | Job::Deauth { .. })
    }

    pub fn athlete_id(&self) -> u64 {
        match self {
            Job::SyncActivity { athlete_id, .. }
            | Job::DeleteActivity { athlete_id, .. }
            | Job::Deauth { athlete_id }
            | Job::BackfillAthlete { athlete_id, .. }
            | Job::ReconcileSince { athlete_id, .. } => *athlete_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Job::SyncActivity { .. } => "sync-activity",
            Job::DeleteActivity { .. } => "delete-activity",
            Job::Deauth { .. } => "deauth",
            Job::BackfillAthlete { .. } => "backfill-athlete",
            Job::ReconcileSince { .. } => "reconcile-since",
        }
    }
}

/// A job plus its delivery bookkeeping, as stored on a lane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobEnvelope {
    pub job: Job,
    /// Failed attempts so far
    #[serde(default)]
    pub attempts: u32,
    /// Epoch milliseconds
    pub enqueued_at: i64,
    /// Epoch milliseconds before which the job is skipped
    #[serde(default, skip_serializing_if = "is_zero")]
    pub not_before: i64,
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

impl JobEnvelope {
    pub fn is_due(&self, now_ms: i64) -> bool {
        self.not_before <= now_ms
    }
}

/// Result of popping a lane.
#[derive(Debug, Clone, PartialEq)]
pub enum Dequeued {
    Job(JobEnvelope),
    Malformed { raw: String, error: String },
}

/// Entry on the dead-letter lane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Envelope exactly as it was popped
    pub raw: String,
    pub error: String,
    /// Lane the job came from
    pub lane: Lane,
    /// Epoch milliseconds
    pub failed_at: i64,
}

/// Outcome of a dead-letter redrive.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RedriveReport {
    pub redriven: usize,
    /// Entries that stayed dead (unparseable payloads)
    pub kept: usize,
}

#[derive(Clone)]
pub struct WorkQueue {
    store: Arc<dyn KvStore>,
    clock: SharedClock,
    prefix: String,
}

impl WorkQueue {
    pub fn new(store: Arc<dyn KvStore>, clock: SharedClock, prefix: impl Into<String>) -> Self {
        Self {
            store,
            clock,
            prefix: prefix.into(),
        }
    }

    pub fn lane_key(&self, lane: Lane) -> String {
        format!("{}:queue:{}", self.prefix, lane)
    }

    fn encode(envelope: &JobEnvelope) -> Result<String, AppError> {
        serde_json::to_string(envelope)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to serialize job: {}", e)))
    }

    /// Append a new job to the tail of a lane. Returns the lane length.
    pub async fn enqueue(&self, lane: Lane, job: Job) -> Result<u64, AppError> {
        let envelope = JobEnvelope {
            job,
            attempts: 0,
            enqueued_at: self.clock.now_ms(),
            not_before: 0,
        };
        let len = self
            .store
            .rpush(&self.lane_key(lane), &Self::encode(&envelope)?)
            .await?;
        tracing::debug!(
            lane = %lane,
            kind = envelope.job.kind(),
            athlete_id = envelope.job.athlete_id(),
            queue_len = len,
            "Job enqueued"
        );
        Ok(len)
    }

    /// Remove and parse the job at the head of a lane.
    pub async fn pop(&self, lane: Lane) -> Result<Option<Dequeued>, AppError> {
        let Some(raw) = self.store.lpop(&self.lane_key(lane)).await? else {
            return Ok(None);
        };
        Ok(Some(match serde_json::from_str::<JobEnvelope>(&raw) {
            Ok(envelope) => Dequeued::Job(envelope),
            Err(e) => Dequeued::Malformed {
                raw,
                error: e.to_string(),
            },
        }))
    }

    /// Put a job back at the head of its lane without consuming an attempt.
    pub async fn requeue_front(&self, lane: Lane, envelope: &JobEnvelope) -> Result<(), AppError> {
        self.store
            .lpush(&self.lane_key(lane), &Self::encode(envelope)?)
            .await?;
        Ok(())
    }

    /// Put a job at the tail of its lane unchanged.
    pub async fn requeue_back(&self, lane: Lane, envelope: &JobEnvelope) -> Result<(), AppError> {
        self.store
            .rpush(&self.lane_key(lane), &Self::encode(envelope)?)
            .await?;
        Ok(())
    }

    /// Re-append a failed job to the tail with its attempt count bumped,
    /// not to run again before `not_before` (epoch milliseconds).
    pub async fn retry(
        &self,
        lane: Lane,
        mut envelope: JobEnvelope,
        not_before: i64,
    ) -> Result<u32, AppError> {
        envelope.attempts += 1;
        envelope.not_before = not_before;
        self.requeue_back(lane, &envelope).await?;
        Ok(envelope.attempts)
    }

    /// Move a payload to the dead-letter lane.
    pub async fn dead_letter(
        &self,
        lane: Lane,
        raw: impl Into<String>,
        error: impl Into<String>,
    ) -> Result<(), AppError> {
        let letter = DeadLetter {
            raw: raw.into(),
            error: error.into(),
            lane,
            failed_at: self.clock.now_ms(),
        };
        let encoded = serde_json::to_string(&letter).map_err(|e| {
            AppError::Internal(anyhow::anyhow!("Failed to serialize dead letter: {}", e))
        })?;
        self.store.rpush(&self.lane_key(Lane::Dead), &encoded).await?;
        tracing::warn!(lane = %lane, error = %letter.error, "Job dead-lettered");
        Ok(())
    }

    /// Dead-letter a parsed envelope.
    pub async fn dead_letter_job(
        &self,
        lane: Lane,
        envelope: &JobEnvelope,
        error: impl Into<String>,
    ) -> Result<(), AppError> {
        self.dead_letter(lane, Self::encode(envelope)?, error).await
    }

    pub async fn len(&self, lane: Lane) -> Result<u64, AppError> {
        Ok(self.store.llen(&self.lane_key(lane)).await?)
    }

    /// Oldest dead letters first.
    pub async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, AppError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let raw = self
            .store
            .lrange(&self.lane_key(Lane::Dead), 0, limit as i64 - 1)
            .await?;
        Ok(raw
            .iter()
            .filter_map(|item| match serde_json::from_str(item) {
                Ok(letter) => Some(letter),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable dead letter");
                    None
                }
            })
            .collect())
    }

    /// Move up to `limit` dead letters back onto their original lanes with a
    /// fresh attempt budget. Letters whose payload still does not parse go
    /// back on the dead lane.
    pub async fn redrive(&self, limit: usize) -> Result<RedriveReport, AppError> {
        let dead_key = self.lane_key(Lane::Dead);
        let available = self.store.llen(&dead_key).await? as usize;
        let mut report = RedriveReport::default();

        for _ in 0..available.min(limit) {
            let Some(raw_letter) = self.store.lpop(&dead_key).await? else {
                break;
            };

            let envelope = serde_json::from_str::<DeadLetter>(&raw_letter)
                .ok()
                .and_then(|letter| {
                    serde_json::from_str::<JobEnvelope>(&letter.raw)
                        .ok()
                        .map(|envelope| (letter.lane, envelope))
                });

            match envelope {
                Some((lane, mut envelope)) if lane != Lane::Dead => {
                    envelope.attempts = 0;
                    envelope.not_before = 0;
                    self.store
                        .rpush(&self.lane_key(lane), &Self::encode(&envelope)?)
                        .await?;
                    report.redriven += 1;
                }
                _ => {
                    self.store.rpush(&dead_key, &raw_letter).await?;
                    report.kept += 1;
                }
            }
        }

        tracing::info!(redriven = report.redriven, kept = report.kept, "Dead letters redriven");
        Ok(report)
    }
}
