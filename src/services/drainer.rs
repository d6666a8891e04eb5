// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Queue drainer.
//!
//! Each invocation pops a bounded number of jobs from the live lane, then
//! the backfill lane, and dispatches them. The batch lane is drained
//! separately with a fixed delay between jobs.
//!
//! Jobs that cannot run yet are put back at the tail of their lane and the
//! drain moves on to the next job. A lane stops once every remaining job
//! has been looked at.
//!
//! Failure handling:
//! - provider quota denied: no attempt consumed, job waits for the
//!   athlete's window to reset, and that athlete's other provider jobs in
//!   this invocation wait with it
//! - credentials invalid: athlete is deauthorized locally, job dropped
//! - not found: job dropped
//! - retryable: re-appended with exponential backoff until
//!   `max_job_attempts`, then dead-lettered
//! - anything else, or a payload that does not parse: dead-lettered
//!
//! Scans record their next page in the job, so a scan cut short by quota
//! or an error resumes where it stopped.

use crate::config::{DrainSettings, STRAVA_PROVIDER};
use crate::db::Persistence;
use crate::error::AppError;
use crate::models::{AuditKind, AuditLogEntry};
use crate::services::audit::AuditLog;
use crate::services::cache::{CacheKey, CacheLayer, CacheNamespace};
use crate::services::ingest::remove_athlete;
use crate::services::queue::{Dequeued, Job, JobEnvelope, Lane, WorkQueue};
use crate::services::rate_limit::{RateLimiter, StoreErrorPolicy};
use crate::services::strava::StravaClient;
use crate::services::tokens::TokenManager;
use crate::time_utils::SharedClock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Activities requested per list page during scans.
const SCAN_PAGE_SIZE: u32 = 100;
/// Hard stop for a single scan.
const SCAN_MAX_PAGES: u32 = 50;
/// Jobs put back per lane and invocation before the lane is left alone.
const HOLD_LIMIT: usize = 100;

/// Counts from one drain invocation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Jobs that completed
    pub processed: usize,
    /// Jobs that failed this invocation (retried, dropped or dead-lettered)
    pub failed: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    /// Payloads that did not parse (also dead-lettered, counted here only)
    pub malformed: usize,
    /// Jobs held back because the athlete's provider budget was exhausted
    pub deferred: usize,
    /// Jobs skipped because their retry backoff had not elapsed
    pub waiting: usize,
}

impl DrainReport {
    pub fn merge(&mut self, other: DrainReport) {
        self.processed += other.processed;
        self.failed += other.failed;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
        self.malformed += other.malformed;
        self.deferred += other.deferred;
        self.waiting += other.waiting;
    }

    /// Jobs popped off a lane.
    pub fn popped(&self) -> usize {
        self.processed + self.failed + self.malformed + self.deferred + self.waiting
    }
}

#[derive(Clone)]
pub struct Drainer {
    queue: WorkQueue,
    limiter: RateLimiter,
    tokens: TokenManager,
    strava: StravaClient,
    db: Arc<dyn Persistence>,
    cache: CacheLayer,
    audit: AuditLog,
    clock: SharedClock,
    settings: DrainSettings,
}

impl Drainer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: WorkQueue,
        limiter: RateLimiter,
        tokens: TokenManager,
        strava: StravaClient,
        db: Arc<dyn Persistence>,
        cache: CacheLayer,
        audit: AuditLog,
        clock: SharedClock,
        settings: DrainSettings,
    ) -> Self {
        Self {
            queue,
            limiter,
            tokens,
            strava,
            db,
            cache,
            audit,
            clock,
            settings,
        }
    }

    /// Drain up to `live` jobs from the live lane, then up to `backfill`
    /// from the backfill lane.
    pub async fn drain(&self, live: usize, backfill: usize) -> Result<DrainReport, AppError> {
        let mut report = self.drain_lane(Lane::Live, live, Duration::ZERO).await?;
        report.merge(self.drain_lane(Lane::Backfill, backfill, Duration::ZERO).await?);
        tracing::info!(?report, "Drain complete");
        Ok(report)
    }

    /// Drain with the configured per-lane sizes.
    pub async fn drain_default(&self) -> Result<DrainReport, AppError> {
        self.drain(self.settings.live_batch, self.settings.backfill_batch)
            .await
    }

    /// Drain the batch lane, sleeping `delay` between jobs.
    pub async fn drain_batch(&self, max: usize, delay: Duration) -> Result<DrainReport, AppError> {
        let report = self.drain_lane(Lane::Batch, max, delay).await?;
        tracing::info!(?report, "Batch drain complete");
        Ok(report)
    }

    pub async fn drain_batch_default(&self) -> Result<DrainReport, AppError> {
        self.drain_batch(
            self.settings.batch_max,
            Duration::from_millis(self.settings.batch_delay_ms),
        )
        .await
    }

    async fn drain_lane(
        &self,
        lane: Lane,
        max: usize,
        delay: Duration,
    ) -> Result<DrainReport, AppError> {
        let mut report = DrainReport::default();
        // Athletes whose provider budget ran out, with when it reopens.
        let mut exhausted: HashMap<u64, i64> = HashMap::new();
        let mut first_held: Option<JobEnvelope> = None;
        let mut held = 0usize;
        let mut ran = 0usize;

        while ran < max && held < HOLD_LIMIT {
            let mut envelope = match self.queue.pop(lane).await? {
                None => break,
                Some(Dequeued::Malformed { raw, error }) => {
                    tracing::warn!(lane = %lane, error = %error, "Malformed job payload");
                    ran += 1;
                    report.malformed += 1;
                    self.audit
                        .record(AuditLogEntry::new(
                            AuditKind::DeadLetter,
                            lane.as_str(),
                            format!("malformed job: {}", error),
                        ))
                        .await;
                    self.queue.dead_letter(lane, raw, format!("malformed: {}", error)).await?;
                    continue;
                }
                Some(Dequeued::Job(envelope)) => envelope,
            };

            if first_held.as_ref() == Some(&envelope) {
                // Back to the first job we put aside: nothing left to run.
                self.queue.requeue_front(lane, &envelope).await?;
                break;
            }

            let athlete_id = envelope.job.athlete_id();
            let blocked_until = envelope
                .job
                .uses_provider()
                .then(|| exhausted.get(&athlete_id).copied())
                .flatten();

            if let Some(reset_at) = blocked_until {
                envelope.not_before = envelope.not_before.max(reset_at);
                report.deferred += 1;
            } else if !envelope.is_due(self.clock.now_ms()) {
                report.waiting += 1;
            } else {
                if ran > 0 && !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                ran += 1;

                match self.execute(lane, &mut envelope.job).await {
                    Ok(()) => {
                        report.processed += 1;
                        continue;
                    }
                    Err(AppError::QuotaExceeded { reason, reset_at }) => {
                        tracing::info!(
                            lane = %lane,
                            kind = envelope.job.kind(),
                            athlete_id,
                            reason = %reason,
                            reset_at,
                            "Provider budget exhausted, deferring athlete"
                        );
                        exhausted.insert(athlete_id, reset_at);
                        envelope.not_before = reset_at;
                        report.deferred += 1;
                    }
                    Err(e) => {
                        report.failed += 1;
                        self.handle_failure(lane, envelope, e, &mut report).await?;
                        continue;
                    }
                }
            }

            self.queue.requeue_back(lane, &envelope).await?;
            held += 1;
            if first_held.is_none() {
                first_held = Some(envelope);
            }
        }

        Ok(report)
    }

    async fn handle_failure(
        &self,
        lane: Lane,
        envelope: JobEnvelope,
        error: AppError,
        report: &mut DrainReport,
    ) -> Result<(), AppError> {
        let job = &envelope.job;
        let athlete_id = job.athlete_id();

        if let AppError::CredentialsInvalid(id) = error {
            tracing::warn!(athlete_id = id, kind = job.kind(), "Credentials revoked, deauthorizing");
            remove_athlete(
                self.db.as_ref(),
                &self.tokens,
                &self.audit,
                id,
                job.kind(),
                "provider rejected credentials",
            )
            .await?;
            return Ok(());
        }

        if let AppError::NotFound(what) = &error {
            tracing::info!(athlete_id, kind = job.kind(), what, "Job target gone, dropping");
            self.audit
                .athlete_event(AuditKind::JobFailed, athlete_id, job.kind(), format!("not found: {}", what))
                .await;
            return Ok(());
        }

        let failures = envelope.attempts + 1;
        if error.is_retryable() && failures < self.settings.max_job_attempts {
            tracing::warn!(
                lane = %lane,
                kind = job.kind(),
                athlete_id,
                attempt = failures,
                error = %error,
                "Job failed, will retry"
            );
            self.audit
                .athlete_event(AuditKind::JobFailed, athlete_id, job.kind(), error.to_string())
                .await;
            let not_before = self.clock.now_ms() + self.settings.retry_delay_ms(failures);
            self.queue.retry(lane, envelope, not_before).await?;
            report.retried += 1;
            return Ok(());
        }

        tracing::error!(
            lane = %lane,
            kind = job.kind(),
            athlete_id,
            attempts = failures,
            error = %error,
            "Job failed permanently"
        );
        self.audit
            .athlete_event(AuditKind::DeadLetter, athlete_id, job.kind(), error.to_string())
            .await;
        let mut dead = envelope;
        dead.attempts = failures;
        self.queue.dead_letter_job(lane, &dead, error.to_string()).await?;
        report.dead_lettered += 1;
        Ok(())
    }

    async fn execute(&self, lane: Lane, job: &mut Job) -> Result<(), AppError> {
        match job {
            Job::SyncActivity {
                athlete_id,
                activity_id,
            } => self.sync_activity(lane, *athlete_id, *activity_id).await,
            Job::DeleteActivity {
                athlete_id,
                activity_id,
            } => self.delete_activity(*athlete_id, *activity_id).await,
            Job::Deauth { athlete_id } => {
                tracing::info!(athlete_id = *athlete_id, "Deauthorization already handled at ingest");
                Ok(())
            }
            Job::BackfillAthlete {
                athlete_id,
                window_days,
                after,
                page,
            } => {
                let days = i64::from(*window_days);
                let since = *after.get_or_insert_with(|| {
                    (self.clock.now() - chrono::Duration::days(days)).timestamp()
                });
                self.scan(*athlete_id, since, page, "backfill").await
            }
            Job::ReconcileSince {
                athlete_id,
                since,
                page,
            } => self.scan(*athlete_id, *since, page, "reconcile").await,
        }
    }

    async fn sync_activity(
        &self,
        lane: Lane,
        athlete_id: u64,
        activity_id: u64,
    ) -> Result<(), AppError> {
        self.limiter
            .require_provider(STRAVA_PROVIDER, athlete_id, StoreErrorPolicy::FailClosed)
            .await?;

        let strava = &self.strava;
        let activity = self
            .tokens
            .call_with_token(athlete_id, |token| async move {
                strava.get_activity(&token, activity_id).await
            })
            .await?;

        let summary = activity.to_summary(athlete_id, lane.as_str(), self.clock.now());
        self.db.upsert_activity_summary(&summary).await?;

        match serde_json::to_value(&summary) {
            Ok(value) => {
                self.cache
                    .set(
                        &CacheKey::new(CacheNamespace::Activity, athlete_id, activity_id),
                        value,
                        None,
                    )
                    .await
            }
            Err(e) => tracing::warn!(activity_id, error = %e, "Failed to encode summary for cache"),
        }

        self.audit
            .athlete_event(
                AuditKind::Sync,
                athlete_id,
                activity_id.to_string(),
                format!("synced via {} lane", lane),
            )
            .await;
        tracing::info!(athlete_id, activity_id, lane = %lane, "Activity synced");
        Ok(())
    }

    async fn delete_activity(&self, athlete_id: u64, activity_id: u64) -> Result<(), AppError> {
        let existed = self
            .db
            .delete_activity_summary(athlete_id, activity_id)
            .await?;
        self.cache.purge_activity(athlete_id, activity_id).await;
        self.audit
            .athlete_event(
                AuditKind::Delete,
                athlete_id,
                activity_id.to_string(),
                if existed { "summary removed" } else { "no local summary" },
            )
            .await;
        tracing::info!(athlete_id, activity_id, existed, "Activity deleted");
        Ok(())
    }

    /// List activities started after `after` (Unix seconds) and queue a
    /// sync for each on the backfill lane. Each page is gated by the
    /// provider budget; `page` is advanced as pages complete so an
    /// interrupted scan picks up from the page that failed.
    async fn scan(
        &self,
        athlete_id: u64,
        after: i64,
        page: &mut u32,
        origin: &str,
    ) -> Result<(), AppError> {
        if *page > 1 {
            tracing::info!(athlete_id, origin, page = *page, "Resuming activity scan");
        }
        let mut queued = 0usize;

        while *page <= SCAN_MAX_PAGES {
            self.limiter
                .require_provider(STRAVA_PROVIDER, athlete_id, StoreErrorPolicy::FailClosed)
                .await?;

            let current = *page;
            let strava = &self.strava;
            let activities = self
                .tokens
                .call_with_token(athlete_id, |token| async move {
                    strava
                        .list_activities(&token, after, current, SCAN_PAGE_SIZE)
                        .await
                })
                .await?;

            for activity in &activities {
                self.queue
                    .enqueue(
                        Lane::Backfill,
                        Job::SyncActivity {
                            athlete_id,
                            activity_id: activity.id,
                        },
                    )
                    .await?;
                queued += 1;
            }

            if activities.len() < SCAN_PAGE_SIZE as usize {
                break;
            }
            *page += 1;
        }

        self.audit
            .athlete_event(
                AuditKind::Backfill,
                athlete_id,
                origin,
                format!("queued {} activities after {}", queued, after),
            )
            .await;
        tracing::info!(athlete_id, origin, queued, after, "Activity scan complete");
        Ok(())
    }
}
