// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! In-process periodic jobs: queue drains and audit pruning.
//!
//! Deployments that trigger `/tasks/*` from an external scheduler leave
//! this disabled.

use crate::AppState;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

const AUDIT_PRUNE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Spawn the drain, batch-drain and audit-prune loops.
pub fn spawn(state: Arc<AppState>) -> Vec<JoinHandle<()>> {
    let drain = state.config.drain;
    tracing::info!(
        drain_secs = drain.drain_interval_secs,
        batch_secs = drain.batch_interval_secs,
        "Starting scheduler"
    );

    vec![
        every(
            "drain",
            Duration::from_secs(drain.drain_interval_secs),
            state.clone(),
            |state| async move {
                if let Err(e) = state.drainer.drain_default().await {
                    tracing::error!(error = %e, "Scheduled drain failed");
                }
            },
        ),
        every(
            "drain-batch",
            Duration::from_secs(drain.batch_interval_secs),
            state.clone(),
            |state| async move {
                if let Err(e) = state.drainer.drain_batch_default().await {
                    tracing::error!(error = %e, "Scheduled batch drain failed");
                }
            },
        ),
        every("prune-audit", AUDIT_PRUNE_INTERVAL, state, |state| async move {
            if let Err(e) = state.audit.prune().await {
                tracing::error!(error = %e, "Scheduled audit prune failed");
            }
        }),
    ]
}

/// Run `job` every `period`, first after one full period. Ticks missed
/// while a run is in progress are not made up.
fn every<F, Fut>(name: &'static str, period: Duration, state: Arc<AppState>, job: F) -> JoinHandle<()>
where
    F: Fn(Arc<AppState>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let period = period.max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            tracing::debug!(job = name, "Scheduled job starting");
            job(state.clone()).await;
        }
    })
}
