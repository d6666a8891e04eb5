// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Velo-Sync API Server
//!
//! Ingests Strava webhooks, drains the work queue under provider budgets
//! and serves cached activity data to mobile clients.

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use velo_sync::{
    config::Config,
    db::{FirestoreDb, MemoryDb, Persistence},
    services::scheduler,
    store::{KvStore, MemoryStore, RestStore},
    time_utils::SystemClock,
    AppState,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize structured JSON logging
    init_logging()?;

    // Load configuration from environment
    let config = Config::from_env()?;
    tracing::info!(port = config.port, "Starting Velo-Sync API");

    let clock = Arc::new(SystemClock);

    let store: Arc<dyn KvStore> = match (&config.kv_rest_url, &config.kv_rest_token) {
        (Some(url), Some(token)) => {
            tracing::info!(url = %url, "Using REST key-value store");
            Arc::new(RestStore::new(url.clone(), token.clone())?)
        }
        _ => {
            tracing::warn!("KV_REST_URL not set, using in-memory store (single process only)");
            Arc::new(MemoryStore::new(clock.clone()))
        }
    };

    let db: Arc<dyn Persistence> = match &config.firestore_project_id {
        Some(project) => Arc::new(FirestoreDb::new(project).await?),
        None => {
            tracing::warn!("FIRESTORE_PROJECT_ID not set, using in-memory persistence");
            Arc::new(MemoryDb::new())
        }
    };

    let state = Arc::new(AppState::build(config.clone(), store, db, clock)?);

    if config.scheduler_enabled {
        scheduler::spawn(state.clone());
    }

    // Build router
    let app = velo_sync::routes::create_router(state);

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(address = %addr, "Server listening");

    axum::serve(listener, app).await?;
    Ok(())
}

/// Initialize structured JSON logging.
fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    let format = tracing_subscriber::fmt::layer()
        .json()
        .with_target(false)
        .with_current_span(true)
        .flatten_event(true);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("velo_sync=debug".parse()?)
                .add_directive("info".parse()?),
        )
        .with(format)
        .init();
    Ok(())
}
