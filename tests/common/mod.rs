// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use velo_sync::config::Config;
use velo_sync::db::firestore::FirestoreDb;
use velo_sync::db::memory::MemoryDb;
use velo_sync::db::Persistence;
use velo_sync::middleware::auth::create_jwt;
use velo_sync::models::AthleteCredential;
use velo_sync::routes::create_router;
use velo_sync::store::MemoryStore;
use velo_sync::time_utils::ManualClock;
use velo_sync::AppState;

/// 2026-03-02T10:07:00Z: mid-window for every window kind.
#[allow(dead_code)]
pub const TEST_NOW_MS: i64 = 1_772_446_020_000;

/// Check if emulator is available via environment variable.
#[allow(dead_code)]
pub fn emulator_available() -> bool {
    std::env::var("FIRESTORE_EMULATOR_HOST").is_ok()
}

/// Skip test with message if emulator not available.
#[macro_export]
macro_rules! require_emulator {
    () => {
        if !crate::common::emulator_available() {
            eprintln!("⚠️  Skipping: FIRESTORE_EMULATOR_HOST not set");
            return;
        }
    };
}

/// Create a test database connection.
#[allow(dead_code)]
pub async fn test_db() -> FirestoreDb {
    FirestoreDb::new("test-project")
        .await
        .expect("Failed to connect to Firestore emulator")
}

/// Everything a test needs to drive and inspect the app.
#[allow(dead_code)]
pub struct TestApp {
    pub router: axum::Router,
    pub state: Arc<AppState>,
    pub store: MemoryStore,
    pub db: MemoryDb,
    pub clock: Arc<ManualClock>,
}

/// Create a test app on in-memory backends with an unreachable Strava.
#[allow(dead_code)]
pub fn create_test_app() -> TestApp {
    create_test_app_with(Config::test_default())
}

/// Create a test app whose Strava calls go to a mock server.
#[allow(dead_code)]
pub fn create_test_app_for(strava_uri: &str) -> TestApp {
    let mut config = Config::test_default();
    config.strava_api_url = format!("{}/api/v3", strava_uri);
    config.strava_token_url = format!("{}/oauth/token", strava_uri);
    create_test_app_with(config)
}

#[allow(dead_code)]
pub fn create_test_app_with(config: Config) -> TestApp {
    let clock = Arc::new(ManualClock::at_ms(TEST_NOW_MS));
    let store = MemoryStore::new(clock.clone());
    let db = MemoryDb::new();

    let state = Arc::new(
        AppState::build(
            config,
            Arc::new(store.clone()),
            Arc::new(db.clone()),
            clock.clone(),
        )
        .expect("Failed to build app state"),
    );

    TestApp {
        router: create_router(state.clone()),
        state,
        store,
        db,
        clock,
    }
}

#[allow(dead_code)]
pub fn now(clock: &ManualClock) -> DateTime<Utc> {
    use velo_sync::time_utils::Clock;
    clock.now()
}

/// Store credentials for an athlete that stay valid for six hours.
#[allow(dead_code)]
pub async fn seed_credentials(app: &TestApp, athlete_id: u64) {
    app.db
        .set_credentials(&AthleteCredential {
            athlete_id,
            access_token: format!("access-{}", athlete_id),
            refresh_token: format!("refresh-{}", athlete_id),
            expires_at: now(&app.clock) + Duration::hours(6),
            scopes: vec!["activity:read_all".to_string()],
        })
        .await
        .expect("Failed to seed credentials");
}

/// Session JWT for the test signing key.
#[allow(dead_code)]
pub fn create_test_jwt(athlete_id: u64, tier: &str) -> String {
    create_jwt(athlete_id, tier, &Config::test_default().jwt_signing_key)
        .expect("Failed to create JWT")
}

/// Strava activity JSON as returned by the detail endpoint.
#[allow(dead_code)]
pub fn strava_activity_json(id: u64) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "name": format!("Ride {}", id),
        "sport_type": "Ride",
        "start_date": "2026-03-01T08:00:00Z",
        "distance": 32000.0,
        "moving_time": 4200,
        "average_watts": 190.5,
        "private": false,
        "visibility": "everyone"
    })
}
