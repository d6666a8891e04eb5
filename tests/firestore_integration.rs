// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Firestore integration tests.
//!
//! These tests require the Firestore emulator to be running with
//! `FIRESTORE_EMULATOR_HOST` set. They are skipped otherwise.

use chrono::{Duration, TimeZone, Utc};
use velo_sync::db::Persistence;
use velo_sync::models::{ActivitySummary, AthleteCredential, AuditKind, AuditLogEntry};

mod common;
use common::test_db;

/// Generate a unique athlete ID for test isolation.
fn unique_athlete_id() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64
        % 1_000_000_000_000
}

fn summary(athlete_id: u64, activity_id: u64) -> ActivitySummary {
    ActivitySummary {
        activity_id,
        athlete_id,
        name: format!("Activity {}", activity_id),
        sport_type: "Run".to_string(),
        start_date: "2026-03-01T07:30:00Z".to_string(),
        distance_meters: 10_000.0,
        moving_time_secs: 2_700,
        average_watts: None,
        average_heartrate: Some(151.0),
        private: false,
        visibility: Some("everyone".to_string()),
        source: "live".to_string(),
        synced_at: Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap(),
    }
}

#[tokio::test]
async fn test_activity_summary_round_trip() {
    require_emulator!();

    let db = test_db().await;
    let athlete_id = unique_athlete_id();

    assert!(db.get_activity_summary(athlete_id, 1).await.unwrap().is_none());

    db.upsert_activity_summary(&summary(athlete_id, 1)).await.unwrap();
    let mut updated = summary(athlete_id, 1);
    updated.name = "Renamed".to_string();
    db.upsert_activity_summary(&updated).await.unwrap();

    let stored = db.get_activity_summary(athlete_id, 1).await.unwrap().unwrap();
    assert_eq!(stored.name, "Renamed");
    assert_eq!(stored.average_heartrate, Some(151.0));

    assert!(db.delete_activity_summary(athlete_id, 1).await.unwrap());
    assert!(!db.delete_activity_summary(athlete_id, 1).await.unwrap());
}

#[tokio::test]
async fn test_delete_athlete_removes_credentials_and_summaries() {
    require_emulator!();

    let db = test_db().await;
    let athlete_id = unique_athlete_id();
    let other_athlete = athlete_id + 1;

    db.set_credentials(&AthleteCredential {
        athlete_id,
        access_token: "a".to_string(),
        refresh_token: "r".to_string(),
        expires_at: Utc::now() + Duration::hours(6),
        scopes: vec!["activity:read_all".to_string()],
    })
    .await
    .unwrap();
    db.upsert_activity_summary(&summary(athlete_id, 10)).await.unwrap();
    db.upsert_activity_summary(&summary(athlete_id, 11)).await.unwrap();
    db.upsert_activity_summary(&summary(other_athlete, 12)).await.unwrap();

    let removed = db.delete_athlete(athlete_id).await.unwrap();
    assert_eq!(removed, 3);

    assert!(db.get_credentials(athlete_id).await.unwrap().is_none());
    assert!(db.get_activity_summary(athlete_id, 10).await.unwrap().is_none());
    assert!(db
        .get_activity_summary(other_athlete, 12)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_audit_log_is_listed_newest_first_and_pruned() {
    require_emulator!();

    let db = test_db().await;
    let athlete_id = unique_athlete_id();
    let now = Utc::now();

    for (days_ago, ref_id) in [(40, "old"), (3, "mid"), (1, "new")] {
        db.append_audit_log(
            &AuditLogEntry::new(AuditKind::Sync, ref_id, "test")
                .athlete(athlete_id)
                .at(now - Duration::days(days_ago)),
        )
        .await
        .unwrap();
    }

    let entries = db.list_audit_log(athlete_id, 10).await.unwrap();
    let refs: Vec<&str> = entries.iter().map(|e| e.ref_id.as_str()).collect();
    assert_eq!(refs, vec!["new", "mid", "old"]);

    let removed = db.prune_audit_log(now - Duration::days(30)).await.unwrap();
    assert!(removed >= 1);

    let entries = db.list_audit_log(athlete_id, 10).await.unwrap();
    assert_eq!(entries.len(), 2);
}
