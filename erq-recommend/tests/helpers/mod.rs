//! Test Helper Utilities
//!
//! Seed facilities and snapshots directly, the way a committed ingestion
//! cycle leaves them.

#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use erq_common::time::to_db;
use erq_recommend::view::SqliteSnapshotView;
use erq_recommend::{RankingSettings, RecommendationEngine};
use sqlx::SqlitePool;
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

/// Reference point, central Montréal
pub const ORIGIN: (f64, f64) = (45.5253, -73.5625);

/// Degrees of latitude per kilometer on the mean sphere
pub const DEG_PER_KM: f64 = 0.008_993_2;

/// Temporary database with schema and regions
///
/// Returns (TempDir, SqlitePool) - TempDir must be kept alive for duration of test
pub async fn create_test_db() -> (TempDir, SqlitePool) {
    let temp_dir = TempDir::new().unwrap();
    let pool = erq_common::db::init::init_database(&temp_dir.path().join("erq.db"))
        .await
        .unwrap();
    erq_common::db::regions::seed_regions(&pool).await.unwrap();
    (temp_dir, pool)
}

pub fn engine(pool: &SqlitePool) -> RecommendationEngine {
    RecommendationEngine::new(
        Arc::new(SqliteSnapshotView::new(pool.clone())),
        RankingSettings::default(),
    )
}

/// Point `km` north of [`ORIGIN`]
pub fn north_of_origin(km: f64) -> (f64, f64) {
    (ORIGIN.0 + km * DEG_PER_KM, ORIGIN.1)
}

pub async fn insert_facility(pool: &SqlitePool, name: &str, region: &str, location: Option<(f64, f64)>) -> Uuid {
    let id = Uuid::new_v4();
    let now = to_db(&Utc::now());
    sqlx::query(
        r#"
        INSERT INTO facilities
            (id, establishment_name, establishment_key, installation_name, installation_key,
             province, region_code, latitude, longitude, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, 'Québec', ?, ?, ?, ?, ?)
        "#,
    )
    .bind(id.to_string())
    .bind(format!("CIUSSS {region}"))
    .bind(format!("ciusss {region}"))
    .bind(name)
    .bind(erq_common::canon::canonicalize(name))
    .bind(region)
    .bind(location.map(|l| l.0))
    .bind(location.map(|l| l.1))
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await
    .unwrap();
    id
}

pub async fn insert_snapshot(
    pool: &SqlitePool,
    facility_id: Uuid,
    ratio: Option<f64>,
    waiting: i64,
    extracted_at: DateTime<Utc>,
) {
    sqlx::query(
        r#"
        INSERT INTO occupancy_current
            (facility_id, cycle_id, functional_stretchers, occupied_stretchers,
             patients_waiting, occupancy_ratio, extracted_at, updated_at)
        VALUES (?, ?, 40, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(facility_id.to_string())
    .bind(Uuid::new_v4().to_string())
    .bind(ratio.map(|r| (r * 40.0).round() as i64))
    .bind(waiting)
    .bind(ratio)
    .bind(to_db(&extracted_at))
    .bind(to_db(&Utc::now()))
    .execute(pool)
    .await
    .unwrap();
}

/// Located facility with a fresh snapshot, `km` north of [`ORIGIN`]
pub async fn fresh_facility(pool: &SqlitePool, name: &str, km: f64, ratio: f64) -> Uuid {
    let id = insert_facility(pool, name, "06", Some(north_of_origin(km))).await;
    insert_snapshot(pool, id, Some(ratio), 0, Utc::now() - Duration::minutes(10)).await;
    id
}

pub async fn insert_history(
    pool: &SqlitePool,
    facility_id: Uuid,
    status: &str,
    ratio: Option<f64>,
    extracted_at: Option<DateTime<Utc>>,
    recorded_at: DateTime<Utc>,
) {
    sqlx::query(
        r#"
        INSERT INTO occupancy_history
            (facility_id, cycle_id, occupancy_ratio, extracted_at, status, recorded_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(facility_id.to_string())
    .bind(Uuid::new_v4().to_string())
    .bind(ratio)
    .bind(extracted_at.map(|t| to_db(&t)))
    .bind(status)
    .bind(to_db(&recorded_at))
    .execute(pool)
    .await
    .unwrap();
}
