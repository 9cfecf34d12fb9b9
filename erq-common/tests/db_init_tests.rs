//! Schema creation and region seeding against a temporary database

use erq_common::db::facilities::{facilities_without_location, get_facility, update_facility_location};
use erq_common::db::init::init_database;
use erq_common::db::regions::{load_regions, seed_regions};
use erq_common::geo::GeoPoint;
use sqlx::Row;
use tempfile::TempDir;
use uuid::Uuid;

#[tokio::test]
async fn init_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("erq.db");

    let pool = init_database(&path).await.unwrap();
    pool.close().await;
    let pool = init_database(&path).await.unwrap();

    let tables: Vec<String> = sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
        .fetch_all(&pool)
        .await
        .unwrap()
        .iter()
        .map(|r| r.get::<String, _>("name"))
        .collect();

    for expected in [
        "facilities",
        "ingestion_anomalies",
        "ingestion_cycles",
        "ingestion_leases",
        "occupancy_current",
        "occupancy_history",
        "regions",
        "schema_version",
    ] {
        assert!(tables.iter().any(|t| t == expected), "missing table {expected}");
    }
}

#[tokio::test]
async fn foreign_keys_are_enforced() {
    let dir = TempDir::new().unwrap();
    let pool = init_database(&dir.path().join("erq.db")).await.unwrap();

    let result = sqlx::query(
        "INSERT INTO occupancy_history (facility_id, cycle_id, status, recorded_at) VALUES (?, ?, 'valid', ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(Uuid::new_v4().to_string())
    .bind("2024-01-01T00:00:00.000Z")
    .execute(&pool)
    .await;
    assert!(result.is_err(), "history row for unknown facility must be rejected");
}

#[tokio::test]
async fn region_seeding_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let pool = init_database(&dir.path().join("erq.db")).await.unwrap();

    assert_eq!(seed_regions(&pool).await.unwrap(), 18);
    assert_eq!(seed_regions(&pool).await.unwrap(), 0);

    let regions = load_regions(&pool).await.unwrap();
    assert_eq!(regions.len(), 18);
    let montreal = regions.iter().find(|r| r.code == "06").unwrap();
    assert_eq!(montreal.name, "Montréal");
    assert_eq!(montreal.name_key, "montreal");
}

#[tokio::test]
async fn location_update_fills_missing_coordinates() {
    let dir = TempDir::new().unwrap();
    let pool = init_database(&dir.path().join("erq.db")).await.unwrap();

    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO facilities (id, establishment_name, establishment_key, city, created_at, updated_at) \
         VALUES (?, 'Hôpital de Gaspé', 'hopital de gaspe', 'Gaspé', ?, ?)",
    )
    .bind(id.to_string())
    .bind("2024-01-01T00:00:00.000Z")
    .bind("2024-01-01T00:00:00.000Z")
    .execute(&pool)
    .await
    .unwrap();

    assert_eq!(facilities_without_location(&pool).await.unwrap().len(), 1);

    let point = GeoPoint::new(48.8316, -64.4869).unwrap();
    assert!(update_facility_location(&pool, id, point, Some("215 boul. York"), Some("Ignored"), None)
        .await
        .unwrap());

    let facility = get_facility(&pool, id).await.unwrap().unwrap();
    assert_eq!(facility.location, Some(point));
    assert_eq!(facility.address.as_deref(), Some("215 boul. York"));
    // existing city kept
    assert_eq!(facility.city.as_deref(), Some("Gaspé"));
    assert!(facilities_without_location(&pool).await.unwrap().is_empty());
}
