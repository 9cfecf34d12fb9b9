//! Integration tests for facility history and region statistics

mod helpers;

use chrono::{Duration, Utc};
use erq_common::models::ValidationStatus;
use erq_recommend::trends::{facility_history, region_statistics};
use erq_recommend::RecommendError;
use helpers::*;
use uuid::Uuid;

#[tokio::test]
async fn test_history_is_newest_first_within_window() {
    let (_dir, pool) = create_test_db().await;
    let id = insert_facility(&pool, "Hôpital Notre-Dame", "06", Some(ORIGIN)).await;
    let now = Utc::now();

    insert_history(&pool, id, "valid", Some(0.9), Some(now - Duration::hours(30)), now - Duration::hours(30)).await;
    insert_history(&pool, id, "valid", Some(1.1), Some(now - Duration::hours(2)), now - Duration::hours(2)).await;
    insert_history(&pool, id, "stale", Some(1.0), Some(now - Duration::hours(5)), now - Duration::hours(1)).await;
    // outside a one-day window
    insert_history(&pool, id, "valid", Some(0.5), Some(now - Duration::days(3)), now - Duration::days(3)).await;

    let entries = facility_history(&pool, id, 1, now).await.unwrap();
    let ratios: Vec<Option<f64>> = entries.iter().map(|e| e.metrics.occupancy_ratio).collect();
    assert_eq!(ratios, vec![Some(1.1), Some(1.0)]);
    assert_eq!(entries[1].status, ValidationStatus::Stale);

    let week = facility_history(&pool, id, 7, now).await.unwrap();
    assert_eq!(week.len(), 4);
    assert_eq!(week.last().unwrap().metrics.occupancy_ratio, Some(0.5));
}

#[tokio::test]
async fn test_history_places_undated_rows_by_recording_time() {
    let (_dir, pool) = create_test_db().await;
    let id = insert_facility(&pool, "Hôpital Saint-Luc", "06", Some(ORIGIN)).await;
    let now = Utc::now();

    insert_history(&pool, id, "valid", Some(0.8), Some(now - Duration::hours(3)), now - Duration::hours(3)).await;
    insert_history(&pool, id, "quarantined", None, None, now - Duration::hours(1)).await;

    let entries = facility_history(&pool, id, 1, now).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].status, ValidationStatus::Quarantined);
    assert!(entries[0].extracted_at.is_none());
}

#[tokio::test]
async fn test_history_of_unknown_facility_is_rejected() {
    let (_dir, pool) = create_test_db().await;
    let unknown = Uuid::new_v4();
    let result = facility_history(&pool, unknown, 7, Utc::now()).await;
    assert!(matches!(
        result,
        Err(RecommendError::Store(erq_common::Error::UnknownFacility(id))) if id == unknown
    ));
}

#[tokio::test]
async fn test_region_statistics_summarize_current_snapshots() {
    let (_dir, pool) = create_test_db().await;
    let a = insert_facility(&pool, "Hôpital A", "06", Some(ORIGIN)).await;
    let b = insert_facility(&pool, "Hôpital B", "06", Some(north_of_origin(2.0))).await;
    insert_facility(&pool, "Hôpital C", "06", None).await;
    let q = insert_facility(&pool, "Hôpital de l'Enfant-Jésus", "03", None).await;

    insert_snapshot(&pool, a, Some(0.5), 4, Utc::now()).await;
    insert_snapshot(&pool, b, Some(1.0), 6, Utc::now()).await;
    insert_snapshot(&pool, q, None, 2, Utc::now()).await;

    let stats = region_statistics(&pool).await.unwrap();
    assert_eq!(stats.len(), erq_common::db::regions::RSS_REGIONS.len());

    let montreal = stats.iter().find(|s| s.code == "06").unwrap();
    assert_eq!(montreal.facilities, 3);
    assert_eq!(montreal.reporting, 2);
    assert!((montreal.mean_occupancy_ratio.unwrap() - 0.75).abs() < 1e-9);
    assert_eq!(montreal.patients_waiting, 10);

    let capitale = stats.iter().find(|s| s.code == "03").unwrap();
    assert_eq!(capitale.facilities, 1);
    assert_eq!(capitale.reporting, 1);
    assert_eq!(capitale.mean_occupancy_ratio, None);
    assert_eq!(capitale.patients_waiting, 2);

    let empty = stats.iter().find(|s| s.code == "01").unwrap();
    assert_eq!(empty.facilities, 0);
    assert_eq!(empty.mean_occupancy_ratio, None);
    assert_eq!(empty.patients_waiting, 0);
}
