//! Integration tests for full ingestion cycles against a file source

mod helpers;

use erq_common::events::{ErqEvent, EventBus};
use erq_ingest::models::CycleOutcome;
use erq_ingest::services::facility_directory::backfill_locations;
use erq_ingest::services::{FacilityDirectory, FileFetcher};
use erq_ingest::IngestError;
use helpers::*;
use sqlx::SqlitePool;
use std::sync::Arc;

fn three_rows() -> Vec<FixtureRow> {
    vec![
        FixtureRow::new("Hôpital Notre-Dame", "40", "52").permit("51220983"),
        FixtureRow::new("Hôpital Saint-Luc", "30", "24"),
        FixtureRow::new("Hôpital de Verdun", "20", "20"),
    ]
}

async fn ratio_of(pool: &SqlitePool, installation: &str) -> Option<f64> {
    sqlx::query_scalar(
        "SELECT o.occupancy_ratio FROM occupancy_current o JOIN facilities f ON f.id = o.facility_id \
         WHERE f.installation_name = ?",
    )
    .bind(installation)
    .fetch_one(pool)
    .await
    .unwrap()
}

fn committed(outcome: CycleOutcome) -> erq_ingest::models::CycleReport {
    match outcome {
        CycleOutcome::Committed(report) => report,
        CycleOutcome::Skipped => panic!("cycle unexpectedly skipped"),
    }
}

#[tokio::test]
async fn test_first_cycle_creates_facilities_and_snapshots() {
    let (dir, pool) = create_test_db().await;
    let path = write_extract(dir.path(), "extract.csv", extract_text(&three_rows()).as_bytes());

    let before = chrono::Utc::now();
    let orchestrator = file_orchestrator(&pool, &path);
    let report = committed(orchestrator.run_cycle().await.unwrap());

    let fetched_at = report.fetched_at.expect("fetch time recorded");
    assert!(fetched_at >= before && fetched_at <= chrono::Utc::now());
    assert_eq!(report.rows_parsed, 3);
    assert_eq!(report.rows_valid, 3);
    assert_eq!(report.facilities_created, 3);
    assert_eq!(report.snapshots_written, 3);
    assert_eq!(report.encoding, "UTF-8");

    assert_eq!(count(&pool, "facilities").await, 3);
    assert_eq!(count(&pool, "occupancy_current").await, 3);
    assert_eq!(count(&pool, "occupancy_history").await, 3);
    assert_eq!(ratio_of(&pool, "Hôpital Notre-Dame").await, Some(1.3));

    let status: String = sqlx::query_scalar("SELECT status FROM ingestion_cycles WHERE id = ?")
        .bind(report.cycle_id.to_string())
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(status, "committed");
    assert!(!orchestrator.lease_held().await.unwrap());

    let region: Option<String> = sqlx::query_scalar("SELECT region_code FROM facilities WHERE permit_number = '51220983'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(region.as_deref(), Some("06"));
}

#[tokio::test]
async fn test_next_cycle_reuses_facilities_and_replaces_snapshots() {
    let (dir, pool) = create_test_db().await;
    let first = write_extract(dir.path(), "first.csv", extract_text(&three_rows()).as_bytes());
    committed(file_orchestrator(&pool, &first).run_cycle().await.unwrap());

    let later: Vec<FixtureRow> = vec![
        FixtureRow::new("Hôpital Notre-Dame", "40", "60").at("15:00", "2024-03-09 15:05"),
        FixtureRow::new("HOPITAL SAINT LUC", "30", "15").at("15:00", "2024-03-09 15:05"),
    ];
    let second = write_extract(dir.path(), "second.csv", extract_text(&later).as_bytes());
    let report = committed(file_orchestrator(&pool, &second).run_cycle().await.unwrap());

    assert_eq!(report.facilities_created, 0);
    assert_eq!(count(&pool, "facilities").await, 3);
    assert_eq!(count(&pool, "occupancy_history").await, 5);
    assert_eq!(ratio_of(&pool, "Hôpital Notre-Dame").await, Some(1.5));
    assert_eq!(ratio_of(&pool, "Hôpital Saint-Luc").await, Some(0.5));
    assert_eq!(ratio_of(&pool, "Hôpital de Verdun").await, Some(1.0));
}

#[tokio::test]
async fn test_older_extraction_is_stale_and_keeps_snapshot() {
    let (dir, pool) = create_test_db().await;
    let first = write_extract(dir.path(), "first.csv", extract_text(&three_rows()).as_bytes());
    committed(file_orchestrator(&pool, &first).run_cycle().await.unwrap());

    let older = vec![FixtureRow::new("Hôpital Notre-Dame", "40", "10").at("12:00", "2024-03-09 12:05")];
    let second = write_extract(dir.path(), "older.csv", extract_text(&older).as_bytes());
    let report = committed(file_orchestrator(&pool, &second).run_cycle().await.unwrap());

    assert_eq!(report.rows_stale, 1);
    assert_eq!(report.snapshots_written, 0);
    assert_eq!(ratio_of(&pool, "Hôpital Notre-Dame").await, Some(1.3));
    assert_eq!(count(&pool, "occupancy_history").await, 4);
    assert!(anomaly_reasons(&pool).await.contains(&"stale_extraction".to_string()));

    let stale: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM occupancy_history WHERE status = 'stale'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(stale, 1);
}

#[tokio::test]
async fn test_equal_extraction_time_is_accepted() {
    let (dir, pool) = create_test_db().await;
    let first = write_extract(dir.path(), "first.csv", extract_text(&three_rows()).as_bytes());
    committed(file_orchestrator(&pool, &first).run_cycle().await.unwrap());

    let same_time = vec![FixtureRow::new("Hôpital Notre-Dame", "40", "20")];
    let second = write_extract(dir.path(), "same.csv", extract_text(&same_time).as_bytes());
    let report = committed(file_orchestrator(&pool, &second).run_cycle().await.unwrap());

    assert_eq!(report.rows_valid, 1);
    assert_eq!(ratio_of(&pool, "Hôpital Notre-Dame").await, Some(0.5));
}

#[tokio::test]
async fn test_invalid_row_is_historized_but_not_snapshotted() {
    let (dir, pool) = create_test_db().await;
    let rows = vec![
        FixtureRow::new("Hôpital Notre-Dame", "40", "52"),
        FixtureRow::new("Hôpital Saint-Luc", "30", "-4"),
        FixtureRow::new("Hôpital de Verdun", "10", "45"),
    ];
    let path = write_extract(dir.path(), "extract.csv", extract_text(&rows).as_bytes());
    let report = committed(file_orchestrator(&pool, &path).run_cycle().await.unwrap());

    assert_eq!(report.rows_parsed, 3);
    assert_eq!(report.rows_valid, 1);
    assert_eq!(report.rows_quarantined, 2);
    assert_eq!(count(&pool, "occupancy_current").await, 1);
    assert_eq!(count(&pool, "occupancy_history").await, 3);

    let reasons = anomaly_reasons(&pool).await;
    assert!(reasons.contains(&"negative_count".to_string()));
    assert!(reasons.contains(&"ratio_out_of_range".to_string()));

    let details: Vec<Option<String>> =
        sqlx::query_scalar("SELECT detail FROM ingestion_anomalies WHERE reason = 'negative_count'")
            .fetch_all(&pool)
            .await
            .unwrap();
    assert!(details[0].as_deref().unwrap_or_default().starts_with("validation_failure: "));
}

#[tokio::test]
async fn test_mojibake_extract_matches_existing_facilities() {
    let (dir, pool) = create_test_db().await;
    let first = write_extract(dir.path(), "first.csv", extract_text(&three_rows()).as_bytes());
    committed(file_orchestrator(&pool, &first).run_cycle().await.unwrap());

    let later: Vec<FixtureRow> = three_rows()
        .into_iter()
        .map(|r| r.at("15:00", "2024-03-09 15:05"))
        .collect();
    let garbled = mojibake(&extract_text(&later));
    assert!(garbled.contains("HÃ´pital"));
    let second = write_extract(dir.path(), "garbled.csv", garbled.as_bytes());

    let report = committed(file_orchestrator(&pool, &second).run_cycle().await.unwrap());
    assert_eq!(report.facilities_created, 0);
    assert_eq!(report.rows_valid, 3);
    assert!(report.fields_repaired >= 6);
    assert_eq!(count(&pool, "facilities").await, 3);

    let names: Vec<String> = sqlx::query_scalar("SELECT establishment_name FROM facilities")
        .fetch_all(&pool)
        .await
        .unwrap();
    assert!(names.iter().all(|n| n == "CIUSSS du Centre-Sud-de-l'Île-de-Montréal"));
}

#[tokio::test]
async fn test_windows_1252_extract_is_decoded() {
    let (dir, pool) = create_test_db().await;
    // è and à have no windows-1250 counterpart at the same byte
    let mut rows = three_rows();
    rows.push(FixtureRow::new("Hôpital Sainte-Thérèse", "10", "9"));
    rows.push(FixtureRow::new("Pavillon Saint-François à Laval", "8", "4"));
    let text = extract_text(&rows);
    let (bytes, _, unmappable) = encoding_rs::WINDOWS_1252.encode(&text);
    assert!(!unmappable);
    let path = write_extract(dir.path(), "cp1252.csv", &bytes);

    let report = committed(file_orchestrator(&pool, &path).run_cycle().await.unwrap());
    assert_eq!(report.encoding, "windows-1252");
    assert_eq!(report.rows_valid, 5);
    assert_eq!(ratio_of(&pool, "Hôpital Saint-Luc").await, Some(0.8));
    assert_eq!(ratio_of(&pool, "Hôpital Sainte-Thérèse").await, Some(0.9));
    assert_eq!(ratio_of(&pool, "Pavillon Saint-François à Laval").await, Some(0.5));
}

#[tokio::test]
async fn test_extract_without_rows_is_source_unavailable() {
    let (dir, pool) = create_test_db().await;
    let first = write_extract(dir.path(), "first.csv", extract_text(&three_rows()).as_bytes());
    committed(file_orchestrator(&pool, &first).run_cycle().await.unwrap());

    let empty = write_extract(dir.path(), "empty.csv", format!("{HEADER}\n").as_bytes());
    let orchestrator = file_orchestrator(&pool, &empty);
    let err = orchestrator.run_cycle().await.unwrap_err();
    assert!(matches!(err, IngestError::SourceUnavailable(_)));

    // previous snapshot survives
    assert_eq!(count(&pool, "occupancy_current").await, 3);
    assert_eq!(ratio_of(&pool, "Hôpital Notre-Dame").await, Some(1.3));
    assert!(!orchestrator.lease_held().await.unwrap());

    let failed: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ingestion_cycles WHERE status = 'failed'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(failed, 1);
}

#[tokio::test]
async fn test_missing_source_file_is_source_unavailable() {
    let (dir, pool) = create_test_db().await;
    let orchestrator = file_orchestrator(&pool, &dir.path().join("absent.csv"));
    assert!(matches!(
        orchestrator.run_cycle().await,
        Err(IngestError::SourceUnavailable(_))
    ));
    assert!(!orchestrator.lease_held().await.unwrap());
}

#[tokio::test]
async fn test_unparseable_records_are_rejected_not_parsed() {
    let (dir, pool) = create_test_db().await;
    let mut text = extract_text(&three_rows());
    text.push_str("06;;CIUSSS;Hôpital tronqué\n");
    text.push_str("06;;;;;10;5;;14:00;2024-03-09 14:05\n");
    let path = write_extract(dir.path(), "extract.csv", text.as_bytes());

    let report = committed(file_orchestrator(&pool, &path).run_cycle().await.unwrap());
    assert_eq!(report.rows_parsed, 3);
    assert_eq!(report.rows_rejected, 2);
    assert_eq!(count(&pool, "occupancy_history").await, 3);

    let reasons = anomaly_reasons(&pool).await;
    assert!(reasons.contains(&"truncated_row".to_string()));
    assert!(reasons.contains(&"missing_identity".to_string()));
}

#[tokio::test]
async fn test_latest_row_of_a_facility_wins_within_cycle() {
    let (dir, pool) = create_test_db().await;
    let rows = vec![
        FixtureRow::new("Hôpital Notre-Dame", "40", "60").at("15:00", "2024-03-09 15:05"),
        FixtureRow::new("Hôpital Notre-Dame", "40", "20").at("14:00", "2024-03-09 14:05"),
    ];
    let path = write_extract(dir.path(), "dup.csv", extract_text(&rows).as_bytes());
    let report = committed(file_orchestrator(&pool, &path).run_cycle().await.unwrap());

    assert_eq!(report.rows_valid, 2);
    assert_eq!(report.snapshots_written, 1);
    assert_eq!(count(&pool, "facilities").await, 1);
    assert_eq!(count(&pool, "occupancy_history").await, 2);
    assert_eq!(ratio_of(&pool, "Hôpital Notre-Dame").await, Some(1.5));
    assert!(anomaly_reasons(&pool).await.contains(&"superseded_in_cycle".to_string()));
}

#[tokio::test]
async fn test_permit_match_records_rename() {
    let (dir, pool) = create_test_db().await;
    let first = write_extract(dir.path(), "first.csv", extract_text(&three_rows()).as_bytes());
    committed(file_orchestrator(&pool, &first).run_cycle().await.unwrap());

    let renamed = vec![FixtureRow::new("Hôpital Notre-Dame du CHUM", "40", "40")
        .permit("51220983")
        .at("15:00", "2024-03-09 15:05")];
    let second = write_extract(dir.path(), "renamed.csv", extract_text(&renamed).as_bytes());
    let report = committed(file_orchestrator(&pool, &second).run_cycle().await.unwrap());

    assert_eq!(report.facilities_created, 0);
    assert_eq!(report.facilities_updated, 1);
    assert!(anomaly_reasons(&pool).await.contains(&"facility_renamed".to_string()));
    assert_eq!(ratio_of(&pool, "Hôpital Notre-Dame du CHUM").await, Some(1.0));
}

#[tokio::test]
async fn test_cycle_events_are_emitted() {
    let (dir, pool) = create_test_db().await;
    let path = write_extract(dir.path(), "extract.csv", extract_text(&three_rows()).as_bytes());

    let bus = EventBus::new(16);
    let mut rx = bus.subscribe();
    let orchestrator = orchestrator_with(&pool, Arc::new(FileFetcher::new(&path)), bus);
    committed(orchestrator.run_cycle().await.unwrap());

    assert!(matches!(rx.recv().await.unwrap(), ErqEvent::CycleStarted { .. }));
    match rx.recv().await.unwrap() {
        ErqEvent::CycleCommitted { rows_parsed, rows_valid, .. } => {
            assert_eq!(rows_parsed, 3);
            assert_eq!(rows_valid, 3);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

const DIRECTORY: &str = "facility_name,street_no,street_name,postal_code,city,province,latitude,longitude\n\
    Hôpital Notre-Dame,1560,rue Sherbrooke Est,H2L 4M1,Montréal,QC,45.5254,-73.5613\n\
    Hôpital de Verdun,4000,boulevard LaSalle,H4G 2A3,Montréal,QC,45.4640,-73.5680\n";

async fn located(pool: &SqlitePool) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM facilities WHERE latitude IS NOT NULL")
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_new_facilities_take_directory_location() {
    let (dir, pool) = create_test_db().await;
    let path = write_extract(dir.path(), "extract.csv", extract_text(&three_rows()).as_bytes());
    let directory = FacilityDirectory::from_reader(DIRECTORY.as_bytes()).unwrap();

    let orchestrator = file_orchestrator(&pool, &path).with_directory(Some(Arc::new(directory)));
    committed(orchestrator.run_cycle().await.unwrap());

    assert_eq!(located(&pool).await, 2);
    let city: Option<String> =
        sqlx::query_scalar("SELECT city FROM facilities WHERE installation_name = 'Hôpital de Verdun'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(city.as_deref(), Some("Montréal"));
}

#[tokio::test]
async fn test_backfill_locates_facilities_created_without_directory() {
    let (dir, pool) = create_test_db().await;
    let path = write_extract(dir.path(), "extract.csv", extract_text(&three_rows()).as_bytes());
    committed(file_orchestrator(&pool, &path).run_cycle().await.unwrap());
    assert_eq!(located(&pool).await, 0);

    let directory = FacilityDirectory::from_reader(DIRECTORY.as_bytes()).unwrap();
    let updated = backfill_locations(&pool, &directory).await.unwrap();
    assert_eq!(updated, 2);
    assert_eq!(located(&pool).await, 2);

    // nothing left to locate for entries the directory knows
    assert_eq!(backfill_locations(&pool, &directory).await.unwrap(), 0);
}
