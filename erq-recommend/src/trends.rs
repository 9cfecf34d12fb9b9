//! Historical and per-region read queries

use crate::error::RecommendResult;
use chrono::{DateTime, Duration, Utc};
use erq_common::db::facilities::{get_facility, metrics_from_row, parse_uuid};
use erq_common::models::HistoryEntry;
use erq_common::time::{from_db, from_db_opt, to_db};
use erq_common::Error;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Current load of one health region
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionStatistics {
    pub code: String,
    pub name: String,
    pub facilities: i64,
    /// Facilities holding a current snapshot
    pub reporting: i64,
    pub mean_occupancy_ratio: Option<f64>,
    pub patients_waiting: i64,
}

/// History of one facility over the last `days`, newest first
///
/// Quarantined rows without an extraction time are placed by the time they
/// were recorded.
pub async fn facility_history(
    pool: &SqlitePool,
    facility_id: Uuid,
    days: i64,
    now: DateTime<Utc>,
) -> RecommendResult<Vec<HistoryEntry>> {
    if get_facility(pool, facility_id).await?.is_none() {
        return Err(Error::UnknownFacility(facility_id).into());
    }

    let since = to_db(&(now - Duration::days(days.max(0))));
    let rows = sqlx::query(
        r#"
        SELECT facility_id, cycle_id, functional_stretchers, occupied_stretchers,
               patients_over_24h, patients_over_48h, total_patients, patients_waiting,
               stretcher_los_hours, ambulatory_los_hours, hourly_stretcher_los_hours,
               hourly_ambulatory_los_hours, occupancy_ratio,
               extracted_at, source_updated_at, status, reason, recorded_at
        FROM occupancy_history
        WHERE facility_id = ? AND COALESCE(extracted_at, recorded_at) >= ?
        ORDER BY COALESCE(extracted_at, recorded_at) DESC, id DESC
        "#,
    )
    .bind(facility_id.to_string())
    .bind(since)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(history_from_row).collect::<erq_common::Result<Vec<_>>>()?)
}

fn history_from_row(row: &SqliteRow) -> erq_common::Result<HistoryEntry> {
    let facility_id: String = row.get("facility_id");
    let cycle_id: String = row.get("cycle_id");
    let status: String = row.get("status");
    let recorded_at: String = row.get("recorded_at");

    Ok(HistoryEntry {
        facility_id: parse_uuid(&facility_id)?,
        cycle_id: parse_uuid(&cycle_id)?,
        metrics: metrics_from_row(row),
        extracted_at: from_db_opt(row.get("extracted_at"))?,
        source_updated_at: from_db_opt(row.get("source_updated_at"))?,
        status: status.parse()?,
        reason: row.get("reason"),
        recorded_at: from_db(&recorded_at)?,
    })
}

/// Facility count, mean current ratio and waiting patients for every region
pub async fn region_statistics(pool: &SqlitePool) -> RecommendResult<Vec<RegionStatistics>> {
    let rows = sqlx::query(
        r#"
        SELECT r.code, r.name,
               COUNT(f.id) AS facilities,
               COUNT(o.facility_id) AS reporting,
               AVG(o.occupancy_ratio) AS mean_ratio,
               COALESCE(SUM(o.patients_waiting), 0) AS waiting
        FROM regions r
        LEFT JOIN facilities f ON f.region_code = r.code
        LEFT JOIN occupancy_current o ON o.facility_id = f.id
        GROUP BY r.code, r.name
        ORDER BY r.code
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| RegionStatistics {
            code: row.get("code"),
            name: row.get("name"),
            facilities: row.get("facilities"),
            reporting: row.get("reporting"),
            mean_occupancy_ratio: row.get("mean_ratio"),
            patients_waiting: row.get("waiting"),
        })
        .collect())
}
