//! Facility and occupancy row mapping shared by both services

use crate::geo::GeoPoint;
use crate::models::{Facility, OccupancyMetrics};
use crate::time::from_db;
use crate::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Column list matching `facility_from_row`
pub const FACILITY_COLUMNS: &str = "f.id, f.source_id, f.permit_number, f.establishment_name, \
    f.establishment_key, f.installation_name, f.installation_key, f.address, f.city, \
    f.postal_code, f.province, f.region_code, f.latitude, f.longitude, f.updated_at";

/// Column list matching `metrics_from_row`
pub const METRIC_SELECT: &str = "o.functional_stretchers, o.occupied_stretchers, \
    o.patients_over_24h, o.patients_over_48h, o.total_patients, o.patients_waiting, \
    o.stretcher_los_hours, o.ambulatory_los_hours, o.hourly_stretcher_los_hours, \
    o.hourly_ambulatory_los_hours, o.occupancy_ratio";

pub fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| Error::CorruptRecord(format!("Invalid UUID '{}': {}", value, e)))
}

pub fn facility_from_row(row: &SqliteRow) -> Result<Facility> {
    let id: String = row.get("id");
    let updated_at: String = row.get("updated_at");

    Ok(Facility {
        id: parse_uuid(&id)?,
        source_id: row.get("source_id"),
        permit_number: row.get("permit_number"),
        establishment_name: row.get("establishment_name"),
        establishment_key: row.get("establishment_key"),
        installation_name: row.get("installation_name"),
        installation_key: row.get("installation_key"),
        address: row.get("address"),
        city: row.get("city"),
        postal_code: row.get("postal_code"),
        province: row.get("province"),
        region_code: row.get("region_code"),
        location: GeoPoint::from_parts(row.get("latitude"), row.get("longitude")),
        updated_at: from_db(&updated_at)?,
    })
}

pub fn metrics_from_row(row: &SqliteRow) -> OccupancyMetrics {
    OccupancyMetrics {
        functional_stretchers: row.get("functional_stretchers"),
        occupied_stretchers: row.get("occupied_stretchers"),
        patients_over_24h: row.get("patients_over_24h"),
        patients_over_48h: row.get("patients_over_48h"),
        total_patients: row.get("total_patients"),
        patients_waiting: row.get("patients_waiting"),
        stretcher_los_hours: row.get("stretcher_los_hours"),
        ambulatory_los_hours: row.get("ambulatory_los_hours"),
        hourly_stretcher_los_hours: row.get("hourly_stretcher_los_hours"),
        hourly_ambulatory_los_hours: row.get("hourly_ambulatory_los_hours"),
        occupancy_ratio: row.get("occupancy_ratio"),
    }
}

pub async fn load_facilities(pool: &SqlitePool) -> Result<Vec<Facility>> {
    let sql = format!("SELECT {FACILITY_COLUMNS} FROM facilities f ORDER BY f.id");
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    rows.iter().map(facility_from_row).collect()
}

pub async fn get_facility(pool: &SqlitePool, id: Uuid) -> Result<Option<Facility>> {
    let sql = format!("SELECT {FACILITY_COLUMNS} FROM facilities f WHERE f.id = ?");
    let row = sqlx::query(&sql)
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(facility_from_row).transpose()
}

/// Facilities still missing coordinates
pub async fn facilities_without_location(pool: &SqlitePool) -> Result<Vec<Facility>> {
    let sql = format!("SELECT {FACILITY_COLUMNS} FROM facilities f WHERE f.latitude IS NULL ORDER BY f.id");
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    rows.iter().map(facility_from_row).collect()
}

/// Set address fields and coordinates on an existing facility
pub async fn update_facility_location(
    pool: &SqlitePool,
    id: Uuid,
    location: GeoPoint,
    address: Option<&str>,
    city: Option<&str>,
    postal_code: Option<&str>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE facilities
        SET latitude = ?, longitude = ?,
            address = COALESCE(address, ?),
            city = COALESCE(city, ?),
            postal_code = COALESCE(postal_code, ?),
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(location.latitude)
    .bind(location.longitude)
    .bind(address)
    .bind(city)
    .bind(postal_code)
    .bind(crate::time::to_db(&crate::time::now()))
    .bind(id.to_string())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}
