//! Database initialization
//!
//! Opens (creating on first run) the SQLite database and applies the schema.
//! Every statement is `CREATE ... IF NOT EXISTS`, so initialization is
//! idempotent and runs at each service startup.

use crate::{Error, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Current schema revision recorded in `schema_version`
pub const SCHEMA_VERSION: i64 = 1;

/// Columns shared by `occupancy_current` and `occupancy_history`
const METRIC_COLUMNS: &str = "
    functional_stretchers INTEGER,
    occupied_stretchers INTEGER,
    patients_over_24h INTEGER,
    patients_over_48h INTEGER,
    total_patients INTEGER,
    patients_waiting INTEGER,
    stretcher_los_hours REAL,
    ambulatory_los_hours REAL,
    hourly_stretcher_los_hours REAL,
    hourly_ambulatory_los_hours REAL,
    occupancy_ratio REAL";

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    // Pragmas go on the connect options so every pooled connection gets them
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))
        .map_err(|e| Error::InvalidConfig(format!("Invalid database path {}: {}", db_path.display(), e)))?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_millis(5000));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .min_connections(1)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    create_schema(&pool).await?;
    Ok(pool)
}

/// Apply every table and index (idempotent)
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_schema_version_table(pool).await?;
    create_regions_table(pool).await?;
    create_facilities_table(pool).await?;
    create_occupancy_current_table(pool).await?;
    create_occupancy_history_table(pool).await?;
    create_ingestion_anomalies_table(pool).await?;
    create_ingestion_cycles_table(pool).await?;
    create_ingestion_leases_table(pool).await?;
    Ok(())
}

pub async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (?, ?)")
        .bind(SCHEMA_VERSION)
        .bind(crate::time::to_db(&crate::time::now()))
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn create_regions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS regions (
            code TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            name_key TEXT NOT NULL UNIQUE,
            boundary_geojson TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn create_facilities_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS facilities (
            id TEXT PRIMARY KEY,
            source_id TEXT UNIQUE,
            permit_number TEXT,
            establishment_name TEXT NOT NULL,
            establishment_key TEXT NOT NULL,
            installation_name TEXT,
            installation_key TEXT,
            address TEXT,
            city TEXT,
            postal_code TEXT,
            province TEXT,
            region_code TEXT REFERENCES regions(code),
            latitude REAL,
            longitude REAL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            CHECK ((latitude IS NULL) = (longitude IS NULL))
        )
        "#,
    )
    .execute(pool)
    .await?;

    for stmt in [
        "CREATE INDEX IF NOT EXISTS idx_facilities_permit ON facilities(permit_number)",
        "CREATE INDEX IF NOT EXISTS idx_facilities_installation_key ON facilities(installation_key)",
        "CREATE INDEX IF NOT EXISTS idx_facilities_establishment_key ON facilities(establishment_key)",
        "CREATE INDEX IF NOT EXISTS idx_facilities_location ON facilities(latitude, longitude)",
    ] {
        sqlx::query(stmt).execute(pool).await?;
    }
    Ok(())
}

pub async fn create_occupancy_current_table(pool: &SqlitePool) -> Result<()> {
    let sql = format!(
        r#"
        CREATE TABLE IF NOT EXISTS occupancy_current (
            facility_id TEXT PRIMARY KEY REFERENCES facilities(id) ON DELETE CASCADE,
            cycle_id TEXT NOT NULL,
            {METRIC_COLUMNS},
            extracted_at TEXT NOT NULL,
            source_updated_at TEXT,
            updated_at TEXT NOT NULL
        )
        "#
    );
    sqlx::query(&sql).execute(pool).await?;
    Ok(())
}

pub async fn create_occupancy_history_table(pool: &SqlitePool) -> Result<()> {
    let sql = format!(
        r#"
        CREATE TABLE IF NOT EXISTS occupancy_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            facility_id TEXT NOT NULL REFERENCES facilities(id),
            cycle_id TEXT NOT NULL,
            {METRIC_COLUMNS},
            extracted_at TEXT,
            source_updated_at TEXT,
            status TEXT NOT NULL CHECK (status IN ('valid', 'quarantined', 'stale')),
            reason TEXT,
            recorded_at TEXT NOT NULL
        )
        "#
    );
    sqlx::query(&sql).execute(pool).await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_history_facility_time ON occupancy_history(facility_id, extracted_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_history_cycle ON occupancy_history(cycle_id)")
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn create_ingestion_anomalies_table(pool: &SqlitePool) -> Result<()> {
    // facility_id carries no foreign key: anomalies survive a failed commit
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ingestion_anomalies (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            cycle_id TEXT NOT NULL,
            recorded_at TEXT NOT NULL,
            raw_excerpt TEXT NOT NULL,
            facility_id TEXT,
            reason TEXT NOT NULL,
            severity TEXT NOT NULL CHECK (severity IN ('info', 'warning', 'error')),
            detail TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_anomalies_cycle ON ingestion_anomalies(cycle_id)")
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn create_ingestion_cycles_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ingestion_cycles (
            id TEXT PRIMARY KEY,
            source TEXT NOT NULL,
            location TEXT NOT NULL,
            checksum TEXT,
            encoding TEXT,
            encoding_confidence REAL,
            started_at TEXT NOT NULL,
            finished_at TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('committed', 'provenance_only', 'failed')),
            rows_parsed INTEGER NOT NULL DEFAULT 0,
            rows_valid INTEGER NOT NULL DEFAULT 0,
            rows_quarantined INTEGER NOT NULL DEFAULT 0,
            rows_stale INTEGER NOT NULL DEFAULT 0,
            rows_rejected INTEGER NOT NULL DEFAULT 0,
            facilities_created INTEGER NOT NULL DEFAULT 0,
            error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn create_ingestion_leases_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ingestion_leases (
            source TEXT PRIMARY KEY,
            holder TEXT NOT NULL,
            acquired_at TEXT NOT NULL,
            expires_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}
