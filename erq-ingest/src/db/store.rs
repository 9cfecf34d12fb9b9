//! SQLite-backed ingestion store
//!
//! The snapshot transaction is the only place the current occupancy table is
//! written. Anomalies and cycle records use their own short transactions so
//! that they persist whatever happened to the snapshot commit.

use crate::error::{IngestError, IngestResult};
use crate::models::{CycleCommit, FacilityUpdate};
use crate::services::facility_registry::FacilityRegistry;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use erq_common::db::facilities::{load_facilities, parse_uuid};
use erq_common::db::regions::load_regions;
use erq_common::models::{CycleRecord, Facility, HistoryEntry, IngestionAnomaly, OccupancyMetrics, OccupancySnapshot};
use erq_common::time::{from_db, to_db};
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::query::Query;
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool};
use std::collections::HashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Holder of a source lease
#[derive(Debug, Clone, PartialEq)]
pub struct IngestionLease {
    pub source: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IngestionLease {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Persistence used by the orchestrator
#[async_trait]
pub trait IngestStore: Send + Sync {
    /// Take the source lease unless an unexpired one is held; true when taken
    async fn acquire_lease(&self, source: &str, holder: &str, ttl: Duration) -> IngestResult<bool>;

    /// Drop the lease if `holder` still owns it
    async fn release_lease(&self, source: &str, holder: &str) -> IngestResult<()>;

    async fn lease(&self, source: &str) -> IngestResult<Option<IngestionLease>>;

    async fn load_registry(&self) -> IngestResult<FacilityRegistry>;

    /// Facilities, history and snapshots in one transaction
    async fn commit_cycle(&self, commit: &CycleCommit) -> IngestResult<()>;

    /// Facilities and history only, after a failed snapshot commit
    async fn commit_provenance(&self, commit: &CycleCommit) -> IngestResult<()>;

    async fn append_anomalies(&self, anomalies: &[IngestionAnomaly]) -> IngestResult<()>;

    async fn record_cycle(&self, record: &CycleRecord) -> IngestResult<()>;
}

#[derive(Clone)]
pub struct SqliteIngestStore {
    pool: SqlitePool,
}

impl SqliteIngestStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Anomalies of one cycle in insertion order
    pub async fn anomalies_for_cycle(&self, cycle_id: Uuid) -> IngestResult<Vec<IngestionAnomaly>> {
        let rows = sqlx::query(
            r#"
            SELECT cycle_id, recorded_at, raw_excerpt, facility_id, reason, severity, detail
            FROM ingestion_anomalies
            WHERE cycle_id = ?
            ORDER BY id
            "#,
        )
        .bind(cycle_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(anomaly_from_row).collect()
    }

    /// Most recent cycles, newest first
    pub async fn recent_cycles(&self, source: &str, limit: i64) -> IngestResult<Vec<CycleRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, source, location, checksum, encoding, encoding_confidence, started_at,
                   finished_at, status, rows_parsed, rows_valid, rows_quarantined, rows_stale,
                   rows_rejected, facilities_created, error
            FROM ingestion_cycles
            WHERE source = ?
            ORDER BY started_at DESC
            LIMIT ?
            "#,
        )
        .bind(source)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(cycle_from_row).collect()
    }
}

#[async_trait]
impl IngestStore for SqliteIngestStore {
    async fn acquire_lease(&self, source: &str, holder: &str, ttl: Duration) -> IngestResult<bool> {
        let now = Utc::now();
        let now_text = to_db(&now);
        // one statement: insert, or take over only an expired lease
        let result = sqlx::query(
            r#"
            INSERT INTO ingestion_leases (source, holder, acquired_at, expires_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(source) DO UPDATE SET
                holder = excluded.holder,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
            WHERE ingestion_leases.expires_at <= ?
            "#,
        )
        .bind(source)
        .bind(holder)
        .bind(&now_text)
        .bind(to_db(&(now + ttl)))
        .bind(&now_text)
        .execute(&self.pool)
        .await?;

        let acquired = result.rows_affected() == 1;
        debug!(source, holder, acquired, "Lease acquisition");
        Ok(acquired)
    }

    async fn release_lease(&self, source: &str, holder: &str) -> IngestResult<()> {
        let result = sqlx::query("DELETE FROM ingestion_leases WHERE source = ? AND holder = ?")
            .bind(source)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            warn!(source, holder, "Lease was no longer held at release");
        }
        Ok(())
    }

    async fn lease(&self, source: &str) -> IngestResult<Option<IngestionLease>> {
        let row = sqlx::query("SELECT source, holder, acquired_at, expires_at FROM ingestion_leases WHERE source = ?")
            .bind(source)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let acquired_at: String = row.get("acquired_at");
        let expires_at: String = row.get("expires_at");
        Ok(Some(IngestionLease {
            source: row.get("source"),
            holder: row.get("holder"),
            acquired_at: from_db(&acquired_at)?,
            expires_at: from_db(&expires_at)?,
        }))
    }

    async fn load_registry(&self) -> IngestResult<FacilityRegistry> {
        let regions = load_regions(&self.pool).await?;
        let facilities = load_facilities(&self.pool).await?;

        let rows = sqlx::query("SELECT facility_id, extracted_at FROM occupancy_current")
            .fetch_all(&self.pool)
            .await?;
        let mut last_extracted = HashMap::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("facility_id");
            let extracted_at: String = row.get("extracted_at");
            last_extracted.insert(parse_uuid(&id)?, from_db(&extracted_at)?);
        }

        debug!(
            regions = regions.len(),
            facilities = facilities.len(),
            snapshots = last_extracted.len(),
            "Loaded facility registry"
        );
        Ok(FacilityRegistry::new(regions, facilities, last_extracted))
    }

    async fn commit_cycle(&self, commit: &CycleCommit) -> IngestResult<()> {
        write_commit(&self.pool, commit, true)
            .await
            .map_err(|e| IngestError::CommitFailure(e.to_string()))?;
        info!(
            cycle_id = %commit.cycle_id,
            facilities_created = commit.new_facilities.len(),
            history = commit.history.len(),
            snapshots = commit.snapshots.len(),
            "Committed cycle"
        );
        Ok(())
    }

    async fn commit_provenance(&self, commit: &CycleCommit) -> IngestResult<()> {
        write_commit(&self.pool, commit, false)
            .await
            .map_err(|e| IngestError::CommitFailure(e.to_string()))?;
        info!(cycle_id = %commit.cycle_id, history = commit.history.len(), "Committed provenance only");
        Ok(())
    }

    async fn append_anomalies(&self, anomalies: &[IngestionAnomaly]) -> IngestResult<()> {
        if anomalies.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for anomaly in anomalies {
            sqlx::query(
                r#"
                INSERT INTO ingestion_anomalies
                    (cycle_id, recorded_at, raw_excerpt, facility_id, reason, severity, detail)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(anomaly.cycle_id.to_string())
            .bind(to_db(&anomaly.recorded_at))
            .bind(&anomaly.raw_excerpt)
            .bind(anomaly.facility_id.map(|id| id.to_string()))
            .bind(&anomaly.reason)
            .bind(anomaly.severity.as_str())
            .bind(&anomaly.detail)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(count = anomalies.len(), "Persisted anomalies");
        Ok(())
    }

    async fn record_cycle(&self, record: &CycleRecord) -> IngestResult<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO ingestion_cycles
                (id, source, location, checksum, encoding, encoding_confidence, started_at,
                 finished_at, status, rows_parsed, rows_valid, rows_quarantined, rows_stale,
                 rows_rejected, facilities_created, error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.to_string())
        .bind(&record.source)
        .bind(&record.location)
        .bind(&record.checksum)
        .bind(&record.encoding)
        .bind(record.encoding_confidence)
        .bind(to_db(&record.started_at))
        .bind(to_db(&record.finished_at))
        .bind(record.status.as_str())
        .bind(record.rows_parsed as i64)
        .bind(record.rows_valid as i64)
        .bind(record.rows_quarantined as i64)
        .bind(record.rows_stale as i64)
        .bind(record.rows_rejected as i64)
        .bind(record.facilities_created as i64)
        .bind(&record.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

async fn write_commit(pool: &SqlitePool, commit: &CycleCommit, with_snapshots: bool) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    for facility in &commit.new_facilities {
        insert_facility(&mut tx, facility).await?;
    }
    for update in &commit.facility_updates {
        update_facility(&mut tx, update).await?;
    }
    for entry in &commit.history {
        insert_history(&mut tx, entry).await?;
    }
    if with_snapshots {
        for snapshot in &commit.snapshots {
            upsert_snapshot(&mut tx, snapshot).await?;
        }
    }

    tx.commit().await
}

async fn insert_facility(conn: &mut SqliteConnection, facility: &Facility) -> Result<(), sqlx::Error> {
    let now = to_db(&Utc::now());
    sqlx::query(
        r#"
        INSERT INTO facilities
            (id, source_id, permit_number, establishment_name, establishment_key,
             installation_name, installation_key, address, city, postal_code, province,
             region_code, latitude, longitude, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(facility.id.to_string())
    .bind(&facility.source_id)
    .bind(&facility.permit_number)
    .bind(&facility.establishment_name)
    .bind(&facility.establishment_key)
    .bind(&facility.installation_name)
    .bind(&facility.installation_key)
    .bind(&facility.address)
    .bind(&facility.city)
    .bind(&facility.postal_code)
    .bind(&facility.province)
    .bind(&facility.region_code)
    .bind(facility.location.map(|p| p.latitude))
    .bind(facility.location.map(|p| p.longitude))
    .bind(&now)
    .bind(&now)
    .execute(conn)
    .await?;
    Ok(())
}

async fn update_facility(conn: &mut SqliteConnection, update: &FacilityUpdate) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE facilities
        SET establishment_name = ?, establishment_key = ?, installation_name = ?,
            installation_key = ?, region_code = ?, source_id = ?, permit_number = ?,
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&update.establishment_name)
    .bind(&update.establishment_key)
    .bind(&update.installation_name)
    .bind(&update.installation_key)
    .bind(&update.region_code)
    .bind(&update.source_id)
    .bind(&update.permit_number)
    .bind(to_db(&Utc::now()))
    .bind(update.facility_id.to_string())
    .execute(conn)
    .await?;
    Ok(())
}

fn bind_metrics<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    m: &OccupancyMetrics,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    query
        .bind(m.functional_stretchers)
        .bind(m.occupied_stretchers)
        .bind(m.patients_over_24h)
        .bind(m.patients_over_48h)
        .bind(m.total_patients)
        .bind(m.patients_waiting)
        .bind(m.stretcher_los_hours)
        .bind(m.ambulatory_los_hours)
        .bind(m.hourly_stretcher_los_hours)
        .bind(m.hourly_ambulatory_los_hours)
        .bind(m.occupancy_ratio)
}

async fn insert_history(conn: &mut SqliteConnection, entry: &HistoryEntry) -> Result<(), sqlx::Error> {
    let query = sqlx::query(
        r#"
        INSERT INTO occupancy_history
            (facility_id, cycle_id,
             functional_stretchers, occupied_stretchers, patients_over_24h, patients_over_48h,
             total_patients, patients_waiting, stretcher_los_hours, ambulatory_los_hours,
             hourly_stretcher_los_hours, hourly_ambulatory_los_hours, occupancy_ratio,
             extracted_at, source_updated_at, status, reason, recorded_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(entry.facility_id.to_string())
    .bind(entry.cycle_id.to_string());

    bind_metrics(query, &entry.metrics)
        .bind(entry.extracted_at.as_ref().map(to_db))
        .bind(entry.source_updated_at.as_ref().map(to_db))
        .bind(entry.status.as_str())
        .bind(&entry.reason)
        .bind(to_db(&entry.recorded_at))
        .execute(conn)
        .await?;
    Ok(())
}

async fn upsert_snapshot(conn: &mut SqliteConnection, snapshot: &OccupancySnapshot) -> Result<(), sqlx::Error> {
    let query = sqlx::query(
        r#"
        INSERT INTO occupancy_current
            (facility_id, cycle_id,
             functional_stretchers, occupied_stretchers, patients_over_24h, patients_over_48h,
             total_patients, patients_waiting, stretcher_los_hours, ambulatory_los_hours,
             hourly_stretcher_los_hours, hourly_ambulatory_los_hours, occupancy_ratio,
             extracted_at, source_updated_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(facility_id) DO UPDATE SET
            cycle_id = excluded.cycle_id,
            functional_stretchers = excluded.functional_stretchers,
            occupied_stretchers = excluded.occupied_stretchers,
            patients_over_24h = excluded.patients_over_24h,
            patients_over_48h = excluded.patients_over_48h,
            total_patients = excluded.total_patients,
            patients_waiting = excluded.patients_waiting,
            stretcher_los_hours = excluded.stretcher_los_hours,
            ambulatory_los_hours = excluded.ambulatory_los_hours,
            hourly_stretcher_los_hours = excluded.hourly_stretcher_los_hours,
            hourly_ambulatory_los_hours = excluded.hourly_ambulatory_los_hours,
            occupancy_ratio = excluded.occupancy_ratio,
            extracted_at = excluded.extracted_at,
            source_updated_at = excluded.source_updated_at,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(snapshot.facility_id.to_string())
    .bind(snapshot.cycle_id.to_string());

    bind_metrics(query, &snapshot.metrics)
        .bind(to_db(&snapshot.extracted_at))
        .bind(snapshot.source_updated_at.as_ref().map(to_db))
        .bind(to_db(&Utc::now()))
        .execute(conn)
        .await?;
    Ok(())
}

fn anomaly_from_row(row: &SqliteRow) -> IngestResult<IngestionAnomaly> {
    let cycle_id: String = row.get("cycle_id");
    let recorded_at: String = row.get("recorded_at");
    let facility_id: Option<String> = row.get("facility_id");
    let severity: String = row.get("severity");
    Ok(IngestionAnomaly {
        cycle_id: parse_uuid(&cycle_id)?,
        recorded_at: from_db(&recorded_at)?,
        raw_excerpt: row.get("raw_excerpt"),
        facility_id: facility_id.as_deref().map(parse_uuid).transpose()?,
        reason: row.get("reason"),
        severity: severity.parse()?,
        detail: row.get("detail"),
    })
}

fn cycle_from_row(row: &SqliteRow) -> IngestResult<CycleRecord> {
    let id: String = row.get("id");
    let started_at: String = row.get("started_at");
    let finished_at: String = row.get("finished_at");
    let status: String = row.get("status");
    let count = |name: &str| -> usize { row.get::<i64, _>(name).max(0) as usize };
    Ok(CycleRecord {
        id: parse_uuid(&id)?,
        source: row.get("source"),
        location: row.get("location"),
        checksum: row.get("checksum"),
        encoding: row.get("encoding"),
        encoding_confidence: row.get("encoding_confidence"),
        started_at: from_db(&started_at)?,
        finished_at: from_db(&finished_at)?,
        status: status.parse()?,
        rows_parsed: count("rows_parsed"),
        rows_valid: count("rows_valid"),
        rows_quarantined: count("rows_quarantined"),
        rows_stale: count("rows_stale"),
        rows_rejected: count("rows_rejected"),
        facilities_created: count("facilities_created"),
        error: row.get("error"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use erq_common::db::init::init_database;
    use erq_common::db::regions::seed_regions;
    use erq_common::models::{Severity, ValidationStatus};
    use tempfile::TempDir;

    async fn store() -> (TempDir, SqliteIngestStore) {
        let dir = TempDir::new().unwrap();
        let pool = init_database(&dir.path().join("erq.db")).await.unwrap();
        seed_regions(&pool).await.unwrap();
        (dir, SqliteIngestStore::new(pool))
    }

    fn facility() -> Facility {
        Facility {
            id: Uuid::new_v4(),
            source_id: None,
            permit_number: Some("51220983".to_string()),
            establishment_name: "CISSS de Laval".to_string(),
            establishment_key: "cisss de laval".to_string(),
            installation_name: Some("Hôpital de la Cité-de-la-Santé".to_string()),
            installation_key: Some("hopital de la cite de la sante".to_string()),
            address: None,
            city: None,
            postal_code: None,
            province: Some("Québec".to_string()),
            region_code: Some("13".to_string()),
            location: None,
            updated_at: Utc::now(),
        }
    }

    fn commit_for(facility: &Facility, extracted_at: DateTime<Utc>) -> CycleCommit {
        let cycle_id = Uuid::new_v4();
        let metrics = OccupancyMetrics {
            functional_stretchers: Some(40),
            occupied_stretchers: Some(50),
            occupancy_ratio: Some(1.25),
            ..Default::default()
        };
        CycleCommit {
            cycle_id,
            new_facilities: vec![facility.clone()],
            facility_updates: vec![],
            history: vec![HistoryEntry {
                facility_id: facility.id,
                cycle_id,
                metrics: metrics.clone(),
                extracted_at: Some(extracted_at),
                source_updated_at: None,
                status: ValidationStatus::Valid,
                reason: None,
                recorded_at: Utc::now(),
            }],
            snapshots: vec![OccupancySnapshot {
                facility_id: facility.id,
                metrics,
                extracted_at,
                source_updated_at: None,
                cycle_id,
            }],
        }
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_released() {
        let (_dir, store) = store().await;
        let ttl = Duration::minutes(15);

        assert!(store.acquire_lease("msss", "a", ttl).await.unwrap());
        assert!(!store.acquire_lease("msss", "b", ttl).await.unwrap());
        assert_eq!(store.lease("msss").await.unwrap().unwrap().holder, "a");

        store.release_lease("msss", "a").await.unwrap();
        assert!(store.acquire_lease("msss", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let (_dir, store) = store().await;
        assert!(store.acquire_lease("msss", "crashed", Duration::milliseconds(-1)).await.unwrap());
        assert!(store.acquire_lease("msss", "next", Duration::minutes(15)).await.unwrap());
        assert_eq!(store.lease("msss").await.unwrap().unwrap().holder, "next");
    }

    #[tokio::test]
    async fn commit_writes_snapshot_and_registry_reloads_it() {
        let (_dir, store) = store().await;
        let f = facility();
        let ts = Utc::now() - Duration::minutes(10);
        store.commit_cycle(&commit_for(&f, ts)).await.unwrap();

        let registry = store.load_registry().await.unwrap();
        assert_eq!(registry.len(), 1);
        let stored_ts = registry.last_extracted(&f.id).unwrap();
        assert_eq!(to_db(&stored_ts), to_db(&ts));
        assert_eq!(registry.by_permit("51220983").len(), 1);
    }

    #[tokio::test]
    async fn provenance_commit_skips_snapshot() {
        let (_dir, store) = store().await;
        let f = facility();
        store.commit_provenance(&commit_for(&f, Utc::now())).await.unwrap();

        let snapshots: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM occupancy_current")
            .fetch_one(store.pool())
            .await
            .unwrap();
        let history: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM occupancy_history")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(snapshots, 0);
        assert_eq!(history, 1);
    }

    #[tokio::test]
    async fn failed_commit_leaves_nothing_behind() {
        let (_dir, store) = store().await;
        sqlx::query(
            "CREATE TRIGGER reject_snapshot BEFORE INSERT ON occupancy_current \
             BEGIN SELECT RAISE(ABORT, 'snapshot rejected'); END",
        )
        .execute(store.pool())
        .await
        .unwrap();

        let f = facility();
        let err = store.commit_cycle(&commit_for(&f, Utc::now())).await.unwrap_err();
        assert!(matches!(err, IngestError::CommitFailure(_)));

        let facilities: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM facilities")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(facilities, 0);
    }

    #[tokio::test]
    async fn anomalies_round_trip() {
        let (_dir, store) = store().await;
        let cycle_id = Uuid::new_v4();
        let anomalies = vec![
            IngestionAnomaly::new(cycle_id, "negative_count", Severity::Warning, "a;b;-1"),
            IngestionAnomaly::new(cycle_id, "truncated_row", Severity::Error, "a;b"),
        ];
        store.append_anomalies(&anomalies).await.unwrap();

        let stored = store.anomalies_for_cycle(cycle_id).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].reason, "negative_count");
        assert_eq!(stored[1].severity, Severity::Error);
    }
}
