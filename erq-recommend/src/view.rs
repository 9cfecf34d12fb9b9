//! Committed snapshot view used by the recommendation engine

use crate::error::RecommendResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use erq_common::db::facilities::{
    facility_from_row, get_facility, metrics_from_row, FACILITY_COLUMNS, METRIC_SELECT,
};
use erq_common::geo::{BoundingBox, GeoPoint};
use erq_common::models::{Facility, OccupancyMetrics};
use erq_common::time::from_db;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// A located facility joined with its current snapshot
#[derive(Debug, Clone)]
pub struct Candidate {
    pub facility: Facility,
    pub location: GeoPoint,
    pub metrics: OccupancyMetrics,
    pub extracted_at: DateTime<Utc>,
}

#[async_trait]
pub trait SnapshotView: Send + Sync {
    /// Facility by id, with or without a location
    async fn facility(&self, id: Uuid) -> RecommendResult<Option<Facility>>;

    /// Located facilities inside `bbox` that have a current snapshot
    async fn candidates_within(&self, bbox: BoundingBox) -> RecommendResult<Vec<Candidate>>;
}

#[derive(Clone)]
pub struct SqliteSnapshotView {
    pool: SqlitePool,
}

impl SqliteSnapshotView {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SnapshotView for SqliteSnapshotView {
    async fn facility(&self, id: Uuid) -> RecommendResult<Option<Facility>> {
        Ok(get_facility(&self.pool, id).await?)
    }

    async fn candidates_within(&self, bbox: BoundingBox) -> RecommendResult<Vec<Candidate>> {
        let sql = format!(
            "SELECT {FACILITY_COLUMNS}, {METRIC_SELECT}, o.extracted_at \
             FROM facilities f \
             JOIN occupancy_current o ON o.facility_id = f.id \
             WHERE f.latitude BETWEEN ? AND ? AND f.longitude BETWEEN ? AND ?"
        );
        let rows = sqlx::query(&sql)
            .bind(bbox.min_lat)
            .bind(bbox.max_lat)
            .bind(bbox.min_lon)
            .bind(bbox.max_lon)
            .fetch_all(&self.pool)
            .await?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            let facility = facility_from_row(row)?;
            // coordinates failing range checks come back as None
            let Some(location) = facility.location else {
                continue;
            };
            let extracted_at: String = row.get("extracted_at");
            candidates.push(Candidate {
                location,
                metrics: metrics_from_row(row),
                extracted_at: from_db(&extracted_at)?,
                facility,
            });
        }
        Ok(candidates)
    }
}
