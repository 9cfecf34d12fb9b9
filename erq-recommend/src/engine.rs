//! Recommendation engine
//!
//! Ranks nearby emergency rooms by current occupancy.
//!
//! # Pipeline
//! ORIGIN → PREFILTER (bounding box, SQL) → RADIUS (haversine) → ELIGIBILITY → RANK → TRUNCATE
//!
//! # Ranking
//! Candidates are sorted by occupancy ratio, then cut into groups. A group
//! starts at the lowest ratio not yet ranked and takes every candidate whose
//! ratio is within `tie_tolerance` of that anchor. Inside a group the
//! nearest facility comes first; facility id breaks the remaining ties.
//! Groups are anchored, not chained, so the order stays transitive.

use crate::error::{RecommendError, RecommendResult};
use crate::view::{Candidate, SnapshotView};
use chrono::{DateTime, Duration, Utc};
use erq_common::config::RecommendConfig;
use erq_common::geo::GeoPoint;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// Slack on group boundaries so 0.40 + 0.05 still covers 0.45
const RATIO_EPSILON: f64 = 1e-9;

/// Where the search starts
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Origin {
    Facility(Uuid),
    Coordinate(GeoPoint),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecommendationQuery {
    pub origin: Origin,
    pub radius_meters: f64,
    pub max_results: usize,
    pub freshness_window: Duration,
}

impl RecommendationQuery {
    /// Query with the configured radius, result count and freshness window
    pub fn with_defaults(origin: Origin, config: &RecommendConfig) -> Self {
        Self {
            origin,
            radius_meters: config.default_radius_meters,
            max_results: config.default_max_results,
            freshness_window: Duration::minutes(config.freshness_window_minutes),
        }
    }
}

/// Freshness window of `minutes`, rejecting values chrono cannot represent
pub fn freshness_window(minutes: i64) -> RecommendResult<Duration> {
    if minutes <= 0 {
        return Err(RecommendError::InvalidQuery(format!(
            "freshness window must be positive, got {minutes} minutes"
        )));
    }
    Duration::try_minutes(minutes).ok_or_else(|| {
        RecommendError::InvalidQuery(format!("freshness window of {minutes} minutes is out of range"))
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub facility_id: Uuid,
    pub name: String,
    pub distance_meters: f64,
    pub occupancy_ratio: f64,
    pub extracted_at: DateTime<Utc>,
    pub snapshot_age_seconds: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankingSettings {
    pub tie_tolerance: f64,
    pub max_results_cap: usize,
}

impl RankingSettings {
    pub fn from_config(config: &RecommendConfig) -> Self {
        Self {
            tie_tolerance: config.tie_tolerance,
            max_results_cap: config.max_results_cap.max(1),
        }
    }
}

impl Default for RankingSettings {
    fn default() -> Self {
        Self::from_config(&RecommendConfig::default())
    }
}

pub struct RecommendationEngine {
    view: Arc<dyn SnapshotView>,
    settings: RankingSettings,
}

impl RecommendationEngine {
    pub fn new(view: Arc<dyn SnapshotView>, settings: RankingSettings) -> Self {
        Self { view, settings }
    }

    pub fn settings(&self) -> &RankingSettings {
        &self.settings
    }

    /// Alternatives to `query.origin`, best first
    ///
    /// An empty list means nothing fresh enough lies within the radius.
    pub async fn recommend(&self, query: &RecommendationQuery) -> RecommendResult<Vec<Recommendation>> {
        self.recommend_at(query, Utc::now()).await
    }

    /// [`recommend`](Self::recommend) with an explicit clock
    pub async fn recommend_at(
        &self,
        query: &RecommendationQuery,
        now: DateTime<Utc>,
    ) -> RecommendResult<Vec<Recommendation>> {
        check_query(query)?;
        let (origin_point, origin_id) = self.resolve_origin(query.origin).await?;

        let candidates = self
            .view
            .candidates_within(origin_point.bounding_box(query.radius_meters))
            .await?;
        let prefiltered = candidates.len();

        let mut out_of_radius = 0usize;
        let mut without_ratio = 0usize;
        let mut stale = 0usize;
        let mut eligible = Vec::new();

        for candidate in candidates {
            if Some(candidate.facility.id) == origin_id {
                continue;
            }
            let distance = origin_point.haversine_meters(&candidate.location);
            if distance > query.radius_meters {
                out_of_radius += 1;
                continue;
            }
            let Some(ratio) = candidate.metrics.occupancy_ratio.filter(|r| r.is_finite()) else {
                without_ratio += 1;
                continue;
            };
            let age = now - candidate.extracted_at;
            if age > query.freshness_window {
                stale += 1;
                continue;
            }
            eligible.push(to_recommendation(candidate, distance, ratio, age));
        }

        let mut ranked = rank(eligible, self.settings.tie_tolerance);
        ranked.truncate(query.max_results.min(self.settings.max_results_cap));

        if ranked.is_empty() {
            tracing::debug!(
                prefiltered,
                out_of_radius,
                without_ratio,
                stale,
                "No eligible alternative within radius"
            );
        } else {
            tracing::debug!(prefiltered, stale, returned = ranked.len(), "Recommendations ranked");
        }
        Ok(ranked)
    }

    async fn resolve_origin(&self, origin: Origin) -> RecommendResult<(GeoPoint, Option<Uuid>)> {
        match origin {
            Origin::Coordinate(point) => {
                let point = GeoPoint::new(point.latitude, point.longitude)
                    .map_err(|e| RecommendError::InvalidQuery(e.to_string()))?;
                Ok((point, None))
            }
            Origin::Facility(id) => {
                let facility = self
                    .view
                    .facility(id)
                    .await?
                    .ok_or(RecommendError::UnknownOrigin(id))?;
                let location = facility
                    .location
                    .ok_or(RecommendError::OriginWithoutLocation(id))?;
                Ok((location, Some(id)))
            }
        }
    }
}

fn check_query(query: &RecommendationQuery) -> RecommendResult<()> {
    if !query.radius_meters.is_finite() || query.radius_meters <= 0.0 {
        return Err(RecommendError::InvalidQuery(format!(
            "radius must be positive, got {}",
            query.radius_meters
        )));
    }
    if query.max_results == 0 {
        return Err(RecommendError::InvalidQuery("max_results must be at least 1".to_string()));
    }
    if query.freshness_window <= Duration::zero() {
        return Err(RecommendError::InvalidQuery("freshness window must be positive".to_string()));
    }
    Ok(())
}

fn to_recommendation(candidate: Candidate, distance: f64, ratio: f64, age: Duration) -> Recommendation {
    Recommendation {
        facility_id: candidate.facility.id,
        name: candidate.facility.display_name().to_string(),
        distance_meters: distance,
        occupancy_ratio: ratio,
        extracted_at: candidate.extracted_at,
        snapshot_age_seconds: age.num_seconds().max(0),
    }
}

/// Order by ratio groups, then distance, then id
pub fn rank(mut items: Vec<Recommendation>, tie_tolerance: f64) -> Vec<Recommendation> {
    items.sort_by(|a, b| {
        a.occupancy_ratio
            .total_cmp(&b.occupancy_ratio)
            .then_with(|| a.facility_id.cmp(&b.facility_id))
    });

    let tolerance = tie_tolerance.max(0.0);
    let mut ranked = Vec::with_capacity(items.len());
    let mut rest = items.into_iter().peekable();

    while let Some(anchor) = rest.next() {
        let ceiling = anchor.occupancy_ratio + tolerance + RATIO_EPSILON;
        let mut group = vec![anchor];
        while let Some(next) = rest.next_if(|c| c.occupancy_ratio <= ceiling) {
            group.push(next);
        }
        group.sort_by(|a, b| {
            a.distance_meters
                .total_cmp(&b.distance_meters)
                .then_with(|| a.facility_id.cmp(&b.facility_id))
        });
        ranked.extend(group);
    }
    ranked
}
