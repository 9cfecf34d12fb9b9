//! erq-recommend library interface
//!
//! Read path over the committed occupancy snapshots: nearby emergency rooms
//! ranked by congestion, facility history and region summaries.

pub mod db;
pub mod engine;
pub mod error;
pub mod trends;
pub mod view;

pub use crate::engine::{freshness_window, Origin, Recommendation, RecommendationEngine, RecommendationQuery, RankingSettings};
pub use crate::error::{RecommendError, RecommendResult};

use crate::view::SqliteSnapshotView;
use erq_common::config::TomlConfig;
use sqlx::SqlitePool;
use std::sync::Arc;

/// State shared by the recommendation commands
#[derive(Clone)]
pub struct RecommendContext {
    pub config: TomlConfig,
    pub db: SqlitePool,
}

impl RecommendContext {
    pub fn new(config: TomlConfig, db: SqlitePool) -> Self {
        Self { config, db }
    }

    pub fn engine(&self) -> RecommendationEngine {
        RecommendationEngine::new(
            Arc::new(SqliteSnapshotView::new(self.db.clone())),
            RankingSettings::from_config(&self.config.recommend),
        )
    }

    /// Query from `origin` with the `[recommend]` defaults
    pub fn query(&self, origin: Origin) -> RecommendationQuery {
        RecommendationQuery::with_defaults(origin, &self.config.recommend)
    }
}
