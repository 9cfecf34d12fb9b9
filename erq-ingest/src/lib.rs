//! erq-ingest library interface
//!
//! Ingestion pipeline for the emergency-room occupancy extract: fetch,
//! decode, read, match, validate and historize.

pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;
pub mod validators;

pub use crate::error::{IngestError, IngestResult};

use crate::db::SqliteIngestStore;
use crate::services::{fetcher_for, FacilityDirectory, IngestSettings, IngestionOrchestrator};
use crate::utils::RetryPolicy;
use erq_common::config::TomlConfig;
use erq_common::events::EventBus;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

/// Event bus capacity for cycle lifecycle events
pub const EVENT_BUS_CAPACITY: usize = 100;

/// State shared by the ingestion commands
#[derive(Clone)]
pub struct IngestContext {
    pub config: TomlConfig,
    pub db: SqlitePool,
    pub event_bus: EventBus,
}

impl IngestContext {
    pub fn new(config: TomlConfig, db: SqlitePool) -> Self {
        Self {
            config,
            db,
            event_bus: EventBus::new(EVENT_BUS_CAPACITY),
        }
    }

    pub fn store(&self) -> SqliteIngestStore {
        SqliteIngestStore::new(self.db.clone())
    }

    /// Facility directory named in `[source]`, if any
    pub fn load_directory(&self) -> IngestResult<Option<Arc<FacilityDirectory>>> {
        self.config
            .source
            .facility_directory
            .as_deref()
            .map(|path| FacilityDirectory::from_path(path).map(Arc::new))
            .transpose()
    }

    /// Orchestrator wired to the configured source and this database
    pub fn orchestrator(&self) -> IngestResult<IngestionOrchestrator> {
        let settings = IngestSettings::from_config(&self.config)?;
        let fetcher = fetcher_for(
            &self.config.source.location,
            Duration::from_secs(self.config.ingest.fetch_timeout_secs),
            RetryPolicy::from_config(&self.config.ingest),
        )?;

        Ok(IngestionOrchestrator::new(
            Arc::new(self.store()),
            Arc::from(fetcher),
            self.event_bus.clone(),
            settings,
        )
        .with_directory(self.load_directory()?))
    }
}
