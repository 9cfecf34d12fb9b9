//! Test Helper Utilities
//!
//! Shared fixtures for erq-ingest integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use erq_common::events::EventBus;
use erq_ingest::db::SqliteIngestStore;
use erq_ingest::services::{FetchedSource, FileFetcher, IngestSettings, IngestionOrchestrator, SourceFetcher};
use erq_ingest::IngestResult;
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Notify;

pub const HEADER: &str = "RSS;Region;Nom_etablissement;Nom_installation;No_permis_installation;\
Nombre_de_civieres_fonctionnelles;Nombre_de_civieres_occupees;\
Nombre_total_de_patients_presents_a_lurgence;Heure_de_l'extraction_(image);Mise_a_jour";

/// One extract record in the hourly layout
#[derive(Debug, Clone)]
pub struct FixtureRow {
    pub region: &'static str,
    pub establishment: &'static str,
    pub installation: &'static str,
    pub permit: &'static str,
    pub functional: &'static str,
    pub occupied: &'static str,
    pub total: &'static str,
    pub extraction: &'static str,
    pub updated: &'static str,
}

impl FixtureRow {
    pub fn new(installation: &'static str, functional: &'static str, occupied: &'static str) -> Self {
        Self {
            region: "06",
            establishment: "CIUSSS du Centre-Sud-de-l'Île-de-Montréal",
            installation,
            permit: "",
            functional,
            occupied,
            total: "",
            extraction: "14:00",
            updated: "2024-03-09 14:05",
        }
    }

    pub fn permit(mut self, permit: &'static str) -> Self {
        self.permit = permit;
        self
    }

    pub fn region(mut self, region: &'static str) -> Self {
        self.region = region;
        self
    }

    pub fn establishment(mut self, establishment: &'static str) -> Self {
        self.establishment = establishment;
        self
    }

    pub fn at(mut self, extraction: &'static str, updated: &'static str) -> Self {
        self.extraction = extraction;
        self.updated = updated;
        self
    }

    pub fn line(&self) -> String {
        [
            self.region,
            "",
            self.establishment,
            self.installation,
            self.permit,
            self.functional,
            self.occupied,
            self.total,
            self.extraction,
            self.updated,
        ]
        .join(";")
    }
}

pub fn extract_text(rows: &[FixtureRow]) -> String {
    let mut text = String::from(HEADER);
    text.push('\n');
    for row in rows {
        text.push_str(&row.line());
        text.push('\n');
    }
    text
}

/// UTF-8 bytes read back as windows-1252, the upstream double encoding
pub fn mojibake(text: &str) -> String {
    let (decoded, _) = encoding_rs::WINDOWS_1252.decode_without_bom_handling(text.as_bytes());
    decoded.into_owned()
}

pub fn write_extract(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

/// Temporary database with schema and regions
///
/// Returns (TempDir, SqlitePool) - TempDir must be kept alive for duration of test
pub async fn create_test_db() -> (TempDir, SqlitePool) {
    let temp_dir = TempDir::new().unwrap();
    let pool = erq_common::db::init::init_database(&temp_dir.path().join("erq.db"))
        .await
        .unwrap();
    erq_common::db::regions::seed_regions(&pool).await.unwrap();
    (temp_dir, pool)
}

pub fn orchestrator_with(pool: &SqlitePool, fetcher: Arc<dyn SourceFetcher>, bus: EventBus) -> IngestionOrchestrator {
    IngestionOrchestrator::new(
        Arc::new(SqliteIngestStore::new(pool.clone())),
        fetcher,
        bus,
        IngestSettings::default(),
    )
}

pub fn file_orchestrator(pool: &SqlitePool, path: &Path) -> IngestionOrchestrator {
    orchestrator_with(pool, Arc::new(FileFetcher::new(path)), EventBus::new(16))
}

/// Fetcher that blocks until released, to hold a cycle inside its lease
pub struct GatedFetcher {
    pub bytes: Vec<u8>,
    pub entered: Notify,
    pub release: Notify,
}

impl GatedFetcher {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            entered: Notify::new(),
            release: Notify::new(),
        }
    }
}

#[async_trait]
impl SourceFetcher for GatedFetcher {
    async fn fetch(&self) -> IngestResult<FetchedSource> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(FetchedSource::new(self.bytes.clone(), "gated://extract"))
    }

    fn location(&self) -> &str {
        "gated://extract"
    }
}

pub async fn count(pool: &SqlitePool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(pool)
        .await
        .unwrap()
}

pub async fn anomaly_reasons(pool: &SqlitePool) -> Vec<String> {
    sqlx::query_scalar("SELECT reason FROM ingestion_anomalies ORDER BY id")
        .fetch_all(pool)
        .await
        .unwrap()
}

/// Make every snapshot write fail inside the commit transaction
pub async fn break_snapshot_table(pool: &SqlitePool) {
    for event in ["INSERT", "UPDATE"] {
        sqlx::query(&format!(
            "CREATE TRIGGER reject_snapshot_{} BEFORE {event} ON occupancy_current \
             BEGIN SELECT RAISE(ABORT, 'snapshot table unavailable'); END",
            event.to_lowercase()
        ))
        .execute(pool)
        .await
        .unwrap();
    }
}
