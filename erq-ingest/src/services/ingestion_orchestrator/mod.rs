//! Ingestion orchestrator
//!
//! Runs one ingestion cycle for one source.
//!
//! # State Progression
//! LEASING → FETCHING → DECODING → READING → PREPARING → MATCHING → COMMITTING
//!
//! # Guarantees
//! - At most one cycle per source holds the lease; an overlapping trigger
//!   returns [`CycleOutcome::Skipped`] without doing anything
//! - Snapshots change only through one transaction; when it fails the
//!   history and facilities are still written on their own
//! - Anomalies and the cycle record are persisted whatever the outcome
//! - The lease is released on every path out of a started cycle

mod phase_match;
mod phase_prepare;

pub use phase_prepare::prepare_row;

use crate::db::IngestStore;
use crate::error::{IngestError, IngestResult};
use crate::models::{CycleOutcome, CycleReport};
use crate::services::encoding_normalizer::detect_and_decode;
use crate::services::extract_reader::{read_extract, SchemaVersion};
use crate::services::facility_directory::FacilityDirectory;
use crate::services::cell_parser::offset_from_minutes;
use crate::services::source_fetcher::SourceFetcher;
use crate::validators::ValidationRules;
use chrono::{DateTime, Duration, FixedOffset, Utc};
use erq_common::config::TomlConfig;
use erq_common::events::{ErqEvent, EventBus};
use erq_common::models::{CycleRecord, CycleStatus, IngestionAnomaly, Severity};
use std::sync::Arc;
use uuid::Uuid;

/// Cycle tuning resolved from the TOML config
#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub source_name: String,
    pub schema: SchemaVersion,
    pub utc_offset: FixedOffset,
    pub worker_pool_size: usize,
    pub lease_ttl: Duration,
    pub low_confidence_threshold: f64,
    pub rules: ValidationRules,
}

impl IngestSettings {
    pub fn from_config(config: &TomlConfig) -> IngestResult<Self> {
        Ok(Self {
            source_name: config.source.name.clone(),
            schema: config.source.schema_version.parse()?,
            utc_offset: offset_from_minutes(config.source.utc_offset_minutes),
            worker_pool_size: config.ingest.worker_pool_size.max(1),
            lease_ttl: Duration::seconds(config.ingest.lease_ttl_secs.min(i64::MAX as u64) as i64),
            low_confidence_threshold: config.ingest.low_confidence_threshold,
            rules: ValidationRules {
                future_skew: Duration::seconds(config.ingest.future_skew_secs),
            },
        })
    }
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            source_name: "msss-urgences".to_string(),
            schema: SchemaVersion::V1,
            utc_offset: offset_from_minutes(-300),
            worker_pool_size: 4,
            lease_ttl: Duration::minutes(15),
            low_confidence_threshold: 0.7,
            rules: ValidationRules::default(),
        }
    }
}

/// Mutable bookkeeping of the cycle in progress
pub(crate) struct CycleState {
    cycle_id: Uuid,
    started_at: DateTime<Utc>,
    location: String,
    checksum: Option<String>,
    report: CycleReport,
    anomalies: Vec<IngestionAnomaly>,
    provenance_written: bool,
}

pub struct IngestionOrchestrator {
    store: Arc<dyn IngestStore>,
    fetcher: Arc<dyn SourceFetcher>,
    event_bus: EventBus,
    directory: Option<Arc<FacilityDirectory>>,
    settings: IngestSettings,
}

impl IngestionOrchestrator {
    pub fn new(
        store: Arc<dyn IngestStore>,
        fetcher: Arc<dyn SourceFetcher>,
        event_bus: EventBus,
        settings: IngestSettings,
    ) -> Self {
        Self {
            store,
            fetcher,
            event_bus,
            directory: None,
            settings,
        }
    }

    pub fn with_directory(mut self, directory: Option<Arc<FacilityDirectory>>) -> Self {
        self.directory = directory;
        self
    }

    pub fn settings(&self) -> &IngestSettings {
        &self.settings
    }

    /// True while an unexpired lease exists for the source
    pub async fn lease_held(&self) -> IngestResult<bool> {
        let lease = self.store.lease(&self.settings.source_name).await?;
        Ok(lease.is_some_and(|l| l.is_active(Utc::now())))
    }

    /// Run one cycle
    pub async fn run_cycle(&self) -> IngestResult<CycleOutcome> {
        let source = self.settings.source_name.clone();
        let cycle_id = Uuid::new_v4();
        let holder = format!("{}:{}", std::process::id(), cycle_id);

        if !self
            .store
            .acquire_lease(&source, &holder, self.settings.lease_ttl)
            .await?
        {
            tracing::info!(source = %source, "Ingestion cycle skipped: lease held by another trigger");
            self.event_bus.emit_lossy(ErqEvent::CycleSkipped {
                source,
                timestamp: Utc::now(),
            });
            return Ok(CycleOutcome::Skipped);
        }

        let started_at = Utc::now();
        tracing::info!(cycle_id = %cycle_id, source = %source, "Ingestion cycle started");
        self.event_bus.emit_lossy(ErqEvent::CycleStarted {
            cycle_id,
            source: source.clone(),
            timestamp: started_at,
        });

        let mut state = CycleState {
            cycle_id,
            started_at,
            location: self.fetcher.location().to_string(),
            checksum: None,
            report: CycleReport {
                cycle_id,
                ..Default::default()
            },
            anomalies: Vec::new(),
            provenance_written: false,
        };

        let result = self.execute(&mut state).await;
        self.finish(&mut state, &result).await;

        if let Err(e) = self.store.release_lease(&source, &holder).await {
            tracing::error!(source = %source, error = %e, "Failed to release lease");
        }

        match result {
            Ok(()) => {
                tracing::info!(
                    cycle_id = %cycle_id,
                    rows_parsed = state.report.rows_parsed,
                    rows_valid = state.report.rows_valid,
                    rows_quarantined = state.report.rows_quarantined,
                    rows_stale = state.report.rows_stale,
                    rows_rejected = state.report.rows_rejected,
                    facilities_created = state.report.facilities_created,
                    anomalies = state.report.anomalies,
                    "Ingestion cycle committed"
                );
                self.event_bus.emit_lossy(ErqEvent::CycleCommitted {
                    cycle_id,
                    source,
                    rows_parsed: state.report.rows_parsed,
                    rows_valid: state.report.rows_valid,
                    anomalies: state.report.anomalies,
                    timestamp: Utc::now(),
                });
                Ok(CycleOutcome::Committed(state.report))
            }
            Err(e) => {
                tracing::error!(cycle_id = %cycle_id, source = %source, error = %e, "Ingestion cycle failed");
                self.event_bus.emit_lossy(ErqEvent::CycleFailed {
                    cycle_id,
                    source,
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
                Err(e)
            }
        }
    }

    async fn execute(&self, state: &mut CycleState) -> IngestResult<()> {
        let fetched = self.fetcher.fetch().await?;
        state.location = fetched.location.clone();
        state.checksum = Some(fetched.checksum.clone());
        state.report.fetched_at = Some(fetched.fetched_at);
        tracing::debug!(location = %fetched.location, fetched_at = %fetched.fetched_at, bytes = fetched.bytes.len(), "Extract fetched");

        let threshold = self.settings.low_confidence_threshold;
        let decoded = tokio::task::spawn_blocking(move || detect_and_decode(&fetched.bytes, threshold))
            .await
            .map_err(|e| IngestError::Internal(format!("decode task failed: {e}")))?;
        state.report.encoding = decoded.encoding.to_string();
        state.report.encoding_confidence = decoded.confidence;
        state.report.low_confidence = decoded.low_confidence;
        if decoded.low_confidence {
            tracing::warn!(
                encoding = decoded.encoding,
                confidence = decoded.confidence,
                "Extract decoded with low confidence"
            );
            state.anomalies.push(
                IngestionAnomaly::new(state.cycle_id, "low_confidence_encoding", Severity::Warning, "")
                    .with_detail(format!("{} at confidence {:.2}", decoded.encoding, decoded.confidence)),
            );
        }

        let table = read_extract(&decoded.text, self.settings.schema)?;
        state.report.rows_rejected = table.rejected.len();
        for rejected in &table.rejected {
            state.anomalies.push(
                IngestionAnomaly::new(state.cycle_id, rejected.reason, Severity::Error, &rejected.raw)
                    .with_detail(format!("line {}: {}", rejected.line, rejected.detail)),
            );
        }
        if table.rows.is_empty() {
            return Err(IngestError::SourceUnavailable(format!(
                "{}: extract holds no parsable rows ({} rejected)",
                state.location,
                table.rejected.len()
            )));
        }
        state.report.rows_parsed = table.rows.len();

        let prepared = self.phase_prepare(table.rows).await?;
        let mut registry = self.store.load_registry().await?;
        let commit = self.phase_match(state, &mut registry, prepared, decoded.low_confidence, Utc::now());
        state.report.snapshots_written = commit.snapshots.len();

        match self.store.commit_cycle(&commit).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!(cycle_id = %state.cycle_id, error = %e, "Snapshot commit failed");
                state.report.snapshots_written = 0;
                state.anomalies.push(
                    IngestionAnomaly::new(state.cycle_id, "commit_failure", Severity::Error, "")
                        .with_detail(e.to_string()),
                );

                match self.store.commit_provenance(&commit).await {
                    Ok(()) => state.provenance_written = true,
                    Err(e2) => {
                        tracing::error!(cycle_id = %state.cycle_id, error = %e2, "Provenance commit failed");
                        state.anomalies.push(
                            IngestionAnomaly::new(state.cycle_id, "commit_failure", Severity::Error, "")
                                .with_detail(format!("provenance: {e2}")),
                        );
                    }
                }

                Err(match e {
                    IngestError::CommitFailure(msg) => IngestError::CommitFailure(msg),
                    other => IngestError::CommitFailure(other.to_string()),
                })
            }
        }
    }

    /// Persist anomalies and the cycle record; failures here are logged only
    async fn finish(&self, state: &mut CycleState, result: &IngestResult<()>) {
        state.report.anomalies = state.anomalies.len();

        if let Err(e) = self.store.append_anomalies(&state.anomalies).await {
            tracing::error!(cycle_id = %state.cycle_id, error = %e, "Failed to persist anomalies");
        }

        let status = match result {
            Ok(()) => CycleStatus::Committed,
            Err(IngestError::CommitFailure(_)) if state.provenance_written => CycleStatus::ProvenanceOnly,
            Err(_) => CycleStatus::Failed,
        };
        let base = CycleRecord {
            id: state.cycle_id,
            source: self.settings.source_name.clone(),
            location: state.location.clone(),
            checksum: state.checksum.clone(),
            encoding: None,
            encoding_confidence: None,
            started_at: state.started_at,
            finished_at: Utc::now(),
            status,
            rows_parsed: 0,
            rows_valid: 0,
            rows_quarantined: 0,
            rows_stale: 0,
            rows_rejected: 0,
            facilities_created: 0,
            error: result.as_ref().err().map(|e| e.to_string()),
        };
        let mut record = state.report.to_record(base);
        if state.report.encoding.is_empty() {
            record.encoding = None;
            record.encoding_confidence = None;
        }

        if let Err(e) = self.store.record_cycle(&record).await {
            tracing::error!(cycle_id = %state.cycle_id, error = %e, "Failed to record cycle");
        }
    }
}
