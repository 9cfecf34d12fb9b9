//! Phase: PREPARING
//!
//! Per-row text repair, canonicalization and cell parsing. Rows are
//! independent here, so they run on the blocking pool with at most
//! `worker_pool_size` in flight.

use super::IngestionOrchestrator;
use crate::error::{IngestError, IngestResult};
use crate::models::{ExtractRow, PreparedRow};
use crate::services::cell_parser::{parse_duration_hours, parse_extraction_time, parse_number, parse_update_time};
use crate::services::encoding_normalizer::{looks_garbled, repair_mojibake};
use crate::services::facility_registry::normalize_identifier;
use chrono::FixedOffset;
use erq_common::canon::canonicalize;
use erq_common::db::regions::normalize_region_code;
use futures::stream::{self, StreamExt};

struct RepairedText {
    text: Option<String>,
    repaired: bool,
}

fn repair(field: Option<String>) -> RepairedText {
    match field {
        Some(text) => {
            let repair = repair_mojibake(&text);
            RepairedText {
                text: Some(repair.text),
                repaired: repair.applied,
            }
        }
        None => RepairedText {
            text: None,
            repaired: false,
        },
    }
}

fn key_of(text: &Option<String>) -> Option<String> {
    text.as_deref().map(canonicalize).filter(|k| !k.is_empty())
}

/// Repair, canonicalize and parse one extract row
pub fn prepare_row(row: ExtractRow, offset: FixedOffset) -> PreparedRow {
    let region_name = repair(row.region_name);
    let establishment = repair(row.establishment_name);
    let installation = repair(row.installation_name);

    let repaired_fields = [&region_name, &establishment, &installation]
        .iter()
        .filter(|r| r.repaired)
        .count();
    let garbled = [&establishment.text, &installation.text]
        .iter()
        .any(|t| t.as_deref().is_some_and(looks_garbled));

    let metrics = row.metrics;
    let source_updated_at = parse_update_time(row.source_updated.as_deref(), offset);
    let extracted_at = parse_extraction_time(row.extraction_time.as_deref(), &source_updated_at, offset);

    PreparedRow {
        line: row.line,
        raw: row.raw,
        region_code: row.region_code.as_deref().and_then(normalize_region_code),
        region_key: key_of(&region_name.text),
        region_name: region_name.text,
        establishment_key: key_of(&establishment.text),
        establishment_name: establishment.text,
        installation_key: key_of(&installation.text),
        installation_name: installation.text,
        permit_number: row.permit_number.as_deref().and_then(normalize_identifier),
        source_id: row.source_id.as_deref().and_then(normalize_identifier),

        functional_stretchers: parse_number(metrics.functional_stretchers.as_deref()),
        occupied_stretchers: parse_number(metrics.occupied_stretchers.as_deref()),
        patients_over_24h: parse_number(metrics.patients_over_24h.as_deref()),
        patients_over_48h: parse_number(metrics.patients_over_48h.as_deref()),
        total_patients: parse_number(metrics.total_patients.as_deref()),
        patients_waiting: parse_number(metrics.patients_waiting.as_deref()),
        stretcher_los: parse_duration_hours(metrics.stretcher_los.as_deref()),
        ambulatory_los: parse_duration_hours(metrics.ambulatory_los.as_deref()),
        hourly_stretcher_los: parse_duration_hours(metrics.hourly_stretcher_los.as_deref()),
        hourly_ambulatory_los: parse_duration_hours(metrics.hourly_ambulatory_los.as_deref()),
        reported_ratio: parse_number(metrics.reported_ratio.as_deref()),

        extracted_at,
        source_updated_at,
        repaired_fields,
        garbled,
    }
}

impl IngestionOrchestrator {
    /// Prepare all rows; output is in extract order
    pub(super) async fn phase_prepare(&self, rows: Vec<ExtractRow>) -> IngestResult<Vec<PreparedRow>> {
        let offset = self.settings.utc_offset;
        let total = rows.len();

        let results: Vec<Result<PreparedRow, tokio::task::JoinError>> = stream::iter(rows)
            .map(|row| tokio::task::spawn_blocking(move || prepare_row(row, offset)))
            .buffer_unordered(self.settings.worker_pool_size.max(1))
            .collect()
            .await;

        let mut prepared = Vec::with_capacity(total);
        for result in results {
            prepared.push(result.map_err(|e| IngestError::Internal(format!("row preparation task failed: {e}")))?);
        }
        prepared.sort_by_key(|row| row.line);

        let repaired: usize = prepared.iter().map(|r| r.repaired_fields).sum();
        tracing::debug!(rows = prepared.len(), repaired_fields = repaired, "Rows prepared");
        Ok(prepared)
    }
}
