//! Cycle-level results

use chrono::{DateTime, Utc};
use erq_common::models::{CycleRecord, Facility, HistoryEntry, OccupancySnapshot};
use serde::Serialize;
use uuid::Uuid;

use super::FacilityUpdate;

/// Everything one cycle writes in its snapshot transaction
#[derive(Debug, Clone, Default)]
pub struct CycleCommit {
    pub cycle_id: Uuid,
    pub new_facilities: Vec<Facility>,
    pub facility_updates: Vec<FacilityUpdate>,
    pub history: Vec<HistoryEntry>,
    pub snapshots: Vec<OccupancySnapshot>,
}

/// Counters reported for a finished cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    /// When the extract bytes were read from the source
    pub fetched_at: Option<DateTime<Utc>>,
    pub encoding: String,
    pub encoding_confidence: f64,
    pub low_confidence: bool,
    pub rows_parsed: usize,
    pub rows_rejected: usize,
    pub rows_valid: usize,
    pub rows_quarantined: usize,
    pub rows_stale: usize,
    pub snapshots_written: usize,
    pub facilities_created: usize,
    pub facilities_updated: usize,
    pub fields_repaired: usize,
    pub anomalies: usize,
}

impl CycleReport {
    pub fn to_record(&self, base: CycleRecord) -> CycleRecord {
        CycleRecord {
            rows_parsed: self.rows_parsed,
            rows_valid: self.rows_valid,
            rows_quarantined: self.rows_quarantined,
            rows_stale: self.rows_stale,
            rows_rejected: self.rows_rejected,
            facilities_created: self.facilities_created,
            encoding: Some(self.encoding.clone()),
            encoding_confidence: Some(self.encoding_confidence),
            ..base
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Committed(CycleReport),
    /// Another trigger held the lease; nothing was done
    Skipped,
}
