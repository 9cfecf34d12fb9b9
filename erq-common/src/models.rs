//! Domain models shared by ingestion and recommendation
//!
//! Regions and facilities form the registry. Occupancy is kept twice: the
//! current snapshot (one per facility, valid rows only) and the append-only
//! history (every parsed row of every cycle).

use crate::geo::GeoPoint;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Raw row excerpts kept on anomalies are capped at this many bytes
pub const MAX_EXCERPT_BYTES: usize = 512;

/// Health region (RSS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    /// Two-digit RSS code, e.g. "06"
    pub code: String,
    pub name: String,
    pub name_key: String,
}

/// A physical emergency-room installation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Facility {
    pub id: Uuid,
    pub source_id: Option<String>,
    pub permit_number: Option<String>,
    pub establishment_name: String,
    pub establishment_key: String,
    pub installation_name: Option<String>,
    pub installation_key: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub province: Option<String>,
    pub region_code: Option<String>,
    pub location: Option<GeoPoint>,
    pub updated_at: DateTime<Utc>,
}

impl Facility {
    /// Installation name when present, establishment name otherwise
    pub fn display_name(&self) -> &str {
        self.installation_name
            .as_deref()
            .unwrap_or(&self.establishment_name)
    }
}

/// Measured values of one extract row
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OccupancyMetrics {
    pub functional_stretchers: Option<i64>,
    pub occupied_stretchers: Option<i64>,
    pub patients_over_24h: Option<i64>,
    pub patients_over_48h: Option<i64>,
    pub total_patients: Option<i64>,
    pub patients_waiting: Option<i64>,
    pub stretcher_los_hours: Option<f64>,
    pub ambulatory_los_hours: Option<f64>,
    pub hourly_stretcher_los_hours: Option<f64>,
    pub hourly_ambulatory_los_hours: Option<f64>,
    /// occupied / functional as a fraction, recomputed at validation
    pub occupancy_ratio: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Valid,
    Quarantined,
    Stale,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStatus::Valid => "valid",
            ValidationStatus::Quarantined => "quarantined",
            ValidationStatus::Stale => "stale",
        }
    }
}

impl fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValidationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "valid" => Ok(ValidationStatus::Valid),
            "quarantined" => Ok(ValidationStatus::Quarantined),
            "stale" => Ok(ValidationStatus::Stale),
            other => Err(Error::CorruptRecord(format!("unknown validation status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "error" => Ok(Severity::Error),
            other => Err(Error::CorruptRecord(format!("unknown severity '{other}'"))),
        }
    }
}

/// Current state of one facility; only valid rows become snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OccupancySnapshot {
    pub facility_id: Uuid,
    pub metrics: OccupancyMetrics,
    pub extracted_at: DateTime<Utc>,
    pub source_updated_at: Option<DateTime<Utc>>,
    pub cycle_id: Uuid,
}

/// Immutable record of one parsed row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub facility_id: Uuid,
    pub cycle_id: Uuid,
    pub metrics: OccupancyMetrics,
    pub extracted_at: Option<DateTime<Utc>>,
    pub source_updated_at: Option<DateTime<Utc>>,
    pub status: ValidationStatus,
    pub reason: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Write-once diagnostic attached to a cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionAnomaly {
    pub cycle_id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub raw_excerpt: String,
    pub facility_id: Option<Uuid>,
    pub reason: String,
    pub severity: Severity,
    pub detail: Option<String>,
}

impl IngestionAnomaly {
    pub fn new(cycle_id: Uuid, reason: &str, severity: Severity, raw: &str) -> Self {
        Self {
            cycle_id,
            recorded_at: Utc::now(),
            raw_excerpt: excerpt(raw),
            facility_id: None,
            reason: reason.to_string(),
            severity,
            detail: None,
        }
    }

    pub fn with_facility(mut self, facility_id: Uuid) -> Self {
        self.facility_id = Some(facility_id);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Truncate to `MAX_EXCERPT_BYTES` on a char boundary
pub fn excerpt(raw: &str) -> String {
    if raw.len() <= MAX_EXCERPT_BYTES {
        return raw.to_string();
    }
    let mut end = MAX_EXCERPT_BYTES;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    raw[..end].to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Committed,
    /// Snapshot commit failed; history and facilities were still written
    ProvenanceOnly,
    Failed,
}

impl CycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStatus::Committed => "committed",
            CycleStatus::ProvenanceOnly => "provenance_only",
            CycleStatus::Failed => "failed",
        }
    }
}

impl FromStr for CycleStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "committed" => Ok(CycleStatus::Committed),
            "provenance_only" => Ok(CycleStatus::ProvenanceOnly),
            "failed" => Ok(CycleStatus::Failed),
            other => Err(Error::CorruptRecord(format!("unknown cycle status '{other}'"))),
        }
    }
}

/// Audit record of one ingestion cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub id: Uuid,
    pub source: String,
    pub location: String,
    pub checksum: Option<String>,
    pub encoding: Option<String>,
    pub encoding_confidence: Option<f64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: CycleStatus,
    pub rows_parsed: usize,
    pub rows_valid: usize,
    pub rows_quarantined: usize,
    pub rows_stale: usize,
    pub rows_rejected: usize,
    pub facilities_created: usize,
    pub error: Option<String>,
}
