//! Rows as read from the extract and as prepared for matching

use chrono::{DateTime, Utc};

/// Metric cells exactly as they appear in the extract
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawMetrics {
    pub functional_stretchers: Option<String>,
    pub occupied_stretchers: Option<String>,
    pub patients_over_24h: Option<String>,
    pub patients_over_48h: Option<String>,
    pub total_patients: Option<String>,
    pub patients_waiting: Option<String>,
    pub stretcher_los: Option<String>,
    pub ambulatory_los: Option<String>,
    pub hourly_stretcher_los: Option<String>,
    pub hourly_ambulatory_los: Option<String>,
    pub reported_ratio: Option<String>,
}

/// One data record with its identity fields; text is decoded but not repaired
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractRow {
    /// 1-based record number, header excluded
    pub line: usize,
    /// Record re-joined with the detected delimiter, for anomaly excerpts
    pub raw: String,
    pub region_code: Option<String>,
    pub region_name: Option<String>,
    pub establishment_name: Option<String>,
    pub installation_name: Option<String>,
    pub permit_number: Option<String>,
    pub source_id: Option<String>,
    pub metrics: RawMetrics,
    pub extraction_time: Option<String>,
    pub source_updated: Option<String>,
}

impl ExtractRow {
    pub fn has_identity(&self) -> bool {
        self.establishment_name.is_some()
            || self.installation_name.is_some()
            || self.permit_number.is_some()
            || self.source_id.is_some()
    }
}

/// A numeric cell after parsing
#[derive(Debug, Clone, PartialEq)]
pub enum NumericCell {
    Missing,
    Number(f64),
    /// Cell text that is neither blank nor a number
    Invalid(String),
}

impl NumericCell {
    pub fn value(&self) -> Option<f64> {
        match self {
            NumericCell::Number(v) => Some(*v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TimestampCell {
    Missing,
    At(DateTime<Utc>),
    Invalid(String),
}

/// Row after encoding repair, canonicalization and cell parsing
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRow {
    pub line: usize,
    pub raw: String,
    pub region_code: Option<String>,
    pub region_name: Option<String>,
    pub region_key: Option<String>,
    pub establishment_name: Option<String>,
    pub establishment_key: Option<String>,
    pub installation_name: Option<String>,
    pub installation_key: Option<String>,
    pub permit_number: Option<String>,
    pub source_id: Option<String>,

    pub functional_stretchers: NumericCell,
    pub occupied_stretchers: NumericCell,
    pub patients_over_24h: NumericCell,
    pub patients_over_48h: NumericCell,
    pub total_patients: NumericCell,
    pub patients_waiting: NumericCell,
    pub stretcher_los: NumericCell,
    pub ambulatory_los: NumericCell,
    pub hourly_stretcher_los: NumericCell,
    pub hourly_ambulatory_los: NumericCell,
    pub reported_ratio: NumericCell,

    pub extracted_at: TimestampCell,
    pub source_updated_at: TimestampCell,

    /// Text fields changed by mojibake repair
    pub repaired_fields: usize,
    /// Identity text still shows garbled sequences after repair
    pub garbled: bool,
}

impl PreparedRow {
    /// Name used in logs and new facility records
    pub fn display_name(&self) -> &str {
        self.installation_name
            .as_deref()
            .or(self.establishment_name.as_deref())
            .or(self.permit_number.as_deref())
            .or(self.source_id.as_deref())
            .unwrap_or("")
    }
}
