//! Occupancy Validator
//!
//! Turns a matched [`PreparedRow`] into typed metrics and a verdict.
//!
//! # Checks
//! 1. **Counts**: stretcher and patient counts are non-negative integers
//! 2. **Decoding**: a cell that is neither blank nor a number fails the row
//! 3. **Ratio**: recomputed as occupied / functional, within [0, 3]
//! 4. **Length of stay**: non-negative hours
//! 5. **Extraction time**: present, not ahead of now by more than the skew,
//!    not older than the facility's current snapshot
//! 6. **Encoding**: in a low-confidence buffer, identity text must be legible
//!
//! # Status Determination
//! - Stale: extraction earlier than the current snapshot (equal is valid)
//! - Quarantined: any other failed check
//! - Valid: no failed check
//!
//! The first failed check gives the reason. A reported ratio that disagrees
//! with the recomputed one is only noted; it never fails the row.

use crate::error::RowIssue;
use crate::models::{NumericCell, PreparedRow, TimestampCell};
use chrono::{DateTime, Duration, Utc};
use erq_common::models::{OccupancyMetrics, ValidationStatus};

/// Upper bound of a plausible occupancy ratio
pub const MAX_OCCUPANCY_RATIO: f64 = 3.0;

/// Allowed gap between the reported and the recomputed ratio
pub const RATIO_TOLERANCE: f64 = 0.01;

/// Validation tuning taken from `[ingest]`
#[derive(Debug, Clone, Copy)]
pub struct ValidationRules {
    pub future_skew: Duration,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            future_skew: Duration::seconds(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub status: ValidationStatus,
    /// Reason code for a non-valid status
    pub reason: Option<&'static str>,
    /// Free text for the anomaly
    pub detail: Option<String>,
    /// Failure kind of a quarantine; stale rows carry none
    pub issue: Option<RowIssue>,
}

impl Verdict {
    fn valid() -> Self {
        Self {
            status: ValidationStatus::Valid,
            reason: None,
            detail: None,
            issue: None,
        }
    }

    fn quarantined(reason: &'static str, detail: String) -> Self {
        let issue = if reason == RowIssue::DecodeFailure.as_str() {
            RowIssue::DecodeFailure
        } else {
            RowIssue::ValidationFailure
        };
        Self {
            status: ValidationStatus::Quarantined,
            reason: Some(reason),
            detail: Some(detail),
            issue: Some(issue),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.status == ValidationStatus::Valid
    }
}

/// A row ready for the history store
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRow {
    pub metrics: OccupancyMetrics,
    pub extracted_at: Option<DateTime<Utc>>,
    pub source_updated_at: Option<DateTime<Utc>>,
    pub verdict: Verdict,
    /// Reported ratio and recomputed ratio, when they disagree
    pub ratio_mismatch: Option<(f64, f64)>,
}

pub struct OccupancyValidator {
    rules: ValidationRules,
    low_confidence: bool,
}

impl OccupancyValidator {
    /// `low_confidence` comes from the buffer's encoding detection
    pub fn new(rules: ValidationRules, low_confidence: bool) -> Self {
        Self { rules, low_confidence }
    }

    /// Validate one row against the facility's current snapshot time
    pub fn validate(
        &self,
        row: &PreparedRow,
        last_extracted: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> ValidatedRow {
        let mut failure: Option<Verdict> = None;
        let mut fail = |reason: &'static str, detail: String| {
            failure.get_or_insert_with(|| Verdict::quarantined(reason, detail));
        };

        if self.low_confidence && row.garbled {
            fail(
                "low_confidence_encoding",
                "identity text is still garbled in a low-confidence buffer".to_string(),
            );
        }

        let mut count = |name: &str, cell: &NumericCell| -> Option<i64> {
            match cell {
                NumericCell::Missing => None,
                NumericCell::Invalid(raw) => {
                    fail(RowIssue::DecodeFailure.as_str(), format!("{name}: '{raw}' is not a number"));
                    None
                }
                NumericCell::Number(v) if v.fract() != 0.0 => {
                    fail("non_integer_count", format!("{name}: {v} is not an integer"));
                    None
                }
                NumericCell::Number(v) if *v < 0.0 => {
                    fail("negative_count", format!("{name}: {v} is negative"));
                    None
                }
                NumericCell::Number(v) => Some(*v as i64),
            }
        };

        let functional = count("functional_stretchers", &row.functional_stretchers);
        let occupied = count("occupied_stretchers", &row.occupied_stretchers);
        let over_24h = count("patients_over_24h", &row.patients_over_24h);
        let over_48h = count("patients_over_48h", &row.patients_over_48h);
        let total = count("total_patients", &row.total_patients);
        let waiting = count("patients_waiting", &row.patients_waiting);

        let mut hours = |name: &str, cell: &NumericCell| -> Option<f64> {
            match cell {
                NumericCell::Missing => None,
                NumericCell::Invalid(raw) => {
                    fail(RowIssue::DecodeFailure.as_str(), format!("{name}: '{raw}' is not a duration"));
                    None
                }
                NumericCell::Number(v) if *v < 0.0 => {
                    fail("negative_length_of_stay", format!("{name}: {v} hours"));
                    None
                }
                NumericCell::Number(v) => Some(*v),
            }
        };

        let stretcher_los = hours("stretcher_los", &row.stretcher_los);
        let ambulatory_los = hours("ambulatory_los", &row.ambulatory_los);
        let hourly_stretcher_los = hours("hourly_stretcher_los", &row.hourly_stretcher_los);
        let hourly_ambulatory_los = hours("hourly_ambulatory_los", &row.hourly_ambulatory_los);

        let ratio = match (occupied, functional) {
            (Some(occupied), Some(functional)) if functional > 0 => Some(occupied as f64 / functional as f64),
            _ => None,
        };
        if let Some(r) = ratio {
            if !(0.0..=MAX_OCCUPANCY_RATIO).contains(&r) {
                fail("ratio_out_of_range", format!("occupancy ratio {r:.3} outside [0, {MAX_OCCUPANCY_RATIO}]"));
            }
        }

        // reported ratio is informational; a percentage is scaled down
        let ratio_mismatch = match (row.reported_ratio.value(), ratio) {
            (Some(reported), Some(computed)) => {
                let reported = if reported > MAX_OCCUPANCY_RATIO {
                    reported / 100.0
                } else {
                    reported
                };
                ((reported - computed).abs() > RATIO_TOLERANCE).then_some((reported, computed))
            }
            _ => None,
        };

        let source_updated_at = match &row.source_updated_at {
            TimestampCell::At(ts) => Some(*ts),
            _ => None,
        };
        let extracted_at = match &row.extracted_at {
            TimestampCell::At(ts) => Some(*ts),
            TimestampCell::Missing => {
                fail("missing_extraction_time", "no extraction time".to_string());
                None
            }
            TimestampCell::Invalid(raw) => {
                fail("missing_extraction_time", format!("unparseable extraction time '{raw}'"));
                None
            }
        };
        if let Some(ts) = extracted_at {
            if ts - now > self.rules.future_skew {
                fail(
                    "future_extraction_time",
                    format!("extraction time {} is ahead of now", erq_common::time::to_db(&ts)),
                );
            }
        }

        let metrics = OccupancyMetrics {
            functional_stretchers: functional,
            occupied_stretchers: occupied,
            patients_over_24h: over_24h,
            patients_over_48h: over_48h,
            total_patients: total,
            patients_waiting: waiting,
            stretcher_los_hours: stretcher_los,
            ambulatory_los_hours: ambulatory_los,
            hourly_stretcher_los_hours: hourly_stretcher_los,
            hourly_ambulatory_los_hours: hourly_ambulatory_los,
            occupancy_ratio: ratio,
        };

        let verdict = match (failure, extracted_at, last_extracted) {
            (Some(verdict), _, _) => verdict,
            (None, Some(ts), Some(last)) if ts < last => Verdict {
                status: ValidationStatus::Stale,
                reason: Some("stale_extraction"),
                detail: Some(format!(
                    "extracted {} before current snapshot {}",
                    erq_common::time::to_db(&ts),
                    erq_common::time::to_db(&last)
                )),
                issue: None,
            },
            _ => Verdict::valid(),
        };

        ValidatedRow {
            metrics,
            extracted_at,
            source_updated_at,
            verdict,
            ratio_mismatch,
        }
    }
}
