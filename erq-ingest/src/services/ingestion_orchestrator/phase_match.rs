//! Phase: MATCHING and VALIDATING
//!
//! Serial by necessity: a facility created for one row must be found by the
//! next row naming it. Produces the commit payload and the row anomalies.

use super::{CycleState, IngestionOrchestrator};
use crate::models::{CycleCommit, FacilityUpdate, PreparedRow};
use crate::services::facility_registry::FacilityRegistry;
use crate::services::record_matcher::RecordMatcher;
use crate::validators::OccupancyValidator;
use chrono::{DateTime, Utc};
use erq_common::models::{HistoryEntry, IngestionAnomaly, OccupancySnapshot, Severity, ValidationStatus};
use std::collections::HashMap;
use uuid::Uuid;

/// Winning valid row of a facility within the cycle
struct SnapshotCandidate {
    snapshot: OccupancySnapshot,
    raw: String,
    line: usize,
}

impl IngestionOrchestrator {
    pub(super) fn phase_match(
        &self,
        state: &mut CycleState,
        registry: &mut FacilityRegistry,
        rows: Vec<PreparedRow>,
        low_confidence: bool,
        now: DateTime<Utc>,
    ) -> CycleCommit {
        let cycle_id = state.cycle_id;
        let matcher = RecordMatcher::new(cycle_id).with_directory(self.directory.clone());
        let validator = OccupancyValidator::new(self.settings.rules, low_confidence);

        let mut commit = CycleCommit {
            cycle_id,
            ..Default::default()
        };
        let mut updates: Vec<FacilityUpdate> = Vec::new();
        let mut update_index: HashMap<Uuid, usize> = HashMap::new();
        let mut winners: HashMap<Uuid, SnapshotCandidate> = HashMap::new();

        for row in rows {
            let result = matcher.match_row(registry, &row);
            let facility_id = result.facility_id;
            state.anomalies.extend(result.anomalies);

            if let Some(created) = result.created {
                commit.new_facilities.push(created);
            }
            if let Some(update) = result.update {
                // last observation of a facility wins
                match update_index.get(&update.facility_id) {
                    Some(&i) => updates[i] = update,
                    None => {
                        update_index.insert(update.facility_id, updates.len());
                        updates.push(update);
                    }
                }
            }

            state.report.fields_repaired += row.repaired_fields;
            let validated = validator.validate(&row, registry.last_extracted(&facility_id), now);

            if let Some((reported, computed)) = validated.ratio_mismatch {
                state.anomalies.push(
                    IngestionAnomaly::new(cycle_id, "reported_ratio_mismatch", Severity::Info, &row.raw)
                        .with_facility(facility_id)
                        .with_detail(format!("reported {reported:.3}, computed {computed:.3}")),
                );
            }

            let verdict = &validated.verdict;
            match verdict.status {
                ValidationStatus::Valid => state.report.rows_valid += 1,
                ValidationStatus::Quarantined => state.report.rows_quarantined += 1,
                ValidationStatus::Stale => state.report.rows_stale += 1,
            }
            if let Some(reason) = verdict.reason {
                let severity = match verdict.status {
                    ValidationStatus::Stale => Severity::Info,
                    _ => Severity::Warning,
                };
                tracing::debug!(line = row.line, facility_id = %facility_id, reason, "Row not valid");
                let mut anomaly = IngestionAnomaly::new(cycle_id, reason, severity, &row.raw).with_facility(facility_id);
                match (verdict.issue, &verdict.detail) {
                    (Some(issue), Some(detail)) => anomaly = anomaly.with_detail(format!("{}: {detail}", issue.as_str())),
                    (None, Some(detail)) => anomaly = anomaly.with_detail(detail.clone()),
                    _ => {}
                }
                state.anomalies.push(anomaly);
            }

            commit.history.push(HistoryEntry {
                facility_id,
                cycle_id,
                metrics: validated.metrics.clone(),
                extracted_at: validated.extracted_at,
                source_updated_at: validated.source_updated_at,
                status: verdict.status,
                reason: verdict.reason.map(str::to_string),
                recorded_at: now,
            });

            let (ValidationStatus::Valid, Some(extracted_at)) = (verdict.status, validated.extracted_at) else {
                continue;
            };
            let candidate = SnapshotCandidate {
                snapshot: OccupancySnapshot {
                    facility_id,
                    metrics: validated.metrics,
                    extracted_at,
                    source_updated_at: validated.source_updated_at,
                    cycle_id,
                },
                raw: row.raw,
                line: row.line,
            };
            self.keep_latest(state, &mut winners, candidate);
        }

        commit.facility_updates = updates;
        let mut snapshots: Vec<OccupancySnapshot> = winners.into_values().map(|c| c.snapshot).collect();
        snapshots.sort_by_key(|s| s.facility_id);
        commit.snapshots = snapshots;

        state.report.facilities_created = commit.new_facilities.len();
        state.report.facilities_updated = commit.facility_updates.len();
        commit
    }

    /// Latest extraction wins; equal times go to the later row
    fn keep_latest(
        &self,
        state: &mut CycleState,
        winners: &mut HashMap<Uuid, SnapshotCandidate>,
        candidate: SnapshotCandidate,
    ) {
        let facility_id = candidate.snapshot.facility_id;
        let loser = match winners.remove(&facility_id) {
            Some(current) if current.snapshot.extracted_at > candidate.snapshot.extracted_at => {
                winners.insert(facility_id, current);
                candidate
            }
            Some(current) => {
                winners.insert(facility_id, candidate);
                current
            }
            None => {
                winners.insert(facility_id, candidate);
                return;
            }
        };

        tracing::debug!(line = loser.line, facility_id = %facility_id, "Row superseded within cycle");
        state.anomalies.push(
            IngestionAnomaly::new(state.cycle_id, "superseded_in_cycle", Severity::Info, &loser.raw)
                .with_facility(facility_id)
                .with_detail(format!(
                    "a later extraction of this facility in the same cycle replaced line {}",
                    loser.line
                )),
        );
    }
}
