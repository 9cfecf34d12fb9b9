//! Record Matcher
//!
//! Links a prepared row to a facility of the registry. Precedence, first hit
//! wins:
//! 1. exact source identifier
//! 2. exact permit number
//! 3. exact canonical installation name, then exact canonical establishment
//!    name; a row whose installation is unknown only falls back to
//!    establishment-level facilities, which then take that installation
//! 4. otherwise a new facility is created from the row
//!
//! Ties among several name matches prefer the facility in the row's own
//! region, then the lowest facility id, and always leave a warning anomaly.
//! Matching runs serially because new facilities must be visible to the
//! rows that follow.

use crate::error::RowIssue;
use crate::models::{FacilityUpdate, MatchOutcome, MatchResult, PreparedRow};
use crate::services::facility_directory::FacilityDirectory;
use crate::services::facility_registry::FacilityRegistry;
use chrono::Utc;
use erq_common::canon::canonicalize;
use erq_common::models::{Facility, IngestionAnomaly, Severity};
use std::sync::Arc;
use uuid::Uuid;

/// Jaro-Winkler similarity above which a new facility is flagged as a
/// possible rename of a known one
const RENAME_SIMILARITY: f64 = 0.92;

pub struct RecordMatcher {
    cycle_id: Uuid,
    directory: Option<Arc<FacilityDirectory>>,
}

impl RecordMatcher {
    pub fn new(cycle_id: Uuid) -> Self {
        Self {
            cycle_id,
            directory: None,
        }
    }

    pub fn with_directory(mut self, directory: Option<Arc<FacilityDirectory>>) -> Self {
        self.directory = directory;
        self
    }

    pub fn match_row(&self, registry: &mut FacilityRegistry, row: &PreparedRow) -> MatchResult {
        let region = registry.resolve_region(row.region_code.as_deref(), row.region_key.as_deref());
        let mut anomalies = Vec::new();

        if let Some(source_id) = row.source_id.as_deref() {
            if let Some(index) = registry.by_source_id(source_id) {
                return self.matched(registry, index, MatchOutcome::ExactId, row, region, anomalies);
            }
        }

        if let Some(permit) = row.permit_number.as_deref() {
            let candidates = registry.by_permit(permit).to_vec();
            if !candidates.is_empty() {
                let index = pick(registry, &candidates, region.as_deref());
                if candidates.len() > 1 {
                    anomalies.push(self.ambiguity(registry, index, row, candidates.len(), "permit"));
                }
                return self.matched(registry, index, MatchOutcome::ExactPermit, row, region, anomalies);
            }
        }

        let candidates = name_candidates(registry, row);
        if !candidates.is_empty() {
            let index = pick(registry, &candidates, region.as_deref());
            let outcome = if candidates.len() > 1 {
                anomalies.push(self.ambiguity(registry, index, row, candidates.len(), "name"));
                MatchOutcome::NameAmbiguous {
                    candidates: candidates.len(),
                }
            } else {
                MatchOutcome::NameExact
            };
            return self.matched(registry, index, outcome, row, region, anomalies);
        }

        self.create(registry, row, region, anomalies)
    }

    fn matched(
        &self,
        registry: &mut FacilityRegistry,
        index: usize,
        outcome: MatchOutcome,
        row: &PreparedRow,
        region: Option<String>,
        mut anomalies: Vec<IngestionAnomaly>,
    ) -> MatchResult {
        let facility = registry.at(index).clone();
        let update = self.observe_changes(&facility, outcome, row, region, &mut anomalies);
        if let Some(update) = &update {
            registry.apply_update(update);
        }

        tracing::debug!(
            line = row.line,
            facility_id = %facility.id,
            outcome = outcome.as_str(),
            "Matched row"
        );

        MatchResult {
            facility_id: facility.id,
            outcome,
            created: None,
            update,
            anomalies,
        }
    }

    /// Renames (identifier matches only) and back-filled identifiers or region
    fn observe_changes(
        &self,
        facility: &Facility,
        outcome: MatchOutcome,
        row: &PreparedRow,
        region: Option<String>,
        anomalies: &mut Vec<IngestionAnomaly>,
    ) -> Option<FacilityUpdate> {
        let mut update = FacilityUpdate {
            facility_id: facility.id,
            establishment_name: facility.establishment_name.clone(),
            establishment_key: facility.establishment_key.clone(),
            installation_name: facility.installation_name.clone(),
            installation_key: facility.installation_key.clone(),
            region_code: facility.region_code.clone(),
            source_id: facility.source_id.clone(),
            permit_number: facility.permit_number.clone(),
        };

        let by_identifier = matches!(outcome, MatchOutcome::ExactId | MatchOutcome::ExactPermit);
        if by_identifier {
            let mut renamed = Vec::new();
            if let (Some(name), Some(key)) = (&row.establishment_name, &row.establishment_key) {
                if *key != facility.establishment_key {
                    renamed.push(format!("{} -> {}", facility.establishment_name, name));
                    update.establishment_name = name.clone();
                    update.establishment_key = key.clone();
                }
            }
            if let (Some(name), Some(key)) = (&row.installation_name, &row.installation_key) {
                if Some(key) != facility.installation_key.as_ref() {
                    renamed.push(format!(
                        "{} -> {}",
                        facility.installation_name.as_deref().unwrap_or("(none)"),
                        name
                    ));
                    update.installation_name = Some(name.clone());
                    update.installation_key = Some(key.clone());
                }
            }
            if !renamed.is_empty() {
                tracing::info!(facility_id = %facility.id, changes = %renamed.join("; "), "Facility renamed");
                anomalies.push(
                    IngestionAnomaly::new(self.cycle_id, "facility_renamed", Severity::Info, &row.raw)
                        .with_facility(facility.id)
                        .with_detail(renamed.join("; ")),
                );
            }
        }

        if update.installation_key.is_none() {
            update.installation_name = row.installation_name.clone();
            update.installation_key = row.installation_key.clone();
        }
        if update.source_id.is_none() {
            update.source_id = row.source_id.clone();
        }
        if update.permit_number.is_none() {
            update.permit_number = row.permit_number.clone();
        }
        if update.region_code.is_none() {
            update.region_code = region;
        }

        let changed = update.establishment_key != facility.establishment_key
            || update.installation_key != facility.installation_key
            || update.establishment_name != facility.establishment_name
            || update.installation_name != facility.installation_name
            || update.region_code != facility.region_code
            || update.source_id != facility.source_id
            || update.permit_number != facility.permit_number;
        changed.then_some(update)
    }

    fn ambiguity(
        &self,
        registry: &FacilityRegistry,
        chosen: usize,
        row: &PreparedRow,
        candidates: usize,
        by: &str,
    ) -> IngestionAnomaly {
        let facility = registry.at(chosen);
        tracing::warn!(
            line = row.line,
            candidates,
            chosen = %facility.id,
            by,
            "Ambiguous facility match"
        );
        IngestionAnomaly::new(self.cycle_id, "ambiguous_match", Severity::Warning, &row.raw)
            .with_facility(facility.id)
            .with_detail(format!(
                "{}: {candidates} facilities share this {by}, chose {}",
                RowIssue::MatchAmbiguous.as_str(),
                facility.id
            ))
    }

    fn create(
        &self,
        registry: &mut FacilityRegistry,
        row: &PreparedRow,
        region: Option<String>,
        mut anomalies: Vec<IngestionAnomaly>,
    ) -> MatchResult {
        let establishment_name = row
            .establishment_name
            .clone()
            .unwrap_or_else(|| row.display_name().to_string());
        let establishment_key = row
            .establishment_key
            .clone()
            .unwrap_or_else(|| canonicalize(&establishment_name));

        let mut facility = Facility {
            id: Uuid::new_v4(),
            source_id: row.source_id.clone(),
            permit_number: row.permit_number.clone(),
            establishment_name,
            establishment_key,
            installation_name: row.installation_name.clone(),
            installation_key: row.installation_key.clone(),
            address: None,
            city: None,
            postal_code: None,
            province: Some("Québec".to_string()),
            region_code: region,
            location: None,
            updated_at: Utc::now(),
        };

        if let Some(directory) = &self.directory {
            let entry = facility
                .installation_name
                .as_deref()
                .and_then(|n| directory.lookup(n))
                .or_else(|| directory.lookup(&facility.establishment_name));
            if let Some(entry) = entry {
                facility.address = entry.address.clone();
                facility.city = entry.city.clone();
                facility.postal_code = entry.postal_code.clone();
                if entry.province.is_some() {
                    facility.province = entry.province.clone();
                }
                facility.location = entry.location;
            }
        }

        if let Some((known, score)) = closest_known_name(registry, &facility) {
            anomalies.push(
                IngestionAnomaly::new(self.cycle_id, "possible_rename", Severity::Info, &row.raw)
                    .with_facility(facility.id)
                    .with_detail(format!("similar to {} ({score:.3})", known)),
            );
        }

        tracing::info!(
            line = row.line,
            facility_id = %facility.id,
            name = facility.display_name(),
            region = facility.region_code.as_deref().unwrap_or("-"),
            located = facility.location.is_some(),
            "Creating facility"
        );

        registry.insert(facility.clone());
        MatchResult {
            facility_id: facility.id,
            outcome: MatchOutcome::New,
            created: Some(facility),
            update: None,
            anomalies,
        }
    }
}

/// Name-based candidates
///
/// Installation key first. Without an installation hit, rows fall back to
/// the establishment key; rows carrying an installation only accept
/// establishment-level facilities there, so two installations of one
/// establishment are never merged.
fn name_candidates(registry: &FacilityRegistry, row: &PreparedRow) -> Vec<usize> {
    if let Some(key) = row.installation_key.as_deref() {
        let by_installation = registry.by_installation_key(key);
        if !by_installation.is_empty() {
            return by_installation.to_vec();
        }
    }
    let Some(key) = row.establishment_key.as_deref() else {
        return Vec::new();
    };
    let all = registry.by_establishment_key(key);
    let establishment_level: Vec<usize> = all
        .iter()
        .copied()
        .filter(|&i| registry.at(i).installation_key.is_none())
        .collect();
    if establishment_level.is_empty() && row.installation_key.is_none() {
        all.to_vec()
    } else {
        establishment_level
    }
}

/// Same region first, then lowest id
fn pick(registry: &FacilityRegistry, candidates: &[usize], region: Option<&str>) -> usize {
    let in_region: Vec<usize> = match region {
        Some(code) => candidates
            .iter()
            .copied()
            .filter(|&i| registry.at(i).region_code.as_deref() == Some(code))
            .collect(),
        None => Vec::new(),
    };
    let pool = if in_region.is_empty() { candidates } else { &in_region[..] };
    pool.iter()
        .copied()
        .min_by_key(|&i| registry.at(i).id)
        .unwrap_or(candidates[0])
}

fn closest_known_name(registry: &FacilityRegistry, facility: &Facility) -> Option<(String, f64)> {
    let key = facility
        .installation_key
        .as_deref()
        .unwrap_or(&facility.establishment_key);
    registry
        .facilities()
        .iter()
        .map(|known| {
            let known_key = known.installation_key.as_deref().unwrap_or(&known.establishment_key);
            (known, strsim::jaro_winkler(key, known_key))
        })
        .filter(|(_, score)| *score >= RENAME_SIMILARITY)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(known, score)| (known.display_name().to_string(), score))
}
