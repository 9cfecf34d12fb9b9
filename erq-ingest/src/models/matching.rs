//! Record matcher results

use erq_common::models::{Facility, IngestionAnomaly};
use uuid::Uuid;

/// How a row was linked to a facility, in precedence order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    ExactId,
    ExactPermit,
    NameExact,
    /// Several facilities shared the canonical name; tie-break applied
    NameAmbiguous { candidates: usize },
    New,
}

impl MatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchOutcome::ExactId => "exact_id",
            MatchOutcome::ExactPermit => "exact_permit",
            MatchOutcome::NameExact => "name_exact",
            MatchOutcome::NameAmbiguous { .. } => "name_ambiguous",
            MatchOutcome::New => "new",
        }
    }
}

/// Changes to a known facility observed in this cycle
#[derive(Debug, Clone, PartialEq)]
pub struct FacilityUpdate {
    pub facility_id: Uuid,
    pub establishment_name: String,
    pub establishment_key: String,
    pub installation_name: Option<String>,
    pub installation_key: Option<String>,
    pub region_code: Option<String>,
    pub source_id: Option<String>,
    pub permit_number: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MatchResult {
    pub facility_id: Uuid,
    pub outcome: MatchOutcome,
    /// Set when `outcome` is `New`
    pub created: Option<Facility>,
    pub update: Option<FacilityUpdate>,
    pub anomalies: Vec<IngestionAnomaly>,
}
