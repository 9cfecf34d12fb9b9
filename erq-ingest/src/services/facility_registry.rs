//! In-memory facility registry used during one cycle
//!
//! Loaded from the store at cycle start. Facilities created while matching
//! are inserted at once so later rows of the same cycle find them.

use crate::models::FacilityUpdate;
use chrono::{DateTime, Utc};
use erq_common::models::{Facility, Region};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Default, Clone)]
pub struct FacilityRegistry {
    facilities: Vec<Facility>,
    index_of: HashMap<Uuid, usize>,
    by_source_id: HashMap<String, usize>,
    by_permit: HashMap<String, Vec<usize>>,
    by_installation: HashMap<String, Vec<usize>>,
    by_establishment: HashMap<String, Vec<usize>>,
    regions: HashMap<String, Region>,
    region_by_key: HashMap<String, String>,
    last_extracted: HashMap<Uuid, DateTime<Utc>>,
}

/// Identifier cell as compared by the matcher: whitespace removed, a
/// spreadsheet ".0" suffix dropped
pub fn normalize_identifier(raw: &str) -> Option<String> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let trimmed = match compact.strip_suffix(".0") {
        Some(stem) if !stem.is_empty() && stem.chars().all(|c| c.is_ascii_digit()) => stem.to_string(),
        _ => compact,
    };
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_uppercase())
    }
}

impl FacilityRegistry {
    pub fn new(
        regions: Vec<Region>,
        facilities: Vec<Facility>,
        last_extracted: HashMap<Uuid, DateTime<Utc>>,
    ) -> Self {
        let mut registry = Self {
            last_extracted,
            ..Default::default()
        };
        for region in regions {
            registry.region_by_key.insert(region.name_key.clone(), region.code.clone());
            registry.regions.insert(region.code.clone(), region);
        }
        for facility in facilities {
            registry.insert(facility);
        }
        registry
    }

    pub fn len(&self) -> usize {
        self.facilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facilities.is_empty()
    }

    pub fn get(&self, id: &Uuid) -> Option<&Facility> {
        self.index_of.get(id).map(|&i| &self.facilities[i])
    }

    pub(crate) fn at(&self, index: usize) -> &Facility {
        &self.facilities[index]
    }

    pub fn facilities(&self) -> &[Facility] {
        &self.facilities
    }

    pub fn by_source_id(&self, source_id: &str) -> Option<usize> {
        self.by_source_id.get(source_id).copied()
    }

    pub fn by_permit(&self, permit: &str) -> &[usize] {
        self.by_permit.get(permit).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn by_installation_key(&self, key: &str) -> &[usize] {
        self.by_installation.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn by_establishment_key(&self, key: &str) -> &[usize] {
        self.by_establishment.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Region code from an RSS code first, then from the canonical region name
    pub fn resolve_region(&self, code: Option<&str>, name_key: Option<&str>) -> Option<String> {
        if let Some(code) = code {
            if self.regions.contains_key(code) {
                return Some(code.to_string());
            }
        }
        name_key.and_then(|key| self.region_by_key.get(key).cloned())
    }

    /// Extraction time of the facility's current snapshot
    pub fn last_extracted(&self, id: &Uuid) -> Option<DateTime<Utc>> {
        self.last_extracted.get(id).copied()
    }

    pub fn insert(&mut self, facility: Facility) {
        let index = self.facilities.len();
        self.index_of.insert(facility.id, index);
        self.facilities.push(facility);
        self.index_facility(index);
    }

    /// Apply a rename or back-fill and refresh the indexes
    pub fn apply_update(&mut self, update: &FacilityUpdate) {
        let Some(&index) = self.index_of.get(&update.facility_id) else {
            return;
        };
        self.unindex_facility(index);

        let facility = &mut self.facilities[index];
        facility.establishment_name = update.establishment_name.clone();
        facility.establishment_key = update.establishment_key.clone();
        facility.installation_name = update.installation_name.clone();
        facility.installation_key = update.installation_key.clone();
        facility.region_code = update.region_code.clone();
        facility.source_id = update.source_id.clone();
        facility.permit_number = update.permit_number.clone();

        self.index_facility(index);
    }

    fn index_facility(&mut self, index: usize) {
        let facility = &self.facilities[index];
        if let Some(source_id) = facility.source_id.as_deref().and_then(normalize_identifier) {
            self.by_source_id.insert(source_id, index);
        }
        if let Some(permit) = facility.permit_number.as_deref().and_then(normalize_identifier) {
            self.by_permit.entry(permit).or_default().push(index);
        }
        if let Some(key) = facility.installation_key.clone().filter(|k| !k.is_empty()) {
            self.by_installation.entry(key).or_default().push(index);
        }
        if !facility.establishment_key.is_empty() {
            self.by_establishment
                .entry(facility.establishment_key.clone())
                .or_default()
                .push(index);
        }
    }

    fn unindex_facility(&mut self, index: usize) {
        let facility = &self.facilities[index];
        if let Some(source_id) = facility.source_id.as_deref().and_then(normalize_identifier) {
            self.by_source_id.remove(&source_id);
        }
        let remove = |map: &mut HashMap<String, Vec<usize>>, key: Option<String>| {
            if let Some(key) = key {
                if let Some(list) = map.get_mut(&key) {
                    list.retain(|&i| i != index);
                    if list.is_empty() {
                        map.remove(&key);
                    }
                }
            }
        };
        let permit = facility.permit_number.as_deref().and_then(normalize_identifier);
        let installation = facility.installation_key.clone();
        let establishment = Some(facility.establishment_key.clone());
        remove(&mut self.by_permit, permit);
        remove(&mut self.by_installation, installation);
        remove(&mut self.by_establishment, establishment);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use erq_common::canon::canonicalize;

    fn facility(name: &str, installation: Option<&str>) -> Facility {
        Facility {
            id: Uuid::new_v4(),
            source_id: None,
            permit_number: None,
            establishment_name: name.to_string(),
            establishment_key: canonicalize(name),
            installation_name: installation.map(str::to_string),
            installation_key: installation.map(canonicalize),
            address: None,
            city: None,
            postal_code: None,
            province: None,
            region_code: None,
            location: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn identifiers_normalize() {
        assert_eq!(normalize_identifier(" 51220983.0 ").as_deref(), Some("51220983"));
        assert_eq!(normalize_identifier("ab 12").as_deref(), Some("AB12"));
        assert_eq!(normalize_identifier("  "), None);
    }

    #[test]
    fn update_reindexes_names() {
        let mut f = facility("CSSS Ancien", Some("Hôpital Ancien"));
        f.permit_number = Some("123".to_string());
        let id = f.id;
        let mut registry = FacilityRegistry::new(vec![], vec![f], HashMap::new());

        registry.apply_update(&FacilityUpdate {
            facility_id: id,
            establishment_name: "CISSS Nouveau".to_string(),
            establishment_key: "cisss nouveau".to_string(),
            installation_name: Some("Hôpital Nouveau".to_string()),
            installation_key: Some("hopital nouveau".to_string()),
            region_code: None,
            source_id: None,
            permit_number: Some("123".to_string()),
        });

        assert!(registry.by_installation_key("hopital ancien").is_empty());
        assert_eq!(registry.by_installation_key("hopital nouveau").len(), 1);
        assert_eq!(registry.by_permit("123").len(), 1);
        assert_eq!(registry.get(&id).unwrap().establishment_name, "CISSS Nouveau");
    }

    #[test]
    fn region_resolution_prefers_code() {
        let regions = vec![
            Region { code: "06".into(), name: "Montréal".into(), name_key: "montreal".into() },
            Region { code: "13".into(), name: "Laval".into(), name_key: "laval".into() },
        ];
        let registry = FacilityRegistry::new(regions, vec![], HashMap::new());
        assert_eq!(registry.resolve_region(Some("13"), Some("montreal")).as_deref(), Some("13"));
        assert_eq!(registry.resolve_region(Some("99"), Some("montreal")).as_deref(), Some("06"));
        assert_eq!(registry.resolve_region(None, Some("gatineau")), None);
    }
}
