//! Facility reference directory
//!
//! Reads a reference list of healthcare facilities (the Open Database of
//! Healthcare Facilities layout, or any CSV with name and coordinate
//! columns) and answers "where is this facility" by canonical name. Used to
//! give new facilities an address and a location, and to back-fill
//! facilities that were created without one.

use crate::error::{IngestError, IngestResult};
use csv::{ReaderBuilder, StringRecord, Trim};
use erq_common::canon::canonicalize;
use erq_common::db::facilities::{facilities_without_location, update_facility_location};
use erq_common::geo::GeoPoint;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info};

/// Shortest canonical key considered for containment lookups
const MIN_CONTAINMENT_KEY_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryEntry {
    pub name: String,
    pub key: String,
    pub address: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub province: Option<String>,
    pub location: Option<GeoPoint>,
}

#[derive(Debug, Default, Clone)]
pub struct FacilityDirectory {
    entries: Vec<DirectoryEntry>,
    by_key: HashMap<String, usize>,
}

/// Full province name for a two-letter code; other values pass through
pub fn normalize_province(raw: &str) -> String {
    match raw.trim().to_ascii_uppercase().as_str() {
        "QC" | "PQ" | "QUE" => "Québec".to_string(),
        "ON" | "ONT" => "Ontario".to_string(),
        "NB" => "Nouveau-Brunswick".to_string(),
        "NS" => "Nouvelle-Écosse".to_string(),
        "PE" => "Île-du-Prince-Édouard".to_string(),
        "NL" => "Terre-Neuve-et-Labrador".to_string(),
        "MB" => "Manitoba".to_string(),
        "SK" => "Saskatchewan".to_string(),
        "AB" => "Alberta".to_string(),
        "BC" => "Colombie-Britannique".to_string(),
        "YT" => "Yukon".to_string(),
        "NT" => "Territoires du Nord-Ouest".to_string(),
        "NU" => "Nunavut".to_string(),
        _ => raw.trim().to_string(),
    }
}

#[derive(Default)]
struct Columns {
    name: Option<usize>,
    address: Option<usize>,
    street_no: Option<usize>,
    street_name: Option<usize>,
    city: Option<usize>,
    postal_code: Option<usize>,
    province: Option<usize>,
    latitude: Option<usize>,
    longitude: Option<usize>,
}

impl Columns {
    fn from_headers(headers: &StringRecord) -> Self {
        let mut columns = Columns::default();
        for (i, header) in headers.iter().enumerate() {
            let slot = match canonicalize(header).as_str() {
                "facility name" | "name" | "nom" | "nom installation" | "nom etablissement" => &mut columns.name,
                "source format str address" | "address" | "adresse" | "street address" => &mut columns.address,
                "street no" => &mut columns.street_no,
                "street name" => &mut columns.street_name,
                "city" | "ville" | "municipalite" => &mut columns.city,
                "postal code" | "code postal" => &mut columns.postal_code,
                "province" | "province or territory" => &mut columns.province,
                "latitude" | "lat" => &mut columns.latitude,
                "longitude" | "lon" | "lng" => &mut columns.longitude,
                _ => continue,
            };
            slot.get_or_insert(i);
        }
        columns
    }
}

impl FacilityDirectory {
    pub fn from_path(path: &Path) -> IngestResult<Self> {
        let file = std::fs::File::open(path).map_err(erq_common::Error::FileAccess)?;
        let directory = Self::from_reader(file)?;
        info!(entries = directory.len(), "Loaded facility directory from {}", path.display());
        Ok(directory)
    }

    pub fn from_reader<R: Read>(reader: R) -> IngestResult<Self> {
        let mut csv_reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(Trim::All)
            .from_reader(reader);

        let headers = csv_reader
            .headers()
            .map_err(|e| IngestError::SchemaMismatch(format!("unreadable directory header: {e}")))?
            .clone();
        let columns = Columns::from_headers(&headers);
        let Some(name_col) = columns.name else {
            return Err(IngestError::SchemaMismatch("facility directory has no name column".to_string()));
        };

        let mut directory = FacilityDirectory::default();
        for record in csv_reader.records() {
            let Ok(record) = record else {
                continue;
            };
            let get = |col: Option<usize>| {
                col.and_then(|i| record.get(i))
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
            };

            let Some(name) = get(Some(name_col)) else {
                continue;
            };
            let address = get(columns.address).or_else(|| {
                match (get(columns.street_no), get(columns.street_name)) {
                    (Some(no), Some(street)) => Some(format!("{no} {street}")),
                    (None, Some(street)) => Some(street),
                    _ => None,
                }
            });
            let location = GeoPoint::from_parts(
                get(columns.latitude).and_then(|v| v.replace(',', ".").parse().ok()),
                get(columns.longitude).and_then(|v| v.replace(',', ".").parse().ok()),
            );

            directory.push(DirectoryEntry {
                key: canonicalize(&name),
                name,
                address,
                city: get(columns.city),
                postal_code: get(columns.postal_code),
                province: get(columns.province).map(|p| normalize_province(&p)),
                location,
            });
        }
        Ok(directory)
    }

    fn push(&mut self, entry: DirectoryEntry) {
        if entry.key.is_empty() {
            return;
        }
        let index = self.entries.len();
        // keep the first entry carrying a location for a duplicated key
        match self.by_key.get(&entry.key) {
            Some(&existing) if self.entries[existing].location.is_some() || entry.location.is_none() => {}
            _ => {
                self.by_key.insert(entry.key.clone(), index);
            }
        }
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry for a facility name: exact canonical key, then key containment
    pub fn lookup(&self, name: &str) -> Option<&DirectoryEntry> {
        let key = canonicalize(name);
        if key.is_empty() {
            return None;
        }
        if let Some(&i) = self.by_key.get(&key) {
            return Some(&self.entries[i]);
        }
        if key.len() < MIN_CONTAINMENT_KEY_LEN {
            return None;
        }

        // closest length wins; ties go to the earlier entry
        self.entries
            .iter()
            .filter(|e| e.location.is_some() && e.key.len() >= MIN_CONTAINMENT_KEY_LEN)
            .filter(|e| e.key.contains(&key) || key.contains(&e.key))
            .min_by_key(|e| e.key.len().abs_diff(key.len()))
    }
}

/// Give located directory matches to facilities that have no coordinates
///
/// Returns the number of facilities updated.
pub async fn backfill_locations(pool: &SqlitePool, directory: &FacilityDirectory) -> IngestResult<usize> {
    let mut updated = 0;
    for facility in facilities_without_location(pool).await? {
        let entry = facility
            .installation_name
            .as_deref()
            .and_then(|n| directory.lookup(n))
            .or_else(|| directory.lookup(&facility.establishment_name));

        let Some(entry) = entry else {
            debug!(facility_id = %facility.id, name = facility.display_name(), "No directory entry");
            continue;
        };
        let Some(location) = entry.location else {
            continue;
        };

        if update_facility_location(
            pool,
            facility.id,
            location,
            entry.address.as_deref(),
            entry.city.as_deref(),
            entry.postal_code.as_deref(),
        )
        .await?
        {
            updated += 1;
        }
    }

    info!(updated, "Back-filled facility locations");
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ODHF: &str = "facility_name,source_facility_type,street_no,street_name,postal_code,city,province,latitude,longitude\n\
        Hôpital Notre-Dame,hospital,1560,rue Sherbrooke Est,H2L 4M1,Montréal,QC,45.5254,-73.5613\n\
        Hôpital de Gaspé,hospital,215,boulevard de York Ouest,G4X 2W2,Gaspé,qc,48.8316,-64.4869\n\
        Clinique sans coordonnées,clinic,1,rue Principale,,Laval,QC,,\n";

    #[test]
    fn reads_odhf_layout() {
        let directory = FacilityDirectory::from_reader(ODHF.as_bytes()).unwrap();
        assert_eq!(directory.len(), 3);

        let entry = directory.lookup("HOPITAL NOTRE DAME").unwrap();
        assert_eq!(entry.address.as_deref(), Some("1560 rue Sherbrooke Est"));
        assert_eq!(entry.province.as_deref(), Some("Québec"));
        assert_eq!(entry.location, Some(GeoPoint::new(45.5254, -73.5613).unwrap()));
    }

    #[test]
    fn containment_lookup_finds_longer_name() {
        let directory = FacilityDirectory::from_reader(ODHF.as_bytes()).unwrap();
        let entry = directory.lookup("Gaspé").map(|e| e.name.clone());
        // too short for containment
        assert_eq!(entry, None);

        let entry = directory.lookup("Hôpital de Gaspé (urgence)").unwrap();
        assert_eq!(entry.city.as_deref(), Some("Gaspé"));
    }

    #[test]
    fn missing_name_column_is_rejected() {
        let err = FacilityDirectory::from_reader("latitude,longitude\n1,2\n".as_bytes()).unwrap_err();
        assert!(matches!(err, IngestError::SchemaMismatch(_)));
    }

    #[test]
    fn provinces_expand() {
        assert_eq!(normalize_province("qc"), "Québec");
        assert_eq!(normalize_province("Québec"), "Québec");
    }
}
