//! Extract reader
//!
//! Turns the decoded buffer into [`ExtractRow`]s. Columns are located by the
//! canonical form of their header, so "Nom_établissement", "Nom etablissement"
//! and "NOM_ETABLISSEMENT" all map to the same field. Records that cannot be
//! read as a row are returned as [`RejectedRow`]s and never reach matching.

use crate::error::{IngestError, IngestResult};
use crate::models::{ExtractRow, RawMetrics};
use csv::{ReaderBuilder, StringRecord, Trim};
use erq_common::canon::canonicalize;
use std::collections::HashMap;
use std::str::FromStr;

/// Column layouts the reader understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaVersion {
    /// Hourly MSSS extract ("Releve_horaire_urgences")
    V1,
}

impl FromStr for SchemaVersion {
    type Err = IngestError;

    fn from_str(s: &str) -> IngestResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "v1" | "1" => Ok(SchemaVersion::V1),
            other => Err(IngestError::SchemaMismatch(format!("unsupported schema version '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    RegionCode,
    RegionName,
    EstablishmentName,
    InstallationName,
    PermitNumber,
    SourceId,
    FunctionalStretchers,
    OccupiedStretchers,
    PatientsOver24h,
    PatientsOver48h,
    TotalPatients,
    PatientsWaiting,
    StretcherLos,
    AmbulatoryLos,
    HourlyStretcherLos,
    HourlyAmbulatoryLos,
    ExtractionTime,
    SourceUpdated,
    ReportedRatio,
}

impl Field {
    /// Canonical header names, see `erq_common::canon`
    fn from_header_key(key: &str) -> Option<Field> {
        let field = match key {
            "rss" | "code rss" | "no rss" => Field::RegionCode,
            "region" | "nom region" | "region sociosanitaire" => Field::RegionName,
            "nom etablissement" | "etablissement" => Field::EstablishmentName,
            "nom installation" | "installation" => Field::InstallationName,
            "no permis installation" | "numero permis installation" | "no permis" => Field::PermitNumber,
            "source id" | "id source" | "identifiant" | "id" => Field::SourceId,
            "nombre de civieres fonctionnelles" | "civieres fonctionnelles" => Field::FunctionalStretchers,
            "nombre de civieres occupees" | "civieres occupees" => Field::OccupiedStretchers,
            "nombre de patients sur civiere plus de 24 heures" | "patients 24h" => Field::PatientsOver24h,
            "nombre de patients sur civiere plus de 48 heures" | "patients 48h" => Field::PatientsOver48h,
            "nombre total de patients presents a lurgence"
            | "nombre total de patients presents a l urgence"
            | "total patients" => Field::TotalPatients,
            "nombre total de patients en attente de pec" | "patients en attente" => Field::PatientsWaiting,
            "dms sur civiere" | "dms civiere" => Field::StretcherLos,
            "dms ambulatoire" => Field::AmbulatoryLos,
            "dms sur civiere horaire" | "dms civiere horaire" => Field::HourlyStretcherLos,
            "dms ambulatoire horaire" => Field::HourlyAmbulatoryLos,
            "heure de l extraction image" | "heure de l extraction" | "heure extraction" => Field::ExtractionTime,
            "mise a jour" | "date maj" | "date de mise a jour" => Field::SourceUpdated,
            "taux occupation" | "taux d occupation" | "taux doccupation" => Field::ReportedRatio,
            _ => return None,
        };
        Some(field)
    }
}

/// A record excluded before matching; counts as rejected, not parsed
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRow {
    pub line: usize,
    pub raw: String,
    pub reason: &'static str,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractTable {
    pub delimiter: u8,
    pub columns: HashMap<Field, usize>,
    pub rows: Vec<ExtractRow>,
    pub rejected: Vec<RejectedRow>,
}

/// Pick the delimiter that splits the header line the most
pub fn detect_delimiter(text: &str) -> u8 {
    let header = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let mut best = b',';
    let mut best_count = 0;
    for candidate in [b',', b';', b'\t', b'|'] {
        let count = header.bytes().filter(|b| *b == candidate).count();
        if count > best_count {
            best = candidate;
            best_count = count;
        }
    }
    best
}

pub fn read_extract(text: &str, schema: SchemaVersion) -> IngestResult<ExtractTable> {
    if text.trim().is_empty() {
        return Err(IngestError::SourceUnavailable("extract is empty".to_string()));
    }

    let delimiter = detect_delimiter(text);
    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(text.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| IngestError::SourceUnavailable(format!("unreadable header row: {e}")))?
        .clone();
    let columns = map_columns(&headers);
    check_schema(schema, &columns, &headers)?;

    let separator = (delimiter as char).to_string();
    let mut rows = Vec::new();
    let mut rejected = Vec::new();
    let mut record = StringRecord::new();
    let mut line = 0;

    loop {
        match reader.read_record(&mut record) {
            Ok(false) => break,
            Ok(true) => {
                line += 1;
                let raw = record.iter().collect::<Vec<_>>().join(&separator);

                if record.len() < headers.len() {
                    rejected.push(RejectedRow {
                        line,
                        raw,
                        reason: "truncated_row",
                        detail: format!("{} of {} fields", record.len(), headers.len()),
                    });
                    continue;
                }

                let row = build_row(line, raw, &record, &columns);
                if !row.has_identity() {
                    rejected.push(RejectedRow {
                        line,
                        raw: row.raw,
                        reason: "missing_identity",
                        detail: "no establishment, installation, permit or source id".to_string(),
                    });
                    continue;
                }
                rows.push(row);
            }
            Err(e) => {
                line += 1;
                rejected.push(RejectedRow {
                    line,
                    raw: String::new(),
                    reason: "unreadable_row",
                    detail: e.to_string(),
                });
            }
        }
    }

    tracing::debug!(
        delimiter = %(delimiter as char),
        rows = rows.len(),
        rejected = rejected.len(),
        "Read extract"
    );

    Ok(ExtractTable {
        delimiter,
        columns,
        rows,
        rejected,
    })
}

fn map_columns(headers: &StringRecord) -> HashMap<Field, usize> {
    let mut columns = HashMap::new();
    for (index, header) in headers.iter().enumerate() {
        let key = canonicalize(header.trim_start_matches('\u{FEFF}'));
        if let Some(field) = Field::from_header_key(&key) {
            // first occurrence wins when a header repeats
            columns.entry(field).or_insert(index);
        }
    }
    columns
}

fn check_schema(schema: SchemaVersion, columns: &HashMap<Field, usize>, headers: &StringRecord) -> IngestResult<()> {
    match schema {
        SchemaVersion::V1 => {
            let mut missing = Vec::new();
            if !columns.contains_key(&Field::EstablishmentName) && !columns.contains_key(&Field::InstallationName) {
                missing.push("Nom_etablissement or Nom_installation");
            }
            if !columns.contains_key(&Field::FunctionalStretchers) {
                missing.push("Nombre_de_civieres_fonctionnelles");
            }
            if !columns.contains_key(&Field::OccupiedStretchers) {
                missing.push("Nombre_de_civieres_occupees");
            }
            if !columns.contains_key(&Field::ExtractionTime) && !columns.contains_key(&Field::SourceUpdated) {
                missing.push("Heure_de_l'extraction_(image) or Mise_a_jour");
            }

            if missing.is_empty() {
                Ok(())
            } else {
                Err(IngestError::SchemaMismatch(format!(
                    "missing columns [{}] in header [{}]",
                    missing.join(", "),
                    headers.iter().collect::<Vec<_>>().join(", ")
                )))
            }
        }
    }
}

fn build_row(line: usize, raw: String, record: &StringRecord, columns: &HashMap<Field, usize>) -> ExtractRow {
    let cell = |field: Field| -> Option<String> {
        columns
            .get(&field)
            .and_then(|&i| record.get(i))
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    ExtractRow {
        line,
        raw,
        region_code: cell(Field::RegionCode),
        region_name: cell(Field::RegionName),
        establishment_name: cell(Field::EstablishmentName),
        installation_name: cell(Field::InstallationName),
        permit_number: cell(Field::PermitNumber),
        source_id: cell(Field::SourceId),
        metrics: RawMetrics {
            functional_stretchers: cell(Field::FunctionalStretchers),
            occupied_stretchers: cell(Field::OccupiedStretchers),
            patients_over_24h: cell(Field::PatientsOver24h),
            patients_over_48h: cell(Field::PatientsOver48h),
            total_patients: cell(Field::TotalPatients),
            patients_waiting: cell(Field::PatientsWaiting),
            stretcher_los: cell(Field::StretcherLos),
            ambulatory_los: cell(Field::AmbulatoryLos),
            hourly_stretcher_los: cell(Field::HourlyStretcherLos),
            hourly_ambulatory_los: cell(Field::HourlyAmbulatoryLos),
            reported_ratio: cell(Field::ReportedRatio),
        },
        extraction_time: cell(Field::ExtractionTime),
        source_updated: cell(Field::SourceUpdated),
    }
}
