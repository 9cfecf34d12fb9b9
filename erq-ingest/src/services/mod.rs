//! Ingestion services

pub mod cell_parser;
pub mod encoding_normalizer;
pub mod extract_reader;
pub mod facility_directory;
pub mod facility_registry;
pub mod ingestion_orchestrator;
pub mod record_matcher;
pub mod scheduler;
pub mod source_fetcher;

pub use encoding_normalizer::{detect_and_decode, repair_mojibake, DecodedText};
pub use extract_reader::{read_extract, ExtractTable, SchemaVersion};
pub use facility_directory::FacilityDirectory;
pub use facility_registry::FacilityRegistry;
pub use ingestion_orchestrator::{IngestSettings, IngestionOrchestrator};
pub use record_matcher::RecordMatcher;
pub use scheduler::run_schedule;
pub use source_fetcher::{fetcher_for, FetchedSource, FileFetcher, HttpFetcher, SourceFetcher};
