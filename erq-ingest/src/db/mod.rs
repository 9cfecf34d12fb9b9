//! Database access for erq-ingest

pub mod store;

pub use store::{IngestStore, IngestionLease, SqliteIngestStore};
