//! Common error types for ERQ

use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Common result type for ERQ operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Extract, directory or config file could not be read or created
    #[error("File access error: {0}")]
    FileAccess(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// No database at the resolved root folder
    #[error("Database not found: {} (run erq-ingest first to create it)", .0.display())]
    MissingDatabase(PathBuf),

    #[error("Unknown facility: {0}")]
    UnknownFacility(Uuid),

    /// Latitude or longitude outside WGS84 bounds
    #[error("Invalid coordinate: {0}")]
    InvalidCoordinate(String),

    /// Stored id, timestamp or status that no longer parses
    #[error("Corrupt record: {0}")]
    CorruptRecord(String),
}
