//! Error types for erq-ingest
//!
//! Cycle-level failures abort a cycle and leave the current snapshots as
//! they were. Row-level problems never abort a cycle; they are described by
//! [`RowIssue`] and persisted as anomalies.

use thiserror::Error;

/// Result type for ingestion operations
pub type IngestResult<T> = std::result::Result<T, IngestError>;

#[derive(Debug, Error)]
pub enum IngestError {
    /// Fetch failed after retries, or the buffer held no usable rows
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// Header row lacks columns the configured schema version requires
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// The snapshot transaction rolled back
    #[error("Commit failure: {0}")]
    CommitFailure(String),

    /// Repository error outside the commit transaction
    #[error("Store error: {0}")]
    Store(#[from] erq_common::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        IngestError::Store(erq_common::Error::Store(err))
    }
}

/// Row-level failure kinds, recorded as anomalies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowIssue {
    /// A cell could not be decoded into the expected type
    DecodeFailure,
    /// Several facilities matched; the tie-break picked one
    MatchAmbiguous,
    /// A row parsed but failed a validation rule
    ValidationFailure,
}

impl RowIssue {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowIssue::DecodeFailure => "decode_failure",
            RowIssue::MatchAmbiguous => "match_ambiguous",
            RowIssue::ValidationFailure => "validation_failure",
        }
    }
}
