//! Error types for erq-recommend
//!
//! A query that finds nothing fresh enough is not an error: it returns an
//! empty list.

use thiserror::Error;
use uuid::Uuid;

pub type RecommendResult<T> = std::result::Result<T, RecommendError>;

#[derive(Debug, Error)]
pub enum RecommendError {
    /// Origin facility id is not in the registry
    #[error("Unknown origin facility: {0}")]
    UnknownOrigin(Uuid),

    /// Origin facility exists but has no coordinates yet
    #[error("Origin facility {0} has no location")]
    OriginWithoutLocation(Uuid),

    /// Radius, result count or coordinate out of range
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Store error: {0}")]
    Store(#[from] erq_common::Error),
}

impl From<sqlx::Error> for RecommendError {
    fn from(err: sqlx::Error) -> Self {
        RecommendError::Store(erq_common::Error::Store(err))
    }
}
