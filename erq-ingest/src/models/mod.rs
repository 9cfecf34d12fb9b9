//! Data carried between pipeline stages

pub mod cycle;
pub mod extract_row;
pub mod matching;

pub use cycle::{CycleCommit, CycleOutcome, CycleReport};
pub use extract_row::{ExtractRow, NumericCell, PreparedRow, RawMetrics, TimestampCell};
pub use matching::{FacilityUpdate, MatchOutcome, MatchResult};
