//! Row validators

pub mod occupancy_validator;

pub use occupancy_validator::{OccupancyValidator, ValidatedRow, ValidationRules, Verdict};
