//! # ERQ Common Library
//!
//! Shared code for the emergency-room occupancy services:
//! - Error and result types
//! - TOML configuration and root folder resolution
//! - Logging setup
//! - Name canonicalization and geodesic helpers
//! - Domain models (regions, facilities, occupancy snapshots, anomalies)
//! - Event types (ErqEvent) and the broadcast event bus
//! - Database initialization and region seed data

pub mod canon;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod geo;
pub mod logging;
pub mod models;
pub mod time;

pub use error::{Error, Result};
