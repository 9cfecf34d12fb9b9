//! Configuration loading and root folder resolution
//!
//! Every service reads the same TOML file. Missing files are not fatal: a
//! warning is logged and compiled defaults are used.
//!
//! Root folder priority order:
//! 1. Command-line argument (highest priority)
//! 2. `ERQ_ROOT_FOLDER` environment variable
//! 3. `root_folder` key of the TOML config file
//! 4. OS-dependent compiled default (fallback)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable overriding the root folder
pub const ROOT_FOLDER_ENV: &str = "ERQ_ROOT_FOLDER";

/// Environment variable overriding the config file location
pub const CONFIG_FILE_ENV: &str = "ERQ_CONFIG";

/// Default open-data extract published hourly
pub const DEFAULT_SOURCE_URL: &str =
    "https://www.msss.gouv.qc.ca/professionnels/statistiques/documents/urgences/Releve_horaire_urgences_7jours.csv";

/// Top-level TOML configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TomlConfig {
    pub root_folder: Option<PathBuf>,
    pub logging: LoggingConfig,
    pub source: SourceConfig,
    pub ingest: IngestConfig,
    pub recommend: RecommendConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Upstream occupancy feed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SourceConfig {
    /// Lease key and provenance label
    pub name: String,
    /// `http(s)://` URL or local file path
    pub location: String,
    /// Column layout the reader expects
    pub schema_version: String,
    /// Offset applied to naive timestamps in the extract
    pub utc_offset_minutes: i32,
    /// Optional facility reference CSV used to enrich new facilities
    pub facility_directory: Option<PathBuf>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            name: "msss-urgences".to_string(),
            location: DEFAULT_SOURCE_URL.to_string(),
            schema_version: "v1".to_string(),
            utc_offset_minutes: -300,
            facility_directory: None,
        }
    }
}

/// Ingestion cycle tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IngestConfig {
    pub interval_secs: u64,
    pub worker_pool_size: usize,
    pub fetch_timeout_secs: u64,
    pub retry_attempts: u32,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
    pub lease_ttl_secs: u64,
    pub future_skew_secs: i64,
    pub low_confidence_threshold: f64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            worker_pool_size: 4,
            fetch_timeout_secs: 30,
            retry_attempts: 4,
            retry_initial_ms: 500,
            retry_max_ms: 8000,
            lease_ttl_secs: 900,
            future_skew_secs: 60,
            low_confidence_threshold: 0.7,
        }
    }
}

/// Recommendation ranking defaults
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecommendConfig {
    pub freshness_window_minutes: i64,
    /// Ratios within this distance of a group's lowest ratio rank by distance
    pub tie_tolerance: f64,
    pub default_radius_meters: f64,
    pub default_max_results: usize,
    pub max_results_cap: usize,
}

impl Default for RecommendConfig {
    fn default() -> Self {
        Self {
            freshness_window_minutes: 90,
            tie_tolerance: 0.05,
            default_radius_meters: 25_000.0,
            default_max_results: 5,
            max_results_cap: 10,
        }
    }
}

impl TomlConfig {
    /// Reject values that would make a service misbehave silently
    pub fn validate(&self) -> Result<()> {
        if self.source.name.trim().is_empty() {
            return Err(Error::InvalidConfig("source.name must not be empty".to_string()));
        }
        if self.source.location.trim().is_empty() {
            return Err(Error::InvalidConfig("source.location must not be empty".to_string()));
        }
        if self.ingest.worker_pool_size == 0 {
            return Err(Error::InvalidConfig("ingest.worker_pool_size must be at least 1".to_string()));
        }
        if self.ingest.retry_attempts == 0 {
            return Err(Error::InvalidConfig("ingest.retry_attempts must be at least 1".to_string()));
        }
        if self.ingest.interval_secs == 0 || self.ingest.lease_ttl_secs == 0 {
            return Err(Error::InvalidConfig(
                "ingest.interval_secs and ingest.lease_ttl_secs must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.ingest.low_confidence_threshold) {
            return Err(Error::InvalidConfig(
                "ingest.low_confidence_threshold must be within [0, 1]".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.recommend.tie_tolerance) {
            return Err(Error::InvalidConfig("recommend.tie_tolerance must be within [0, 1)".to_string()));
        }
        let minutes = self.recommend.freshness_window_minutes;
        if minutes <= 0 || chrono::Duration::try_minutes(minutes).is_none() {
            return Err(Error::InvalidConfig(
                "recommend.freshness_window_minutes must be positive and representable".to_string(),
            ));
        }
        if self.recommend.max_results_cap == 0 {
            return Err(Error::InvalidConfig("recommend.max_results_cap must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Platform defaults used when nothing else is configured
#[derive(Debug, Clone)]
pub struct CompiledDefaults {
    pub root_folder: PathBuf,
    pub config_file: Option<PathBuf>,
    pub log_level: String,
}

impl CompiledDefaults {
    pub fn for_current_platform() -> Self {
        let root_folder = if cfg!(target_os = "linux") {
            dirs::data_local_dir()
                .map(|d| d.join("erq"))
                .unwrap_or_else(|| PathBuf::from("/var/lib/erq"))
        } else if cfg!(target_os = "macos") {
            dirs::data_dir()
                .map(|d| d.join("erq"))
                .unwrap_or_else(|| PathBuf::from("/Library/Application Support/erq"))
        } else if cfg!(target_os = "windows") {
            dirs::data_local_dir()
                .map(|d| d.join("erq"))
                .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\erq"))
        } else {
            PathBuf::from("./erq_data")
        };

        Self {
            root_folder,
            config_file: dirs::config_dir().map(|d| d.join("erq").join("config.toml")),
            log_level: "info".to_string(),
        }
    }
}

/// Location of the config file: explicit path, then `ERQ_CONFIG`, then the
/// platform config directory
pub fn config_file_path(cli_arg: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }
    if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    CompiledDefaults::for_current_platform().config_file
}

/// Load the TOML config, falling back to defaults when the file is missing
///
/// A file that exists but fails to parse or validate is an error.
pub fn load_toml_config(path: Option<&Path>) -> Result<TomlConfig> {
    let Some(path) = path else {
        warn!("No config file location available, using defaults");
        return Ok(TomlConfig::default());
    };

    if !path.exists() {
        warn!("Config file not found at {}, using defaults", path.display());
        return Ok(TomlConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: TomlConfig = toml::from_str(&content)
        .map_err(|e| Error::InvalidConfig(format!("Failed to parse {}: {}", path.display(), e)))?;
    config.validate()?;

    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

/// Resolves the root folder holding the database
pub struct RootFolderResolver {
    module_name: String,
    cli_arg: Option<PathBuf>,
    toml_root: Option<PathBuf>,
}

impl RootFolderResolver {
    pub fn new(module_name: &str) -> Self {
        Self {
            module_name: module_name.to_string(),
            cli_arg: None,
            toml_root: None,
        }
    }

    pub fn with_cli_arg(mut self, cli_arg: Option<PathBuf>) -> Self {
        self.cli_arg = cli_arg;
        self
    }

    pub fn with_toml(mut self, config: &TomlConfig) -> Self {
        self.toml_root = config.root_folder.clone();
        self
    }

    pub fn resolve(&self) -> PathBuf {
        if let Some(path) = &self.cli_arg {
            info!(module = %self.module_name, "Root folder from command line: {}", path.display());
            return path.clone();
        }

        if let Ok(path) = std::env::var(ROOT_FOLDER_ENV) {
            if !path.trim().is_empty() {
                info!(module = %self.module_name, "Root folder from {}: {}", ROOT_FOLDER_ENV, path);
                return PathBuf::from(path);
            }
        }

        if let Some(path) = &self.toml_root {
            info!(module = %self.module_name, "Root folder from config file: {}", path.display());
            return path.clone();
        }

        let default = CompiledDefaults::for_current_platform().root_folder;
        info!(module = %self.module_name, "Root folder default: {}", default.display());
        default
    }
}

/// Creates the root folder and locates the database inside it
pub struct RootFolderInitializer {
    root_folder: PathBuf,
}

impl RootFolderInitializer {
    pub fn new(root_folder: PathBuf) -> Self {
        Self { root_folder }
    }

    pub fn ensure_directory(&self) -> Result<()> {
        if !self.root_folder.exists() {
            std::fs::create_dir_all(&self.root_folder)?;
            info!("Created root folder: {}", self.root_folder.display());
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.root_folder.join("erq.db")
    }
}
