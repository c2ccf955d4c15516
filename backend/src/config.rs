//! Application configuration file support.
//!
//! Settings are read from a TOML file (`carbon.toml`) and then overridden by
//! `CARBON_*` environment variables. Every section has defaults, so an empty
//! file (or no file at all) yields a working local setup.

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::db::factory::RepositoryType;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// Full application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub repository: RepositorySettings,
    #[serde(default)]
    pub worker: WorkerSettings,
    #[serde(default)]
    pub reference: ReferenceSettings,
    #[serde(default)]
    pub calculation: CalculationSettings,
    #[serde(default)]
    pub server: ServerSettings,
}

/// Repository type settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositorySettings {
    #[serde(rename = "type", default = "default_repo_type")]
    pub repo_type: String,
}

impl Default for RepositorySettings {
    fn default() -> Self {
        Self {
            repo_type: default_repo_type(),
        }
    }
}

/// Job queue and worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

impl WorkerSettings {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            task_timeout_secs: default_task_timeout_secs(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

/// Location of the reference tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceSettings {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_growth_curves_file")]
    pub growth_curves_file: String,
    #[serde(default = "default_area_multipliers_file")]
    pub area_multipliers_file: String,
}

impl ReferenceSettings {
    pub fn growth_curves_path(&self) -> PathBuf {
        self.data_dir.join(&self.growth_curves_file)
    }

    pub fn area_multipliers_path(&self) -> PathBuf {
        self.data_dir.join(&self.area_multipliers_file)
    }
}

impl Default for ReferenceSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            growth_curves_file: default_growth_curves_file(),
            area_multipliers_file: default_area_multipliers_file(),
        }
    }
}

/// Numeric settings of the carbon calculation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationSettings {
    /// EPSG code all geometries are projected to before fetching rasters.
    #[serde(default = "default_working_crs")]
    pub working_crs: u32,
    /// Year the categorical variables and biomass rasters describe.
    #[serde(default = "default_variables_base_year")]
    pub variables_base_year: i32,
    #[serde(default = "default_horizon_end_year")]
    pub horizon_end_year: i32,
    #[serde(default = "default_horizon_step")]
    pub horizon_step: i32,
    /// Collections smaller than this (m²) get a buffered fetch region.
    #[serde(default = "default_small_area_threshold_m2")]
    pub small_area_threshold_m2: f64,
    #[serde(default = "default_fetch_buffer_m")]
    pub fetch_buffer_m: f64,
}

impl Default for CalculationSettings {
    fn default() -> Self {
        Self {
            working_crs: default_working_crs(),
            variables_base_year: default_variables_base_year(),
            horizon_end_year: default_horizon_end_year(),
            horizon_step: default_horizon_step(),
            small_area_threshold_m2: default_small_area_threshold_m2(),
            fetch_buffer_m: default_fetch_buffer_m(),
        }
    }
}

/// HTTP bind settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_repo_type() -> String {
    "local".to_string()
}

fn default_concurrency() -> usize {
    10
}

fn default_max_retries() -> u32 {
    2
}

fn default_task_timeout_secs() -> u64 {
    172_800
}

fn default_stale_after_secs() -> u64 {
    120
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_growth_curves_file() -> String {
    "BiomassCurves.txt".to_string()
}

fn default_area_multipliers_file() -> String {
    "area_multipliers.csv".to_string()
}

fn default_working_crs() -> u32 {
    3067
}

fn default_variables_base_year() -> i32 {
    2021
}

fn default_horizon_end_year() -> i32 {
    2095
}

fn default_horizon_step() -> i32 {
    5
}

fn default_small_area_threshold_m2() -> f64 {
    10_000.0
}

fn default_fetch_buffer_m() -> f64 {
    16.0
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Load `carbon.toml` from the first standard location that has one.
    ///
    /// Searches:
    /// 1. `CARBON_CONFIG` if set
    /// 2. Current directory
    /// 3. `backend/` directory
    ///
    /// Returns `Ok(None)` when no file exists.
    pub fn from_default_location() -> Result<Option<Self>, ConfigError> {
        if let Ok(path) = env::var("CARBON_CONFIG") {
            return Self::from_file(path).map(Some);
        }

        let search_paths = [
            PathBuf::from("carbon.toml"),
            PathBuf::from("backend/carbon.toml"),
        ];
        for path in search_paths {
            if path.exists() {
                return Self::from_file(&path).map(Some);
            }
        }
        Ok(None)
    }

    /// File configuration (or defaults) with environment overrides applied.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::from_default_location()?.unwrap_or_default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply `CARBON_*`, `HOST` and `PORT` environment overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(value) = env::var("CARBON_REPOSITORY_TYPE") {
            self.repository.repo_type = value;
        }
        override_parsed("CARBON_WORKER_CONCURRENCY", &mut self.worker.concurrency)?;
        override_parsed("CARBON_MAX_RETRIES", &mut self.worker.max_retries)?;
        override_parsed("CARBON_TASK_TIMEOUT_SECS", &mut self.worker.task_timeout_secs)?;
        override_parsed("CARBON_STALE_AFTER_SECS", &mut self.worker.stale_after_secs)?;
        if let Ok(value) = env::var("CARBON_DATA_DIR") {
            self.reference.data_dir = PathBuf::from(value);
        }
        override_parsed("CARBON_WORKING_CRS", &mut self.calculation.working_crs)?;
        override_parsed(
            "CARBON_VARIABLES_BASE_YEAR",
            &mut self.calculation.variables_base_year,
        )?;
        if let Ok(value) = env::var("HOST") {
            self.server.host = value;
        }
        override_parsed("PORT", &mut self.server.port)?;

        if self.worker.concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "worker.concurrency".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }

    /// Get the repository type from configuration.
    pub fn repository_type(&self) -> Result<RepositoryType, ConfigError> {
        RepositoryType::from_str(&self.repository.repo_type).map_err(|_| {
            ConfigError::InvalidValue {
                key: "repository.type".to_string(),
                value: self.repository.repo_type.clone(),
            }
        })
    }
}

fn override_parsed<T: FromStr>(key: &str, target: &mut T) -> Result<(), ConfigError> {
    if let Ok(raw) = env::var(key) {
        *target = raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.clone(),
        })?;
    }
    Ok(())
}
