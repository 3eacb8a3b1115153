//! Configuration loading.
//!
//! Configuration is read from a TOML file; every field has a default so an
//! empty (or missing) file is valid. Command line flags override file values
//! in the binary.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::timings::CHUNK_CAPACITY;

/// Upper bound for the duration options, one year.
pub const MAX_DURATION_SECS: i64 = 366 * 24 * 3600;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub sync: RunOptions,
    pub platform: PlatformConfig,
    pub source: SourceConfig,
}

/// Options of one synchronization run (`[sync]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Staging area, error sink and database location.
    pub working_dir: Option<PathBuf>,
    /// Execute every decision but skip remote mutations and store writes.
    pub simulate: bool,
    /// Bypass the no-op refresh optimization.
    pub force_update: bool,
    /// Stop after staging source records.
    pub download_only: bool,
    /// Replace unreachable or rejected images instead of failing the entity.
    pub no_bail_on_invalid_image: bool,
    pub default_image_url: Option<String>,
    /// Maximum timings per target entity.
    pub chunk_capacity: usize,
    /// Seconds added to zero-length timings; unset keeps them zero-length.
    pub flat_timing_duration_secs: Option<i64>,
    /// Country code applied to fetched locations lacking one.
    pub default_country_code: Option<String>,
    pub max_concurrent_scopes: usize,
    /// Abort (cooperatively) after this many seconds.
    pub run_timeout_secs: Option<u64>,
    /// Tolerated clock skew between source `updated_at` and local `synced_at`.
    pub staleness_tolerance_secs: i64,
    /// Page size for source listing and target location listing.
    pub page_size: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            working_dir: None,
            simulate: false,
            force_update: false,
            download_only: false,
            no_bail_on_invalid_image: false,
            default_image_url: None,
            chunk_capacity: CHUNK_CAPACITY,
            flat_timing_duration_secs: None,
            default_country_code: Some("FR".to_string()),
            max_concurrent_scopes: 4,
            run_timeout_secs: None,
            staleness_tolerance_secs: 0,
            page_size: 20,
        }
    }
}

impl RunOptions {
    /// Resolved working directory: configured value, else the platform data
    /// directory, else `./.agenda-sync`.
    pub fn working_dir(&self) -> PathBuf {
        if let Some(dir) = &self.working_dir {
            return dir.clone();
        }
        ProjectDirs::from("com", "openagenda", "agenda-sync")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".agenda-sync"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_capacity == 0 {
            return Err(ConfigError::Invalid(
                "chunk_capacity must be greater than zero".to_string(),
            ));
        }
        if self.page_size == 0 {
            return Err(ConfigError::Invalid(
                "page_size must be greater than zero".to_string(),
            ));
        }
        if self.max_concurrent_scopes == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_scopes must be greater than zero".to_string(),
            ));
        }
        if let Some(secs) = self.flat_timing_duration_secs {
            if !(1..=MAX_DURATION_SECS).contains(&secs) {
                return Err(ConfigError::Invalid(format!(
                    "flat_timing_duration_secs must be between 1 and {MAX_DURATION_SECS}"
                )));
            }
        }
        if !(0..=MAX_DURATION_SECS).contains(&self.staleness_tolerance_secs) {
            return Err(ConfigError::Invalid(format!(
                "staleness_tolerance_secs must be between 0 and {MAX_DURATION_SECS}"
            )));
        }
        Ok(())
    }
}

/// Remote platform settings (`[platform]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub base_url: String,
    pub access_token: Option<String>,
    /// Environment variable holding the access token, read when
    /// `access_token` is unset.
    pub access_token_env: String,
    pub timeout_secs: u64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openagenda.com/v2".to_string(),
            access_token: None,
            access_token_env: "AGENDA_SYNC_ACCESS_TOKEN".to_string(),
            timeout_secs: 30,
        }
    }
}

impl PlatformConfig {
    pub fn resolve_access_token(&self) -> Option<String> {
        self.access_token
            .clone()
            .or_else(|| std::env::var(&self.access_token_env).ok())
    }
}

/// Source settings (`[source]` section) for the bundled JSON-lines adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub path: Option<PathBuf>,
}

impl SyncConfig {
    pub fn from_toml_str(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: SyncConfig = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.sync.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents, path)
    }

    /// Load `path` when given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}
