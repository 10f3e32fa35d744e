//! Configuration for the memory store.
//!
//! Configuration precedence:
//! 1. Environment variables (`AML_STORAGE_PATH`, `AML_ENCRYPTION`,
//!    `AML_COMPRESSION`, `AML_MAX_SIZE_GB`)
//! 2. Local config file (`./aml.toml`)
//! 3. Global config file (`~/.aml/config.toml`)
//! 4. Defaults
//!
//! `[storage]` keys merge one by one across files. `[prune]` and `[backup]`
//! merge per section: the last file that has the section wins, and keys it
//! leaves out take their defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bytes per gigabyte for the size cap.
const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Storage configuration consumed by the memory store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    /// Root directory of the memory store.
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,

    /// Route record payloads through the encryption engine.
    #[serde(default)]
    pub encryption: bool,

    /// Compress backup archives.
    #[serde(default)]
    pub compression: bool,

    /// Advisory cap on the total size of the store root, in GB.
    #[serde(default, alias = "max_size_gb", skip_serializing_if = "Option::is_none")]
    pub max_size_gb: Option<f64>,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from(".aml").join("memory")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { path: default_storage_path(), encryption: false, compression: false, max_size_gb: None }
    }
}

impl StorageConfig {
    /// Creates a configuration rooted at `path` with defaults elsewhere.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), ..Self::default() }
    }

    /// Enables or disables at-rest encryption.
    #[must_use]
    pub fn with_encryption(mut self, enabled: bool) -> Self {
        self.encryption = enabled;
        self
    }

    /// Enables or disables backup compression.
    #[must_use]
    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    /// Sets the size cap in GB.
    #[must_use]
    pub fn with_max_size_gb(mut self, max_size_gb: f64) -> Self {
        self.max_size_gb = Some(max_size_gb);
        self
    }

    /// Size cap in bytes, if configured.
    pub fn max_size_bytes(&self) -> Option<u64> {
        self.max_size_gb.map(|gb| (gb * BYTES_PER_GB) as u64)
    }

    /// Rejects configurations the store cannot run with.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue("storage.path must not be empty".to_string()));
        }
        if let Some(gb) = self.max_size_gb {
            if !gb.is_finite() || gb <= 0.0 {
                return Err(ConfigError::InvalidValue(format!(
                    "storage.maxSizeGb must be a positive number, got {}",
                    gb
                )));
            }
        }
        Ok(())
    }
}

/// Thresholds for pruning agent memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PruneConfig {
    /// Patterns unused for longer than this are pruned.
    pub pattern_max_age_days: i64,
    /// Solutions unused for longer than this are pruned.
    pub solution_max_age_days: i64,
    /// Decisions older than this are pruned.
    pub decision_max_age_days: i64,
    /// Consistently failing patterns older than this are pruned.
    pub failed_pattern_max_age_days: i64,
    /// Patterns below this success rate are pruned on performance.
    pub min_success_rate: f64,
    /// Patterns below this confidence are pruned on performance.
    pub min_confidence_score: f64,
    /// Executions needed before a pattern is judged on performance.
    pub min_execution_count: u64,
    /// Agent directory size that triggers space-based pruning, in MB.
    pub agent_memory_limit_mb: f64,
    /// Never prune patterns at or above `high_value_threshold` for space.
    pub preserve_high_value: bool,
    /// Value score that marks a pattern as high value.
    pub high_value_threshold: f64,
    /// Keep pruned records in a compressed archive.
    pub archive: bool,
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            pattern_max_age_days: 90,
            solution_max_age_days: 365,
            decision_max_age_days: 180,
            failed_pattern_max_age_days: 30,
            min_success_rate: 0.2,
            min_confidence_score: 0.15,
            min_execution_count: 3,
            agent_memory_limit_mb: 80.0,
            preserve_high_value: true,
            high_value_threshold: 0.85,
            archive: true,
        }
    }
}

impl PruneConfig {
    /// Agent size limit in bytes.
    pub fn agent_memory_limit_bytes(&self) -> u64 {
        (self.agent_memory_limit_mb * 1024.0 * 1024.0) as u64
    }

    /// Rejects thresholds outside their ranges.
    pub fn validate(&self) -> ConfigResult<()> {
        let ages = [
            ("patternMaxAgeDays", self.pattern_max_age_days),
            ("solutionMaxAgeDays", self.solution_max_age_days),
            ("decisionMaxAgeDays", self.decision_max_age_days),
            ("failedPatternMaxAgeDays", self.failed_pattern_max_age_days),
        ];
        for (name, days) in ages {
            if days < 0 {
                return Err(ConfigError::InvalidValue(format!("prune.{} must not be negative", name)));
            }
        }

        let ratios = [
            ("minSuccessRate", self.min_success_rate),
            ("minConfidenceScore", self.min_confidence_score),
            ("highValueThreshold", self.high_value_threshold),
        ];
        for (name, value) in ratios {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidValue(format!(
                    "prune.{} must be between 0 and 1, got {}",
                    name, value
                )));
            }
        }

        if !self.agent_memory_limit_mb.is_finite() || self.agent_memory_limit_mb <= 0.0 {
            return Err(ConfigError::InvalidValue(
                "prune.agentMemoryLimitMb must be a positive number".to_string(),
            ));
        }
        Ok(())
    }
}

/// Backup retention settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackupConfig {
    /// Backups older than this are removed by rotation.
    pub retention_days: i64,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self { retention_days: 30 }
    }
}

/// Root configuration file structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AmlConfig {
    /// Storage section.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Pruning thresholds.
    #[serde(default)]
    pub prune: PruneConfig,

    /// Backup retention.
    #[serde(default)]
    pub backup: BackupConfig,
}

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file not found.
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    /// Failed to read configuration file.
    #[error("Failed to read configuration file: {0}")]
    ReadError(String),

    /// Failed to parse configuration file.
    #[error("Failed to parse configuration file: {0}")]
    ParseError(String),

    /// Invalid configuration value.
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Values set by one configuration layer; unset fields leave lower layers alone.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StorageOverrides {
    path: Option<PathBuf>,
    encryption: Option<bool>,
    compression: Option<bool>,
    #[serde(alias = "max_size_gb")]
    max_size_gb: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigLayer {
    #[serde(default)]
    storage: StorageOverrides,
    prune: Option<PruneConfig>,
    backup: Option<BackupConfig>,
}

impl AmlConfig {
    /// Load configuration from a TOML or JSON file on top of the defaults.
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let mut config = Self::default();
        config.merge(&Self::read_layer(path)?);
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ParseError(format!("Failed to serialize: {}", e)))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::ReadError(format!("Failed to create directory: {}", e)))?;
        }

        std::fs::write(path, content)
            .map_err(|e| ConfigError::ReadError(format!("Failed to write file: {}", e)))
    }

    /// Get default global configuration file path.
    pub fn default_global_path() -> PathBuf {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(".aml")
            .join("config.toml")
    }

    /// Get default local configuration file path.
    pub fn default_local_path() -> PathBuf {
        PathBuf::from("aml.toml")
    }

    /// Discover and load configuration files, then apply environment
    /// overrides and validate.
    ///
    /// Missing files are skipped; unreadable or unparsable files are errors.
    pub fn discover_and_load() -> ConfigResult<Self> {
        Self::load_layers(
            &[Self::default_global_path(), Self::default_local_path()],
            |name| std::env::var(name).ok(),
        )
    }

    /// Loads the given files in order (later overrides earlier), then the
    /// variables returned by `env`.
    pub fn load_layers<F>(paths: &[PathBuf], env: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        for path in paths {
            match Self::read_layer(path) {
                Ok(layer) => config.merge(&layer),
                Err(ConfigError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        config.apply_env(env)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates every section.
    pub fn validate(&self) -> ConfigResult<()> {
        self.storage.validate()?;
        self.prune.validate()?;
        if self.backup.retention_days < 0 {
            return Err(ConfigError::InvalidValue(
                "backup.retentionDays must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply `AML_*` environment overrides read through `env`.
    pub fn apply_env<F>(&mut self, env: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = env("AML_STORAGE_PATH") {
            self.storage.path = PathBuf::from(path);
        }
        if let Some(value) = env("AML_ENCRYPTION") {
            self.storage.encryption = parse_bool("AML_ENCRYPTION", &value)?;
        }
        if let Some(value) = env("AML_COMPRESSION") {
            self.storage.compression = parse_bool("AML_COMPRESSION", &value)?;
        }
        if let Some(value) = env("AML_MAX_SIZE_GB") {
            let gb = value.trim().parse::<f64>().map_err(|_| {
                ConfigError::InvalidValue(format!("AML_MAX_SIZE_GB: not a number: {}", value))
            })?;
            self.storage.max_size_gb = Some(gb);
        }
        Ok(())
    }

    fn merge(&mut self, layer: &ConfigLayer) {
        let overrides = &layer.storage;
        if let Some(ref path) = overrides.path {
            self.storage.path = path.clone();
        }
        if let Some(encryption) = overrides.encryption {
            self.storage.encryption = encryption;
        }
        if let Some(compression) = overrides.compression {
            self.storage.compression = compression;
        }
        if let Some(max_size_gb) = overrides.max_size_gb {
            self.storage.max_size_gb = Some(max_size_gb);
        }
        if let Some(ref prune) = layer.prune {
            self.prune.clone_from(prune);
        }
        if let Some(ref backup) = layer.backup {
            self.backup.clone_from(backup);
        }
    }

    fn read_layer(path: &Path) -> ConfigResult<ConfigLayer> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;

        if path.extension().and_then(|s| s.to_str()) == Some("json") {
            serde_json::from_str(&content)
                .map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))
        } else {
            toml::from_str(&content)
                .map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))
        }
    }
}

fn parse_bool(name: &str, value: &str) -> ConfigResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue(format!("{}: not a boolean: {}", name, value))),
    }
}
