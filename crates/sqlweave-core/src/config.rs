//! Configuration schema (sqlweave.toml)

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Default number of scheduler workers
pub const DEFAULT_THREADS: usize = 4;

/// How a model's result is persisted in the warehouse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Materialization {
    /// Rebuilt as a table on every run
    Table,

    /// Created as a view
    View,

    /// Table appended to on each run
    Incremental,

    /// Never built; inlined as a CTE into its referencing models
    Ephemeral,
}

impl Default for Materialization {
    fn default() -> Self {
        Self::View
    }
}

impl Materialization {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Table => "table",
            Self::View => "view",
            Self::Incremental => "incremental",
            Self::Ephemeral => "ephemeral",
        }
    }
}

impl std::fmt::Display for Materialization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Materialization {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "table" => Ok(Self::Table),
            "view" => Ok(Self::View),
            "incremental" => Ok(Self::Incremental),
            "ephemeral" => Ok(Self::Ephemeral),
            other => Err(ConfigError::InvalidValue(format!(
                "unknown materialization '{}'",
                other
            ))),
        }
    }
}

/// A warehouse location models are written to or read from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Warehouse project (BigQuery project / database)
    pub project: String,

    /// Dataset (schema) inside the project
    pub dataset: String,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            project: "default".to_string(),
            dataset: "default".to_string(),
        }
    }
}

impl TargetConfig {
    /// Create a new target
    pub fn new(project: impl Into<String>, dataset: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            dataset: dataset.into(),
        }
    }

    /// Fully qualified name of a table inside this target
    ///
    /// Format: "project.dataset.table"
    pub fn qualify(&self, table: &str) -> String {
        format!("{}.{}.{}", self.project, self.dataset, table)
    }
}

/// Project-wide model defaults, overridden by `config()` calls in a model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelDefaults {
    /// Default materialization
    #[serde(default)]
    pub materialized: Materialization,

    /// Tags applied to every model
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Project name
    #[serde(default = "default_name")]
    pub name: String,

    /// Number of concurrent workers
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Where models are built
    #[serde(default)]
    pub target: TargetConfig,

    /// Alternate read target for references outside the current build
    #[serde(default)]
    pub upstream: Option<TargetConfig>,

    /// Model defaults
    #[serde(default)]
    pub models: ModelDefaults,

    /// Project variables exposed through `var()`
    #[serde(default)]
    pub vars: BTreeMap<String, serde_json::Value>,

    /// Project root path (for resolving relative paths)
    #[serde(skip)]
    pub project_root: PathBuf,
}

fn default_name() -> String {
    "sqlweave".to_string()
}

fn default_threads() -> usize {
    DEFAULT_THREADS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            threads: DEFAULT_THREADS,
            target: TargetConfig::default(),
            upstream: None,
            models: ModelDefaults::default(),
            vars: BTreeMap::new(),
            project_root: std::env::current_dir().unwrap_or_default(),
        }
    }
}

impl Config {
    /// Load config from TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        let mut config = Self::from_toml(&contents)?;

        // Set project root to parent of config file
        if let Some(parent) = path.parent() {
            config.project_root = parent.to_path_buf();
        }

        Ok(config)
    }

    /// Load config from TOML string
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(toml)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        if config.threads == 0 {
            return Err(ConfigError::InvalidValue(
                "threads must be at least 1".to_string(),
            ));
        }

        Ok(config)
    }

    /// Save config to TOML file
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let toml = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, toml)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }
}

/// Config error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}
