//! TOML-based configuration for the intent compiler.
//!
//! Supports a config file (intentql.toml) with environment variable expansion.
//!
//! Example configuration:
//! ```toml
//! [registry]
//! path = "${INTENTQL_REGISTRY}"   # built-in registry when absent
//!
//! [compiler]
//! default_entity = "workItem"
//! count_field = "total"
//! detail_sample_size = 3
//! anomaly_threshold = 2.0
//! forecast_periods = 7
//! max_forecast_periods = 365
//! window_size = 7
//! bucket_count = 5
//! graph_max_depth = 3
//! default_limit = 50
//! ```

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::RegistryError;
use crate::registry::Registry;

/// Error type for settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Where the schema registry comes from.
    pub registry: RegistrySettings,

    /// Compiler tunables.
    pub compiler: CompilerSettings,
}

/// Registry location.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistrySettings {
    /// Path to a registry TOML document (supports ${ENV_VAR} expansion).
    pub path: Option<String>,
}

impl RegistrySettings {
    /// Get the registry path with environment variables expanded.
    pub fn resolved_path(&self) -> Result<Option<PathBuf>, SettingsError> {
        match &self.path {
            Some(path) => Ok(Some(PathBuf::from(expand_env_vars(path)?))),
            None => Ok(None),
        }
    }
}

/// Compiler tunables.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CompilerSettings {
    /// Fallback entity for unknown or missing primary entities.
    /// Overrides the registry's own default when set.
    pub default_entity: Option<String>,

    /// Output field of the `$count` stage.
    pub count_field: String,

    /// Example items kept per group when details are requested.
    pub detail_sample_size: u32,

    /// Standard deviations beyond which a bucket is anomalous.
    pub anomaly_threshold: f64,

    /// Periods projected by a forecast.
    pub forecast_periods: u32,

    /// Upper bound for requested forecast periods.
    pub max_forecast_periods: u32,

    /// Rolling window width (days, or documents for non-date fields).
    pub window_size: u32,

    /// Buckets for `bucketAuto` when the request does not say.
    pub bucket_count: u32,

    /// Upper bound for graph traversal depth.
    pub graph_max_depth: u32,

    /// Limit applied to plain list queries without an explicit limit.
    pub default_limit: Option<u64>,
}

impl Default for CompilerSettings {
    fn default() -> Self {
        Self {
            default_entity: None,
            count_field: "total".to_string(),
            detail_sample_size: 3,
            anomaly_threshold: 2.0,
            forecast_periods: 7,
            max_forecast_periods: 365,
            window_size: 7,
            bucket_count: 5,
            graph_max_depth: 3,
            default_limit: None,
        }
    }
}

impl CompilerSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.count_field.is_empty() || self.count_field.starts_with('$') {
            return Err(SettingsError::InvalidConfig(format!(
                "count_field must be a plain field name, got '{}'",
                self.count_field
            )));
        }
        if !(self.anomaly_threshold.is_finite() && self.anomaly_threshold > 0.0) {
            return Err(SettingsError::InvalidConfig(format!(
                "anomaly_threshold must be positive, got {}",
                self.anomaly_threshold
            )));
        }
        for (name, value) in [
            ("forecast_periods", self.forecast_periods),
            ("max_forecast_periods", self.max_forecast_periods),
            ("window_size", self.window_size),
            ("bucket_count", self.bucket_count),
        ] {
            if value == 0 {
                return Err(SettingsError::InvalidConfig(format!("{} must be at least 1", name)));
            }
        }
        if self.forecast_periods > self.max_forecast_periods {
            return Err(SettingsError::InvalidConfig(format!(
                "forecast_periods ({}) exceeds max_forecast_periods ({})",
                self.forecast_periods, self.max_forecast_periods
            )));
        }
        if self.default_limit == Some(0) {
            return Err(SettingsError::InvalidConfig(
                "default_limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, SettingsError> {
        let settings: Settings = toml::from_str(content)?;
        settings.compiler.validate()?;
        Ok(settings)
    }

    /// Load settings from the default config file locations.
    ///
    /// Searches in order:
    /// 1. Environment variable `INTENTQL_CONFIG`
    /// 2. `./intentql.toml`
    pub fn load() -> Result<Self, SettingsError> {
        if let Ok(path) = env::var("INTENTQL_CONFIG") {
            return Self::from_file(&path);
        }

        let local_config = PathBuf::from("intentql.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        Ok(Settings::default())
    }

    /// Load the configured registry, or the built-in one.
    ///
    /// This is the one failure that should stop the process.
    pub fn load_registry(&self) -> Result<Registry, SettingsError> {
        let registry = match self.registry.resolved_path()? {
            Some(path) => Registry::from_path(path)?,
            None => Registry::builtin()?,
        };

        if let Some(name) = &self.compiler.default_entity {
            if registry.entity(name).is_none() {
                return Err(SettingsError::InvalidConfig(format!(
                    "default_entity '{}' is not in the registry",
                    name
                )));
            }
        }
        Ok(registry)
    }
}

/// Expand environment variables in a string.
///
/// Supports `${VAR}` and `$VAR` syntax.
pub fn expand_env_vars(s: &str) -> Result<String, SettingsError> {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }

        let mut var_name = String::new();
        if chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            for ch in chars.by_ref() {
                if ch == '}' {
                    break;
                }
                var_name.push(ch);
            }
        } else {
            // $VAR ends at the first non-identifier character
            while let Some(&ch) = chars.peek() {
                if !(ch.is_alphanumeric() || ch == '_') {
                    break;
                }
                var_name.push(ch);
                chars.next();
            }
            if var_name.is_empty() {
                result.push('$');
                continue;
            }
        }

        let value = env::var(&var_name).map_err(|_| SettingsError::MissingEnvVar(var_name))?;
        result.push_str(&value);
    }

    Ok(result)
}
