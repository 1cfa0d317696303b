//! Configuration for fieldsweep.
//!
//! Loaded from `fsweep.toml` (or an explicit path), then overridden by
//! `FSWEEP_*` environment variables. Every field has a default.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::aspect::DEFAULT_RUN_ID;
use crate::error::ConfigError;
use crate::retry::RetrySettings;

/// Config file looked up in the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "fsweep.toml";

/// Default scroll page size.
pub const DEFAULT_BATCH_SIZE: usize = 5000;

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable output for terminals
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub store: StoreConfig,
    pub sweep: SweepConfig,
    pub retry: RetrySettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_format: LogFormat,

    /// Append logs to this file as well as stderr
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            log_file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database holding aspects and search documents
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("fsweep.db")
}

/// Runtime knobs for one sweep invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepConfig {
    /// When false the step is skipped without touching the store.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Ignore an existing completion marker.
    #[serde(default)]
    pub reprocess: bool,

    /// Scroll page size.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Run id stamped into restated aspects' system metadata.
    #[serde(default = "default_run_id")]
    pub run_id: String,

    /// Stop after this many pages. Stopping early never writes the marker.
    #[serde(default)]
    pub max_pages: Option<u64>,

    /// Make restates conditional on the version that was read.
    #[serde(default)]
    pub guard_concurrent_writes: bool,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reprocess: false,
            batch_size: DEFAULT_BATCH_SIZE,
            run_id: default_run_id(),
            max_pages: None,
            guard_concurrent_writes: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_run_id() -> String {
    DEFAULT_RUN_ID.to_string()
}

impl Config {
    /// Load configuration.
    ///
    /// An explicit `path` must exist. Without one, `fsweep.toml` in the
    /// working directory is used when present, defaults otherwise.
    /// Environment overrides are applied last.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load_from(path)?,
            None => {
                let implicit = Path::new(DEFAULT_CONFIG_FILE);
                if implicit.exists() {
                    Self::load_from(implicit)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a config file without applying overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Apply `FSWEEP_*` variables from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("FSWEEP_ENABLED") {
            self.sweep.enabled = parse_bool("FSWEEP_ENABLED", &v)?;
        }
        if let Some(v) = lookup("FSWEEP_REPROCESS") {
            self.sweep.reprocess = parse_bool("FSWEEP_REPROCESS", &v)?;
        }
        if let Some(v) = lookup("FSWEEP_BATCH_SIZE") {
            self.sweep.batch_size = parse_number("FSWEEP_BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("FSWEEP_MAX_PAGES") {
            self.sweep.max_pages = Some(parse_number("FSWEEP_MAX_PAGES", &v)?);
        }
        if let Some(v) = lookup("FSWEEP_RUN_ID") {
            self.sweep.run_id = v;
        }
        if let Some(v) = lookup("FSWEEP_DB_PATH") {
            self.store.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("FSWEEP_LOG_LEVEL") {
            self.general.log_level = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sweep.batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "sweep.batch_size must be >= 1".to_string(),
            ));
        }
        if self.sweep.max_pages == Some(0) {
            return Err(ConfigError::ValidationError(
                "sweep.max_pages must be >= 1 when set".to_string(),
            ));
        }
        if self.sweep.run_id.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "sweep.run_id must not be empty".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "retry.max_attempts must be >= 1".to_string(),
            ));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::ValidationError(format!(
                "retry.initial_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.initial_delay_ms, self.retry.max_delay_ms
            )));
        }
        if self.retry.backoff_factor.is_nan() || self.retry.backoff_factor < 1.0 {
            return Err(ConfigError::ValidationError(
                "retry.backoff_factor must be >= 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: "expected true/false/1/0/yes/no".to_string(),
        }),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.sweep.batch_size, 5000);
        assert!(!config.sweep.reprocess);
        assert!(config.sweep.enabled);
        assert_eq!(config.sweep.run_id, "no-run-id-provided");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_toml_yields_defaults() {
        assert_eq!(Config::from_toml("").unwrap(), Config::default());
    }

    #[test]
    fn parses_all_sections() {
        let config = Config::from_toml(
            r#"
            [general]
            log_level = "debug"
            log_format = "json"

            [store]
            db_path = "/var/lib/fsweep/store.db"

            [sweep]
            reprocess = true
            batch_size = 250
            max_pages = 4
            guard_concurrent_writes = true

            [retry]
            max_attempts = 3
            initial_delay_ms = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.general.log_format, LogFormat::Json);
        assert_eq!(config.store.db_path, PathBuf::from("/var/lib/fsweep/store.db"));
        assert!(config.sweep.reprocess);
        assert_eq!(config.sweep.batch_size, 250);
        assert_eq!(config.sweep.max_pages, Some(4));
        assert!(config.sweep.guard_concurrent_writes);
        assert_eq!(config.sweep.run_id, DEFAULT_RUN_ID);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.max_delay_ms, 30_000);
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        let err = Config::from_toml("[sweep\nbatch_size = ").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = Config::default();
        config
            .apply_overrides_from(env(&[
                ("FSWEEP_REPROCESS", "yes"),
                ("FSWEEP_ENABLED", "0"),
                ("FSWEEP_BATCH_SIZE", "42"),
                ("FSWEEP_MAX_PAGES", "3"),
                ("FSWEEP_RUN_ID", "run-7"),
                ("FSWEEP_DB_PATH", "/tmp/x.db"),
                ("FSWEEP_LOG_LEVEL", "trace"),
            ]))
            .unwrap();
        assert!(config.sweep.reprocess);
        assert!(!config.sweep.enabled);
        assert_eq!(config.sweep.batch_size, 42);
        assert_eq!(config.sweep.max_pages, Some(3));
        assert_eq!(config.sweep.run_id, "run-7");
        assert_eq!(config.store.db_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(config.general.log_level, "trace");
    }

    #[test]
    fn bad_env_values_are_rejected() {
        let mut config = Config::default();
        let err = config
            .apply_overrides_from(env(&[("FSWEEP_REPROCESS", "maybe")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { ref key, .. } if key == "FSWEEP_REPROCESS"
        ));

        let err = config
            .apply_overrides_from(env(&[("FSWEEP_BATCH_SIZE", "-1")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = Config::default();
        config.sweep.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.retry.initial_delay_ms = 60_000;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.sweep.max_pages = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load_from(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fsweep.toml");
        std::fs::write(&path, "[sweep]\nbatch_size = 7\n").unwrap();
        assert_eq!(Config::load_from(&path).unwrap().sweep.batch_size, 7);
    }

    #[test]
    fn log_format_parse_and_display() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::Json.to_string(), "json");
    }
}
