//! Configuration management for Sluice.
//!
//! These are the process settings (where the store and the limiter
//! configuration live). The limiter parameters themselves come from the
//! configuration source at runtime, see [`crate::reload`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SluiceError};
use crate::store::RedisStoreConfig;

/// Environment variable prefix for overrides, e.g. `SLUICE_STORE__KEY_PREFIX`.
const ENV_PREFIX: &str = "SLUICE";

/// Main configuration for the Sluice service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Counter store configuration
    #[serde(default)]
    pub store: StoreSettings,

    /// Limiter configuration source
    #[serde(default)]
    pub source: SourceSettings,

    /// Admission boundary settings
    #[serde(default)]
    pub admission: AdmissionSettings,

    /// Log output settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Which counter store backs the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Redis,
    /// Process-local state; only meaningful for a single instance
    Memory,
}

/// Counter store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default)]
    pub backend: StoreBackend,

    #[serde(default)]
    pub redis: RedisStoreConfig,

    /// Prefix applied to every limiter key
    #[serde(default)]
    pub key_prefix: String,
}

/// Where the limiter configuration payload is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// A well-known key in Redis
    #[default]
    Redis,
    /// A JSON file on disk
    File,
}

/// Limiter configuration source settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSettings {
    #[serde(default)]
    pub kind: SourceKind,

    /// Redis key holding the payload
    #[serde(default = "default_source_key")]
    pub key: String,

    /// Path of the payload file
    #[serde(default)]
    pub path: Option<String>,

    /// How often the source is checked for changes, in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            kind: SourceKind::default(),
            key: default_source_key(),
            path: None,
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl SourceSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_source_key() -> String {
    "rate_limiter_config".to_string()
}

fn default_poll_interval() -> u64 {
    1_000
}

/// Admission boundary settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionSettings {
    /// Deadline for a whole admission check, in milliseconds
    #[serde(default = "default_deadline")]
    pub deadline_ms: u64,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            deadline_ms: default_deadline(),
        }
    }
}

impl AdmissionSettings {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

fn default_deadline() -> u64 {
    1_000
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default)]
    pub format: LogFormat,

    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn environment() -> ::config::Environment {
    ::config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

impl ServiceConfig {
    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| SluiceError::Settings(e.to_string()))
    }

    /// Load configuration from an optional YAML file, then apply `SLUICE_*`
    /// environment overrides (`__` separates nested keys).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_layered(path, environment())
    }

    fn load_layered(path: Option<&Path>, env: ::config::Environment) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::from(path).format(::config::FileFormat::Yaml),
            );
        }
        builder
            .add_source(env)
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| SluiceError::Settings(e.to_string()))
    }

    /// Check settings that serde alone cannot.
    pub fn validate(&self) -> Result<()> {
        if self.source.kind == SourceKind::File && self.source.path.is_none() {
            return Err(SluiceError::Settings(
                "source.path is required for the file source".to_string(),
            ));
        }
        if self.admission.deadline_ms == 0 {
            return Err(SluiceError::Settings(
                "admission.deadline_ms must be positive".to_string(),
            ));
        }
        if self.source.poll_interval_ms == 0 {
            return Err(SluiceError::Settings(
                "source.poll_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();

        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.redis.url, "redis://127.0.0.1:6379/0");
        assert_eq!(config.source.kind, SourceKind::Redis);
        assert_eq!(config.source.key, "rate_limiter_config");
        assert_eq!(config.admission.deadline(), Duration::from_secs(1));
        assert_eq!(config.logging.format, LogFormat::Text);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
store:
  backend: memory
  key_prefix: "edge:"
source:
  kind: file
  path: /etc/sluice/limiter.json
  poll_interval_ms: 250
admission:
  deadline_ms: 50
logging:
  format: json
"#;
        let config = ServiceConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.key_prefix, "edge:");
        assert_eq!(config.source.kind, SourceKind::File);
        assert_eq!(config.source.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.admission.deadline_ms, 50);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_file_source_requires_path() {
        let config = ServiceConfig::from_yaml("source:\n  kind: file\n").unwrap();
        assert!(matches!(config.validate(), Err(SluiceError::Settings(_))));
    }

    #[test]
    fn test_invalid_yaml_is_settings_error() {
        let result = ServiceConfig::from_yaml("store: [not, a, map]");
        assert!(matches!(result, Err(SluiceError::Settings(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "source:\n  key: limits/api\nstore:\n  key_prefix: \"api:\"").unwrap();

        let config = ServiceConfig::load_layered(
            Some(file.path()),
            environment().source(Some(Default::default())),
        )
        .unwrap();
        assert_eq!(config.source.key, "limits/api");
        assert_eq!(config.store.key_prefix, "api:");
    }

    #[test]
    fn test_environment_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "store:\n  key_prefix: \"file:\"\nadmission:\n  deadline_ms: 50").unwrap();

        let vars = [
            ("SLUICE_STORE__KEY_PREFIX", "env:"),
            ("SLUICE_STORE__BACKEND", "memory"),
            ("SLUICE_SOURCE__POLL_INTERVAL_MS", "250"),
            ("SLUICE_LOGGING__FORMAT", "json"),
            ("OTHER_STORE__KEY_PREFIX", "ignored:"),
        ];
        let env = environment().source(Some(
            vars.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ));

        let config = ServiceConfig::load_layered(Some(file.path()), env).unwrap();
        assert_eq!(config.store.key_prefix, "env:");
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.source.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.logging.format, LogFormat::Json);
        // Values only present in the file survive.
        assert_eq!(config.admission.deadline_ms, 50);
    }
}
