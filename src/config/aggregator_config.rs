//! Aggregator configuration as operator-editable TOML.
//!
//! Every table is optional; an empty file yields the built-in defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use super::defaults;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "NDEFENDER_CONFIG";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "aggregator.toml";

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration.
///
/// Load with `AggregatorConfig::load()` which searches:
/// 1. `$NDEFENDER_CONFIG` env var
/// 2. `./aggregator.toml`
/// 3. Built-in defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatorConfig {
    #[serde(default)]
    pub system_controller: SystemControllerConfig,

    /// VRX microcontroller serial link
    #[serde(default)]
    pub serial: SerialConfig,

    /// RF detector JSONL log
    #[serde(default)]
    pub rf: JsonlSourceConfig,

    /// Remote-ID receiver JSONL log
    #[serde(default = "JsonlSourceConfig::remote_id")]
    pub remote_id: JsonlSourceConfig,

    #[serde(default)]
    pub polling: PollingConfig,

    #[serde(default)]
    pub safety: SafetyConfig,

    #[serde(default)]
    pub bus: BusConfig,

    /// Which optional ingestors to build
    #[serde(default)]
    pub features: FeaturesConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            system_controller: SystemControllerConfig::default(),
            serial: SerialConfig::default(),
            rf: JsonlSourceConfig::default(),
            remote_id: JsonlSourceConfig::remote_id(),
            polling: PollingConfig::default(),
            safety: SafetyConfig::default(),
            bus: BusConfig::default(),
            features: FeaturesConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Where the active configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    Defaults,
}

/// Result of the config file search.
///
/// The search runs before logging is configured (the config carries the log
/// level), so skipped candidates are kept and reported by [`ConfigSearch::log`].
#[derive(Debug)]
pub struct ConfigSearch {
    pub config: AggregatorConfig,
    pub source: ConfigSource,
    /// Candidates that existed but could not be used
    pub skipped: Vec<String>,
}

impl ConfigSearch {
    /// Report the outcome once a subscriber is installed.
    pub fn log(&self) {
        for reason in &self.skipped {
            warn!("{reason}");
        }
        match &self.source {
            ConfigSource::File(path) => info!(path = %path.display(), "Loaded config"),
            ConfigSource::Defaults => info!("No config file found, using built-in defaults"),
        }
    }
}

impl AggregatorConfig {
    /// Load configuration using the standard search order, falling back to
    /// defaults when no file is found or a file fails to load.
    pub fn load() -> ConfigSearch {
        Self::search(std::env::var_os(CONFIG_ENV).map(PathBuf::from), Path::new("."))
    }

    /// Search order with the env override and working directory passed in.
    pub fn search(env_path: Option<PathBuf>, dir: &Path) -> ConfigSearch {
        let mut skipped = Vec::new();

        if let Some(path) = env_path {
            if !path.exists() {
                skipped.push(format!(
                    "{CONFIG_ENV} points to non-existent file {}, falling back",
                    path.display()
                ));
            } else {
                match Self::load_from_file(&path) {
                    Ok(config) => {
                        return ConfigSearch {
                            config,
                            source: ConfigSource::File(path),
                            skipped,
                        }
                    }
                    Err(e) => skipped.push(format!("Ignoring config from {CONFIG_ENV}: {e}")),
                }
            }
        }

        let local = dir.join(LOCAL_CONFIG_FILE);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    return ConfigSearch {
                        config,
                        source: ConfigSource::File(local),
                        skipped,
                    }
                }
                Err(e) => skipped.push(format!("Ignoring {LOCAL_CONFIG_FILE}: {e}")),
            }
        }

        ConfigSearch {
            config: Self::default(),
            source: ConfigSource::Defaults,
            skipped,
        }
    }

    /// Load and validate a specific TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config = Self::from_toml(&contents).map_err(|e| match e {
            ConfigError::Parse(_, err) => ConfigError::Parse(path.to_path_buf(), err),
            other => other,
        })?;
        Ok(config)
    }

    /// Parse and validate TOML text.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents).map_err(|e| ConfigError::Parse(PathBuf::new(), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Reject settings that would stall or disable a loop.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        if self.system_controller.base_url.trim().is_empty() {
            errors.push("system_controller.base_url must not be empty".to_string());
        }
        check_positive(self.system_controller.timeout_secs, "system_controller.timeout_secs", &mut errors);
        check_positive(
            self.polling.system_controller_interval_ms,
            "polling.system_controller_interval_ms",
            &mut errors,
        );

        if self.features.enable_serial {
            let s = &self.serial;
            if s.port.trim().is_empty() {
                errors.push("serial.port must not be empty".to_string());
            }
            check_positive(u64::from(s.baud_rate), "serial.baud_rate", &mut errors);
            check_positive(s.reconnect_delay_ms, "serial.reconnect_delay_ms", &mut errors);
            check_positive(s.command_timeout_ms, "serial.command_timeout_ms", &mut errors);
            check_positive(s.max_line_bytes as u64, "serial.max_line_bytes", &mut errors);
            check_positive(s.read_chunk_bytes as u64, "serial.read_chunk_bytes", &mut errors);
        }

        for (enabled, source, name) in [
            (self.features.enable_rf, &self.rf, "rf"),
            (self.features.enable_remote_id, &self.remote_id, "remote_id"),
        ] {
            if !enabled {
                continue;
            }
            if source.jsonl_path.trim().is_empty() {
                errors.push(format!("{name}.jsonl_path must not be empty"));
            }
            check_positive(
                source.tail_poll_interval_ms,
                &format!("{name}.tail_poll_interval_ms"),
                &mut errors,
            );
        }

        check_positive(self.bus.max_queue_size as u64, "bus.max_queue_size", &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

fn check_positive(value: u64, name: &str, errors: &mut Vec<String>) {
    if value == 0 {
        errors.push(format!("{name} must be greater than zero"));
    }
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config I/O error ({}): {}", .0.display(), .1)]
    Io(PathBuf, std::io::Error),

    #[error("Config parse error ({}): {}", .0.display(), .1)]
    Parse(PathBuf, toml::de::Error),

    #[error("Config serialization error: {0}")]
    Serialize(toml::ser::Error),

    #[error("Config validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
}

// ============================================================================
// Tables
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemControllerConfig {
    /// API root, e.g. `http://127.0.0.1:8010/api/v1`
    pub base_url: String,
    pub timeout_secs: u64,
    /// Sent as `X-API-Key` when set
    pub api_key: Option<String>,
}

impl Default for SystemControllerConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::SYSTEM_CONTROLLER_BASE_URL.to_string(),
            timeout_secs: defaults::SYSTEM_CONTROLLER_TIMEOUT_SECS,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Fallback device path
    pub port: String,
    /// Preferred: first entry of this directory, when present and non-empty
    pub by_id_dir: Option<String>,
    pub baud_rate: u32,
    pub reconnect_delay_ms: u64,
    pub command_timeout_ms: u64,
    pub command_retries: u32,
    pub max_line_bytes: usize,
    pub read_chunk_bytes: usize,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: defaults::SERIAL_PORT.to_string(),
            by_id_dir: Some(defaults::SERIAL_BY_ID_DIR.to_string()),
            baud_rate: defaults::SERIAL_BAUD_RATE,
            reconnect_delay_ms: defaults::SERIAL_RECONNECT_DELAY_MS,
            command_timeout_ms: defaults::SERIAL_COMMAND_TIMEOUT_MS,
            command_retries: defaults::SERIAL_COMMAND_RETRIES,
            max_line_bytes: defaults::SERIAL_MAX_LINE_BYTES,
            read_chunk_bytes: defaults::SERIAL_READ_CHUNK_BYTES,
        }
    }
}

/// A tailed JSONL log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonlSourceConfig {
    pub jsonl_path: String,
    pub tail_poll_interval_ms: u64,
}

impl JsonlSourceConfig {
    fn remote_id() -> Self {
        Self {
            jsonl_path: defaults::REMOTE_ID_JSONL_PATH.to_string(),
            ..Self::default()
        }
    }
}

impl Default for JsonlSourceConfig {
    fn default() -> Self {
        Self {
            jsonl_path: defaults::RF_JSONL_PATH.to_string(),
            tail_poll_interval_ms: defaults::TAIL_POLL_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub system_controller_interval_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            system_controller_interval_ms: defaults::SYSTEM_CONTROLLER_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Gate for reboot/shutdown; off unless explicitly enabled
    pub allow_unsafe_operations: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub max_queue_size: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_queue_size: defaults::BUS_MAX_QUEUE_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeaturesConfig {
    pub enable_rf: bool,
    pub enable_remote_id: bool,
    pub enable_serial: bool,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            enable_rf: true,
            enable_remote_id: true,
            enable_serial: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter directive, e.g. `info` or `ndefender_aggregator=debug`
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = AggregatorConfig::default();
        assert!(config.validate().is_ok(), "Default config must always validate");
    }

    #[test]
    fn test_empty_toml_produces_defaults() {
        let config = AggregatorConfig::from_toml("").expect("empty TOML should parse");
        assert_eq!(config, AggregatorConfig::default());
        assert_eq!(config.serial.by_id_dir.as_deref(), Some("/dev/serial/by-id"));
        assert_eq!(config.remote_id.jsonl_path, defaults::REMOTE_ID_JSONL_PATH);
        assert_eq!(config.rf.jsonl_path, defaults::RF_JSONL_PATH);
        assert!(!config.safety.allow_unsafe_operations);
    }

    #[test]
    fn test_partial_toml_override() {
        let toml_str = r#"
[serial]
port = "/dev/ttyACM0"
command_retries = 0

[remote_id]
tail_poll_interval_ms = 50

[features]
enable_rf = false
"#;
        let config = AggregatorConfig::from_toml(toml_str).expect("partial TOML should parse");
        assert_eq!(config.serial.port, "/dev/ttyACM0");
        assert_eq!(config.serial.command_retries, 0);
        assert_eq!(config.serial.baud_rate, 115_200);
        assert_eq!(config.remote_id.tail_poll_interval_ms, 50);
        assert_eq!(config.remote_id.jsonl_path, defaults::REMOTE_ID_JSONL_PATH);
        assert!(!config.features.enable_rf);
        assert!(config.features.enable_serial);
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let toml_str = r#"
[polling]
system_controller_interval_ms = 0

[bus]
max_queue_size = 0

[rf]
jsonl_path = ""
"#;
        let err = AggregatorConfig::from_toml(toml_str).unwrap_err();
        let errors = match err {
            ConfigError::Validation(errors) => errors,
            other => panic!("expected validation error, got {other}"),
        };
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.contains("polling.system_controller_interval_ms")));
        assert!(errors.iter().any(|e| e.contains("bus.max_queue_size")));
        assert!(errors.iter().any(|e| e.contains("rf.jsonl_path")));
    }

    #[test]
    fn test_disabled_source_not_validated() {
        let toml_str = r#"
[features]
enable_rf = false

[rf]
jsonl_path = ""
"#;
        assert!(AggregatorConfig::from_toml(toml_str).is_ok());
    }

    #[test]
    fn test_load_from_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aggregator.toml");
        std::fs::write(&path, "[serial\nport = 1").unwrap();
        let err = AggregatorConfig::load_from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(ref p, _) if p == &path));

        std::fs::write(&path, "[safety]\nallow_unsafe_operations = true\n").unwrap();
        let config = AggregatorConfig::load_from_file(&path).unwrap();
        assert!(config.safety.allow_unsafe_operations);

        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            AggregatorConfig::load_from_file(&missing),
            Err(ConfigError::Io(_, _))
        ));
    }

    #[test]
    fn test_search_prefers_env_file() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = dir.path().join("env.toml");
        std::fs::write(&env_file, "[logging]\nlevel = \"debug\"\n").unwrap();
        std::fs::write(dir.path().join(LOCAL_CONFIG_FILE), "[logging]\nlevel = \"warn\"\n").unwrap();

        let search = AggregatorConfig::search(Some(env_file.clone()), dir.path());
        assert_eq!(search.source, ConfigSource::File(env_file));
        assert_eq!(search.config.logging.level, "debug");
        assert!(search.skipped.is_empty());
    }

    #[test]
    fn test_search_falls_back_to_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join(LOCAL_CONFIG_FILE);
        std::fs::write(&local, "[logging]\nlevel = \"warn\"\n").unwrap();

        let search = AggregatorConfig::search(Some(dir.path().join("gone.toml")), dir.path());
        assert_eq!(search.source, ConfigSource::File(local));
        assert_eq!(search.config.logging.level, "warn");
        assert_eq!(search.skipped.len(), 1);
        assert!(search.skipped[0].contains(CONFIG_ENV));
    }

    #[test]
    fn test_search_skips_invalid_files_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = dir.path().join("env.toml");
        std::fs::write(&env_file, "[bus]\nmax_queue_size = 0\n").unwrap();
        std::fs::write(dir.path().join(LOCAL_CONFIG_FILE), "not = [toml").unwrap();

        let search = AggregatorConfig::search(Some(env_file), dir.path());
        assert_eq!(search.source, ConfigSource::Defaults);
        assert_eq!(search.config, AggregatorConfig::default());
        assert_eq!(search.skipped.len(), 2);

        let empty = tempfile::tempdir().unwrap();
        let search = AggregatorConfig::search(None, empty.path());
        assert_eq!(search.source, ConfigSource::Defaults);
        assert!(search.skipped.is_empty());
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = AggregatorConfig::default();
        config.system_controller.api_key = Some("secret".into());
        let text = config.to_toml().unwrap();
        assert_eq!(AggregatorConfig::from_toml(&text).unwrap(), config);
    }
}
