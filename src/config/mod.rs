//! Agent configuration loading and validation.
//!
//! One TOML document carries two kinds of settings:
//!
//! * typed snake_case sections (`[logger]`, `[transport]`, `[agent]`)
//!   deserialized with `serde` and checked with `validator`;
//! * the PascalCase sensor tree (`Interval`, `[[Sensors]]`) kept verbatim as a
//!   [`ConfigTree`] and resolved per readout at startup.
//!
//! The configuration is loaded once before the tracing subscriber exists and
//! is immutable afterwards.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use validator::Validate;

use self::{agent::AgentConfig, logger::LoggerConfig};

pub mod agent;
pub mod logger;
pub mod tree;

pub use tree::{parse_duration, ConfigTree, DEFAULT_INTERVAL};

const CONFIG_DIR: &str = "/etc/sensebee";
const CONFIG_ENV: &str = "SENSEBEE_CONFIG";

/// Timestamped console output for use before logging is initialized.
#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::startup_timestamp()).dim(),
            console::style("INFO").green(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::startup_timestamp()).dim(),
            console::style("WARN").yellow(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => {
        eprintln!("{}  {} {}",
            console::style($crate::config::startup_timestamp()).dim(),
            console::style("ERROR").red(),
            format_args!($($arg)*)
        );
    };
}

#[doc(hidden)]
pub fn startup_timestamp() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error while reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error while reading configuration: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    /// A duration string did not match `<digits>[s|m|h]`.
    #[error("Invalid time string: {0}")]
    InvalidDuration(String),

    /// No `Interval` key and no default to fall back to.
    #[error("Missing interval configuration")]
    MissingInterval,

    /// A sensor entry has no `Backend` key.
    #[error("Sensor '{0}' has no backend configured")]
    MissingBackend(String),

    #[error("Sensor '{sensor}' uses unknown backend '{backend}'")]
    UnknownBackend { sensor: String, backend: String },

    /// Two readouts resolve to the same `(group, name)` identity.
    #[error("Duplicate sensor identity: group '{group}', name '{name}'")]
    DuplicateSensor { group: String, name: String },
}

/// Top-level agent configuration.
#[derive(Serialize, Deserialize, Debug, Validate, Clone, Default)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub logger: LoggerConfig,

    /// Broker connection.
    #[validate(nested)]
    pub transport: TransportConfig,

    #[validate(nested)]
    pub agent: AgentConfig,

    /// The whole document, including the sensor entries.
    #[serde(skip)]
    pub tree: ConfigTree,
}

pub type TransportConfig = sensebee_mqtt::Config;

impl Config {
    /// Locates and loads the configuration file.
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = Self::get_config_path()?;
        Self::load(&config_path)
    }

    /// Priority:
    /// 1. `SENSEBEE_CONFIG` environment variable
    /// 2. `/etc/sensebee/config-<hostname>.toml`
    /// 3. `/etc/sensebee/config.toml`
    fn get_config_path() -> Result<PathBuf, ConfigError> {
        if let Ok(config_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(config_path);
            print_info!("Using config from {}: {}", CONFIG_ENV, path.display());
            return Ok(path);
        }

        let hostname = sysinfo::System::host_name();
        for candidate in candidate_paths(Path::new(CONFIG_DIR), hostname.as_deref()) {
            if candidate.exists() {
                print_info!("Using config path: {}", candidate.display());
                return Ok(candidate);
            }
        }

        Err(ConfigError::Config(
            "No configuration file found.".to_string(),
        ))
    }

    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::Config(path.to_string_lossy().to_string()));
        }

        let config = Self::from_toml(&fs::read_to_string(path)?)?;

        print_info!("Successfully loaded config from: {}", path.display());
        Ok(config)
    }

    /// Parses and validates a configuration document.
    pub fn from_toml(text: &str) -> Result<Config, ConfigError> {
        let mut config: Config =
            toml::from_str(text).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.tree = ConfigTree::parse(text)?;

        config
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        config.publish_interval()?;

        Ok(config)
    }

    /// Cadence of the publisher loop, from the top-level `Interval`.
    pub fn publish_interval(&self) -> Result<Duration, ConfigError> {
        let interval = self.tree.get_interval(None)?;
        if interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "Interval must be at least 1 second".into(),
            ));
        }
        Ok(interval)
    }

    pub fn collect_period(&self) -> Duration {
        Duration::from_secs(self.agent.collect_period)
    }
}

/// Host-specific file first, then the shared one.
fn candidate_paths(dir: &Path, hostname: Option<&str>) -> Vec<PathBuf> {
    let mut paths = Vec::with_capacity(2);
    if let Some(host) = hostname.filter(|h| !h.is_empty()) {
        paths.push(dir.join(format!("config-{}.toml", host)));
    }
    paths.push(dir.join("config.toml"));
    paths
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    const MINIMAL: &str = r#"
        Interval = "1m"

        [transport]
        host = "broker.local"

        [[Sensors]]
        Name = "gauge"
        Group = "lab"
        Backend = "random"
    "#;

    #[test]
    fn test_from_toml_reads_both_layers() {
        let config = Config::from_toml(MINIMAL).unwrap();

        assert_eq!(config.transport.host, "broker.local");
        assert_eq!(config.agent.collect_period, 1);
        assert_eq!(config.publish_interval().unwrap(), Duration::from_secs(60));
        assert_eq!(config.tree.sensors().len(), 1);
        assert_eq!(config.tree.get_str("Sensors"), None);
    }

    #[test]
    fn test_missing_interval_is_fatal() {
        let err = Config::from_toml("[transport]\nhost = \"x\"").unwrap_err();
        assert!(matches!(err, ConfigError::MissingInterval));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let err = Config::from_toml(r#"Interval = "0s""#).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_invalid_transport_rejected() {
        let err = Config::from_toml(
            r#"
            Interval = "10s"
            [transport]
            host = ""
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_parse_error_reported() {
        let err = Config::from_toml("Interval = ").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.transport.host, "broker.local");
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/sensebee.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Config(_)));
    }

    #[test]
    fn test_host_specific_path_comes_first() {
        let paths = candidate_paths(Path::new("/etc/sensebee"), Some("pi-greenhouse"));
        assert_eq!(
            paths,
            [
                PathBuf::from("/etc/sensebee/config-pi-greenhouse.toml"),
                PathBuf::from("/etc/sensebee/config.toml"),
            ]
        );

        let paths = candidate_paths(Path::new("/etc/sensebee"), None);
        assert_eq!(paths, [PathBuf::from("/etc/sensebee/config.toml")]);
    }
}
