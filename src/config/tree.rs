//! Untyped configuration tree with dotted-path lookup.
//!
//! Sensor entries and the publish `Interval` use the free-form PascalCase keys
//! sensor integrators are used to (`I2C.Address`, `Readouts.temperature.Unit`).
//! They are kept as an immutable [`toml::Value`] and resolved on demand:
//!
//! ```toml
//! Interval = "1m"
//!
//! [[Sensors]]
//! Name = "climate"
//! Group = "greenhouse"
//! Backend = "shtc3"
//! Interval = "10s"
//!
//! [Sensors.Readouts.temperature]
//! Unit = "°C"
//! Precision = 1
//! ```

use std::{sync::OnceLock, time::Duration};

use regex::Regex;
use toml::Value;

use super::ConfigError;

/// Sampling interval of a sensor that does not set `Interval`.
pub const DEFAULT_INTERVAL: &str = "1s";

/// Immutable view over a nested TOML document.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigTree {
    root: Value,
}

impl Default for ConfigTree {
    fn default() -> Self {
        Self {
            root: Value::Table(toml::Table::new()),
        }
    }
}

impl From<toml::Table> for ConfigTree {
    fn from(table: toml::Table) -> Self {
        Self {
            root: Value::Table(table),
        }
    }
}

impl ConfigTree {
    pub fn new(root: Value) -> Self {
        Self { root }
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let table: toml::Table =
            toml::from_str(text).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        Ok(table.into())
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    /// Walks `path` segment by segment. Stops with `None` as soon as a segment
    /// is missing or the current node is not a table.
    pub fn get(&self, path: &str) -> Option<&Value> {
        lookup(&self.root, path)
    }

    /// `get` with a caller-supplied fallback.
    pub fn get_or<'a>(&'a self, path: &str, default: &'a Value) -> &'a Value {
        self.get(path).unwrap_or(default)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    pub fn get_bool(&self, path: &str) -> Option<bool> {
        self.get(path).and_then(Value::as_bool)
    }

    pub fn get_i64(&self, path: &str) -> Option<i64> {
        self.get(path).and_then(Value::as_integer)
    }

    /// Floats also accept integer literals, so `Scale = 10` works.
    pub fn get_f64(&self, path: &str) -> Option<f64> {
        self.get(path).and_then(as_f64)
    }

    /// Returns the node at `path` as its own tree when it is a table.
    pub fn subtree(&self, path: &str) -> Option<ConfigTree> {
        self.get(path)
            .filter(|v| v.is_table())
            .map(|v| ConfigTree::new(v.clone()))
    }

    /// Entries of the `[[Sensors]]` array, in file order. Non-table entries
    /// are skipped.
    pub fn sensors(&self) -> Vec<ConfigTree> {
        self.get("Sensors")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|v| v.is_table())
                    .cloned()
                    .map(ConfigTree::new)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Resolves the `Interval` key of this tree.
    ///
    /// Integers are taken as seconds. When the key is absent `default` is
    /// parsed instead; with no default the result is
    /// [`ConfigError::MissingInterval`].
    pub fn get_interval(&self, default: Option<&str>) -> Result<Duration, ConfigError> {
        match self.get("Interval") {
            Some(Value::String(text)) => parse_duration(text),
            Some(Value::Integer(secs)) => parse_duration(&secs.to_string()),
            Some(other) => Err(ConfigError::InvalidDuration(other.to_string())),
            None => match default {
                Some(text) => parse_duration(text),
                None => Err(ConfigError::MissingInterval),
            },
        }
    }
}

pub(crate) fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(root, |node, segment| node.as_table()?.get(segment))
}

pub(crate) fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Float(f) => Some(*f),
        Value::Integer(i) => Some(*i as f64),
        _ => None,
    }
}

fn duration_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\d+)([smh]?)$").unwrap_or_else(|e| panic!("duration pattern: {e}"))
    })
}

/// Parses `"<digits>[s|m|h]"` into a duration. A bare number is seconds.
///
/// ```
/// # use std::time::Duration;
/// # use sensebee::config::parse_duration;
/// assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
/// assert!(parse_duration("abc").is_err());
/// ```
pub fn parse_duration(text: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration(text.to_string());

    let caps = duration_pattern().captures(text).ok_or_else(invalid)?;
    let number: u64 = caps[1].parse().map_err(|_| invalid())?;
    let factor = match &caps[2] {
        "" | "s" => 1,
        "m" => 60,
        "h" => 3600,
        _ => return Err(invalid()),
    };

    number
        .checked_mul(factor)
        .map(Duration::from_secs)
        .ok_or_else(invalid)
}
