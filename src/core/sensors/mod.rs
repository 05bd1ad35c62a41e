//! Configured sensors and their readouts.
//!
//! A [`Sensor`] is built once from one `[[Sensors]]` entry. Every field of a
//! readout is resolved in two levels: `Readouts.<key>.<Field>` first, then the
//! sensor-wide `<Field>`, then a default (see [`resolve`]). A sensor without a
//! `Readouts` table has a single unkeyed readout.
//!
//! ```toml
//! [[Sensors]]
//! Name = "climate"
//! Group = "greenhouse"
//! Backend = "shtc3"
//! Interval = "10s"
//! Precision = 1
//!
//! [Sensors.Readouts.temperature]
//! Name = "temperature"
//! Unit = "°C"
//!
//! [Sensors.Readouts.humidity]
//! Name = "humidity"
//! Index = "relative_humidity"
//! Precision = 0
//! ```
//!
//! Reads never fail outward: [`Sensor::read`] logs backend errors and returns
//! no readings for that call.

use std::{collections::HashSet, fmt, str::FromStr, time::Duration};

use rand::Rng;
use time::OffsetDateTime;
use toml::Value;
use tracing::{debug, info, warn};

use self::{
    bus::with_bus,
    chips::ChipKind,
    error::{SensorError, SensorResult},
    registry::{ChipRequest, DeviceKey, DeviceRegistry},
    types::{Reading, SeriesKey, Timestamp, Values},
};
use crate::config::{parse_duration, tree::as_f64, ConfigError, ConfigTree, DEFAULT_INTERVAL};

pub mod bus;
pub mod chips;
pub mod error;
pub mod registry;
pub mod types;

/// Looks `field` up for one readout: readout override, then sensor-wide value.
pub fn resolve<'a>(config: &'a ConfigTree, readout: Option<&str>, field: &str) -> Option<&'a Value> {
    readout
        .and_then(|key| config.get(&format!("Readouts.{}.{}", key, field)))
        .or_else(|| config.get(field))
}

/// Keys of the `Readouts` table, or a single `None` for an unkeyed sensor.
pub fn readout_keys(config: &ConfigTree) -> Vec<Option<String>> {
    match config.get("Readouts").and_then(Value::as_table) {
        Some(table) => table.keys().cloned().map(Some).collect(),
        None => vec![None],
    }
}

/// Backend family a sensor is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Raw register block read from a generic I2C device.
    I2c,
    Chip(ChipKind),
    /// Uniform random values between `Min` and `Max`.
    Random,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "i2c" => Ok(BackendKind::I2c),
            "random" => Ok(BackendKind::Random),
            other => other.parse().map(BackendKind::Chip),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::I2c => f.write_str("i2c"),
            BackendKind::Chip(kind) => write!(f, "{}", kind),
            BackendKind::Random => f.write_str("random"),
        }
    }
}

/// Device channel a readout is taken from.
#[derive(Debug, Clone, PartialEq)]
pub enum Channel {
    Named(String),
    Position(usize),
}

/// One logical measurement of a sensor, fully resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct Readout {
    pub key: Option<String>,
    pub group: String,
    pub name: String,
    pub topic: String,
    pub unit: Option<String>,
    pub precision: u32,
    pub scale: f64,
    pub offset: f64,
    pub channel: Option<Channel>,
    pub register: usize,
    pub length: usize,
    pub min: f64,
    pub max: f64,
}

impl Readout {
    fn from_config(config: &ConfigTree, key: Option<String>) -> Result<Self, ConfigError> {
        let field = |name: &str| resolve(config, key.as_deref(), name);
        let text = |name: &str| field(name).and_then(Value::as_str).map(str::to_string);
        let number = |name: &str, default: f64| field(name).and_then(as_f64).unwrap_or(default);
        let integer = |name: &str, default: i64, max: i64| -> Result<i64, ConfigError> {
            match field(name) {
                None => Ok(default),
                Some(value) => value
                    .as_integer()
                    .filter(|v| (0..=max).contains(v))
                    .ok_or_else(|| {
                        ConfigError::ValidationError(format!(
                            "{} must be an integer between 0 and {}, got {}",
                            name, max, value
                        ))
                    }),
            }
        };

        let name = text("Name").unwrap_or_default();
        let group = text("Group").unwrap_or_default();
        let topic = text("Topic").unwrap_or_else(|| format!("sensors/{}/{}", group, name));

        let channel = match field("Index") {
            None => None,
            Some(Value::String(channel)) => Some(Channel::Named(channel.clone())),
            Some(Value::Integer(position)) if *position >= 0 => {
                Some(Channel::Position(*position as usize))
            }
            Some(other) => {
                return Err(ConfigError::ValidationError(format!(
                    "Index must be a channel name or position, got {}",
                    other
                )))
            }
        };

        let readout = Readout {
            unit: text("Unit"),
            precision: integer("Precision", 0, 15)? as u32,
            scale: number("Scale", 1.0),
            offset: number("Offset", 0.0),
            channel,
            register: integer("Register", 0, 255)? as usize,
            length: integer("Length", 2, 8)? as usize,
            min: number("Min", 0.0),
            max: number("Max", 100.0),
            key,
            group,
            name,
            topic,
        };

        for (field, value) in [
            ("Scale", readout.scale),
            ("Offset", readout.offset),
            ("Min", readout.min),
            ("Max", readout.max),
        ] {
            if !value.is_finite() {
                return Err(ConfigError::ValidationError(format!(
                    "{} of '{}' must be a finite number",
                    field,
                    readout.series_key()
                )));
            }
        }
        if readout.scale == 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "Scale of '{}' must not be zero",
                readout.series_key()
            )));
        }
        if readout.length == 0 {
            return Err(ConfigError::ValidationError(format!(
                "Length of '{}' must be at least 1",
                readout.series_key()
            )));
        }
        if readout.min > readout.max {
            return Err(ConfigError::ValidationError(format!(
                "Min of '{}' exceeds Max",
                readout.series_key()
            )));
        }
        Ok(readout)
    }

    pub fn series_key(&self) -> SeriesKey {
        SeriesKey {
            group: self.group.clone(),
            name: self.name.clone(),
        }
    }

    /// Big-endian unsigned value of this readout's slice of `block`, scaled.
    fn decode(&self, block: &[u8]) -> f64 {
        let raw = block[self.register..self.register + self.length]
            .iter()
            .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
        raw as f64 / self.scale + self.offset
    }

    /// Position of this readout's value among `channels`. Without an `Index`
    /// the readout key names the channel; an unkeyed readout takes the first.
    fn channel_position(&self, channels: &[&str]) -> Option<usize> {
        let by_name = |name: &str| channels.iter().position(|c| *c == name);
        match (&self.channel, &self.key) {
            (Some(Channel::Named(name)), _) => by_name(name),
            (Some(Channel::Position(position)), _) => {
                Some(*position).filter(|p| *p < channels.len())
            }
            (None, Some(key)) => by_name(key),
            (None, None) => Some(0).filter(|_| !channels.is_empty()),
        }
    }

    fn reading(&self, timestamp: Timestamp, value: f64) -> Reading {
        Reading {
            group: self.group.clone(),
            name: self.name.clone(),
            unit: self.unit.clone(),
            precision: self.precision,
            topic: self.topic.clone(),
            values: Values::from([(timestamp, value)]),
        }
    }
}

pub struct Sensor {
    label: String,
    backend: BackendKind,
    interval: Duration,
    bus: u8,
    address: Option<u16>,
    power_pin: Option<u8>,
    reboot_interval: Option<Duration>,
    readouts: Vec<Readout>,
    last_read: Option<OffsetDateTime>,
}

impl fmt::Debug for Sensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sensor")
            .field("label", &self.label)
            .field("backend", &self.backend)
            .field("interval", &self.interval)
            .field("readouts", &self.readouts.len())
            .field("last_read", &self.last_read)
            .finish()
    }
}

impl Sensor {
    /// Resolves one `[[Sensors]]` entry.
    pub fn from_config(config: &ConfigTree) -> Result<Self, ConfigError> {
        let label = config.get_str("Name").unwrap_or("<unnamed>").to_string();

        let backend = config
            .get_str("Backend")
            .ok_or_else(|| ConfigError::MissingBackend(label.clone()))?;
        let backend: BackendKind = backend.parse().map_err(|_| ConfigError::UnknownBackend {
            sensor: label.clone(),
            backend: backend.to_string(),
        })?;

        let interval = config.get_interval(Some(DEFAULT_INTERVAL))?;
        let reboot_interval = match config.get("RebootInterval") {
            None => None,
            Some(Value::String(text)) => Some(parse_duration(text)?),
            Some(Value::Integer(secs)) => Some(parse_duration(&secs.to_string())?),
            Some(other) => return Err(ConfigError::InvalidDuration(other.to_string())),
        };

        let small_int = |path: &str, max: i64| -> Result<Option<i64>, ConfigError> {
            match config.get(path) {
                None => Ok(None),
                Some(value) => value
                    .as_integer()
                    .filter(|v| (0..=max).contains(v))
                    .map(Some)
                    .ok_or_else(|| {
                        ConfigError::ValidationError(format!(
                            "{} of sensor '{}' must be an integer between 0 and {}",
                            path, label, max
                        ))
                    }),
            }
        };
        let bus = small_int("I2C.Bus", 255)?.unwrap_or(1) as u8;
        let address = small_int("I2C.Address", 0x3FF)?.map(|a| a as u16);
        let power_pin = small_int("GPIO.Power", 63)?.map(|p| p as u8);

        let readouts = readout_keys(config)
            .into_iter()
            .map(|key| Readout::from_config(config, key))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            label,
            backend,
            interval,
            bus,
            address,
            power_pin,
            reboot_interval,
            readouts,
            last_read: None,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn readouts(&self) -> &[Readout] {
        &self.readouts
    }

    pub fn last_read(&self) -> Option<OffsetDateTime> {
        self.last_read
    }

    /// True when `interval` has passed since the last attempted read, or when
    /// the sensor was never read.
    pub fn should_read_now(&self, now: OffsetDateTime) -> bool {
        match self.last_read {
            None => true,
            Some(last) => now - last >= self.interval,
        }
    }

    /// Records an attempted read, successful or not.
    pub fn mark_read(&mut self, now: OffsetDateTime) {
        self.last_read = Some(now);
    }

    /// One reading per readout, all stamped `now`. Backend failures are logged
    /// and yield an empty list.
    pub fn read(&self, registry: &mut DeviceRegistry, now: OffsetDateTime) -> Vec<Reading> {
        match self.sample(registry, now) {
            Ok(values) => {
                let timestamp = now.unix_timestamp();
                self.readouts
                    .iter()
                    .zip(values)
                    .map(|(readout, value)| readout.reading(timestamp, value))
                    .collect()
            }
            Err(e) if e.is_transient() => {
                debug!(sensor = %self.label, "No reading this tick: {}", e);
                Vec::new()
            }
            Err(e) => {
                warn!(sensor = %self.label, backend = %self.backend, "Read failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Raw values in readout order.
    fn sample(&self, registry: &mut DeviceRegistry, now: OffsetDateTime) -> SensorResult<Vec<f64>> {
        match self.backend {
            BackendKind::I2c => self.read_register_block(registry),
            BackendKind::Chip(kind) => self.read_chip(kind, registry, now),
            BackendKind::Random => {
                let mut rng = rand::thread_rng();
                Ok(self
                    .readouts
                    .iter()
                    .map(|r| rng.gen_range(r.min..=r.max))
                    .collect())
            }
        }
    }

    /// One block read covering every readout's registers, then per-readout
    /// slices. Any bus error discards the whole block.
    fn read_register_block(&self, registry: &mut DeviceRegistry) -> SensorResult<Vec<f64>> {
        let address = self.address.ok_or(SensorError::UndefinedAddress)?;
        let span = self
            .readouts
            .iter()
            .map(|r| r.register + r.length)
            .max()
            .unwrap_or(0);

        let mut block = vec![0u8; span];
        let bus = registry.bus(self.bus)?;
        with_bus(&bus, |bus| bus.write_read(address, &[0x00], &mut block))?;

        Ok(self.readouts.iter().map(|r| r.decode(&block)).collect())
    }

    fn read_chip(
        &self,
        kind: ChipKind,
        registry: &mut DeviceRegistry,
        now: OffsetDateTime,
    ) -> SensorResult<Vec<f64>> {
        let request = ChipRequest {
            key: DeviceKey {
                kind,
                bus: self.bus,
                address: self.address.unwrap_or_else(|| kind.default_address()),
            },
            power_pin: self.power_pin,
            reboot_interval: self.reboot_interval,
        };

        let driver = registry.chip(&request, now)?;
        let measured = match driver.measure() {
            Ok(measured) => measured,
            Err(e) => {
                if !e.is_transient() {
                    registry.evict(&request.key);
                }
                return Err(e);
            }
        };

        let channels = kind.channels();
        self.readouts
            .iter()
            .map(|readout| {
                readout
                    .channel_position(channels)
                    .and_then(|position| measured.get(position).copied())
                    .ok_or_else(|| SensorError::UnmappedReadout {
                        readout: readout.key.clone().unwrap_or_else(|| readout.name.clone()),
                        backend: kind.to_string(),
                    })
            })
            .collect()
    }
}

/// Builds the runtime sensor list, skipping entries with `Active = false`.
///
/// Fails on the first invalid entry, and when two readouts share a
/// `(group, name)` identity.
pub fn build_sensors(tree: &ConfigTree) -> Result<Vec<Sensor>, ConfigError> {
    let mut seen = HashSet::new();
    let mut sensors = Vec::new();

    for entry in tree.sensors() {
        if entry.get_bool("Active") == Some(false) {
            info!(
                "Sensor '{}' is inactive, skipping",
                entry.get_str("Name").unwrap_or("<unnamed>")
            );
            continue;
        }

        let sensor = Sensor::from_config(&entry)?;
        for readout in sensor.readouts() {
            let key = readout.series_key();
            if !seen.insert(key.clone()) {
                return Err(ConfigError::DuplicateSensor {
                    group: key.group,
                    name: key.name,
                });
            }
        }
        debug!(
            "Configured sensor '{}' ({}, every {:?}, {} readouts)",
            sensor.label(),
            sensor.backend(),
            sensor.interval(),
            sensor.readouts().len()
        );
        sensors.push(sensor);
    }

    Ok(sensors)
}
