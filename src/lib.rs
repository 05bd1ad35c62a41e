//! sensebee: periodic multi-sensor telemetry agent
//!
//! Samples environmental sensors (I2C climate, air-quality and CO2 chips, raw
//! register blocks, synthetic sources) at per-sensor intervals, buffers the
//! readings in memory and periodically publishes the mean of each buffered
//! series over MQTT.
//!
//! ## Modules
//!
//! * `config` - Configuration loading and validation. Typed sections are
//!   checked with the `validator` crate; the sensor entries are kept as a
//!   [`config::ConfigTree`] with dotted-path lookup.
//!
//! * `core` - Runtime components:
//!   - Sensors, chip drivers and the shared device registry
//!   - Collector and publisher loops and the buffer between them
//!   - Aggregation, scheduling and the single-instance guard
//!
//! * `logger` - Centralized logging initialization using `tracing`.
//!   Supports console output in multiple formats (compact, pretty, JSON)
//!   and optional systemd journald integration.
//!
//! ## Features
//!
//! * `hardware` - Raspberry Pi I2C and GPIO access through `rppal`. Without
//!   it every hardware backend reports itself unsupported and only the
//!   `random` backend produces readings.

pub mod config;
pub mod core;
pub mod logger;
