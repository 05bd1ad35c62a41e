//! Runtime engine: sensors, the shared buffer and the two loops around it.
//!
//! ```text
//!  Collector ──tick──> Sensor::read ──> DeviceRegistry ──> I2C / GPIO
//!      │
//!    merge
//!      v
//!  LatestDataStore
//!      │
//!    drain
//!      v
//!  Publisher ──aggregate──> BrokerClient ──> MQTT broker
//! ```

pub mod aggregate;
pub mod buffer;
pub mod collector;
pub mod executor;
pub mod guard;
pub mod publisher;
pub mod scheduler;
pub mod sensors;
