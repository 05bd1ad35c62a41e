//! # sensebee_mqtt: pumped MQTT transport
//!
//! Broker transport for the sensebee telemetry agent, built on `rumqttc`.
//! Unlike a background connection task, the session here is driven entirely
//! by its owner: every access calls [`MqttSession::pump`], which services
//! keep-alives, flushes queued publishes and reports the outcome of a pending
//! connect as a [`SessionEvent`]. A failed session is discarded and rebuilt
//! from scratch by the owner; there is no internal retry timer.
//!
//! ```ignore
//! let mut session = MqttSession::connect(&config)?;
//! for event in session.pump().await? {
//!     if event == SessionEvent::Connected {
//!         session.publish("sensors/air/temperature", "21.4")?;
//!     }
//! }
//! session.pump().await?; // flushes the publish
//! ```
//!
//! ## Modules
//!
//! * `config` - connection settings with `validator` constraints
//! * `client` - `ClientBuilder` over rumqttc options, TLS loading
//! * `session` - the pumped session and connect-outcome events
//! * `state` - three-state connection enum
//! * `error` - `TransferError`

pub mod client;
pub mod config;
pub mod error;
pub mod session;
pub mod state;

pub use client::ClientBuilder;
pub use config::{Config, TlsConfig};
pub use error::TransferError;
pub use session::{MqttSession, SessionEvent};
pub use state::ConnectionState;

pub type Result<T> = std::result::Result<T, TransferError>;
