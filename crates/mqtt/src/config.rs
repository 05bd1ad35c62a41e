//! Broker connection settings.
//!
//! The `[transport]` section of the agent configuration deserializes straight
//! into [`Config`]. Every field has a default so a minimal section only needs
//! `host`. Validation runs through the `validator` crate when the agent loads
//! its configuration, so malformed settings fail at startup rather than at the
//! first connect attempt.
//!
//! ```toml
//! [transport]
//! host = "broker.local"
//! port = 1883
//! username = "sensors"
//! password = "secret"
//! base_topic = "greenhouse"
//! ```

use std::path::Path;

use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// MQTT connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    /// Optional prefix applied to every published topic.
    ///
    /// When non-empty the session also registers a retained last-will
    /// (`<base_topic>/status` = `offline`) and announces `online` after
    /// each successful connect.
    #[validate(length(max = 255, message = "Base topic must not exceed 255 characters"))]
    pub base_topic: String,

    /// Broker hostname or IP address.
    #[validate(length(
        min = 1,
        max = 255,
        message = "Host must be between 1 and 255 characters"
    ))]
    pub host: String,

    /// Broker port (1883 plain, 8883 TLS).
    #[validate(range(min = 1, max = 65535, message = "Port must be between 1 and 65535"))]
    pub port: u16,

    /// Seconds the transport may spend establishing TCP/TLS before the
    /// connect attempt counts as failed.
    #[validate(range(
        min = 1,
        max = 300,
        message = "Connection timeout must be between 1 and 300 seconds"
    ))]
    pub connection_timeout: u64,

    /// Request a clean session from the broker.
    pub clean_session: bool,

    /// Maximum number of unacknowledged QoS 1/2 publishes.
    #[validate(range(min = 1, max = 65535, message = "Max inflight must be at least 1"))]
    pub max_inflight: u16,

    /// Keep-alive interval in seconds. The session pump sends the pings.
    #[validate(range(
        min = 5,
        max = 3600,
        message = "Keep alive must be between 5 and 3600 seconds"
    ))]
    pub keep_alive: u64,

    /// Client identifier. A random UUID is used when empty.
    #[validate(length(max = 36, message = "Client id must not exceed 36 characters"))]
    pub client_id: String,

    /// Broker username. Credentials are only sent when both parts are set.
    pub username: Option<String>,

    /// Broker password.
    pub password: Option<String>,

    /// Maximum packet size in bytes for both directions.
    #[validate(range(min = 64, max = 268_435_455, message = "Invalid max packet size"))]
    pub max_packet_size: Option<u32>,

    /// Capacity of the request channel between client handle and event loop.
    #[validate(range(min = 1, message = "Request channel capacity must be at least 1"))]
    pub request_channel_capacity: Option<u32>,

    /// How long, in milliseconds, a single pump keeps servicing the event loop.
    #[validate(range(
        min = 10,
        max = 10_000,
        message = "Pump window must be between 10 and 10000 milliseconds"
    ))]
    pub pump_window_ms: u64,

    /// QoS used for every aggregate publish.
    #[validate(range(min = 0, max = 2, message = "Invalid QoS value, must be 0, 1, or 2"))]
    pub qos: u8,

    /// Ask the broker to retain published aggregates.
    pub retain: bool,

    /// Optional TLS material.
    #[validate(nested)]
    pub tls: Option<TlsConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            base_topic: String::new(),
            host: "localhost".to_string(),
            port: 1883,
            connection_timeout: 10,
            clean_session: true,
            max_inflight: 10,
            keep_alive: 60,
            client_id: String::new(),
            username: None,
            password: None,
            max_packet_size: Some(65_535),
            request_channel_capacity: Some(64),
            pump_window_ms: 200,
            qos: 0,
            retain: false,
            tls: None,
        }
    }
}

impl Config {
    /// Publish QoS as the rumqttc enum. Out-of-range values fall back to
    /// at-most-once; validation rejects them before this is reached.
    pub fn qos(&self) -> QoS {
        match self.qos {
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtMostOnce,
        }
    }

    /// Username and password when both are configured.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user.as_str(), pass.as_str())),
            _ => None,
        }
    }
}

/// TLS certificate paths. TLS is enabled once `ca_cert_path` is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM encoded CA bundle used to verify the broker.
    #[validate(custom(
        function = "validate_file_exists",
        message = "CA certificate file does not exist"
    ))]
    pub ca_cert_path: Option<String>,

    /// PEM encoded client certificate for mutual TLS.
    #[validate(custom(
        function = "validate_file_exists",
        message = "Client certificate file does not exist"
    ))]
    pub client_cert_path: Option<String>,

    /// Unencrypted PEM private key matching `client_cert_path`.
    #[validate(custom(
        function = "validate_file_exists",
        message = "Client key file does not exist"
    ))]
    pub client_key_path: Option<String>,
}

impl TlsConfig {
    pub fn new(
        ca_cert_path: impl Into<String>,
        client_cert_path: impl Into<String>,
        client_key_path: impl Into<String>,
    ) -> Self {
        TlsConfig {
            ca_cert_path: Some(ca_cert_path.into()),
            client_cert_path: Some(client_cert_path.into()),
            client_key_path: Some(client_key_path.into()),
        }
    }

    pub fn with_ca_only(ca_cert_path: impl Into<String>) -> Self {
        TlsConfig {
            ca_cert_path: Some(ca_cert_path.into()),
            ..Default::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.ca_cert_path.is_some()
    }

    pub fn has_client_auth(&self) -> bool {
        self.client_cert_path.is_some() && self.client_key_path.is_some()
    }

    /// Checks that the CA file exists and that client auth is either
    /// fully configured or absent.
    pub fn validate_files(&self) -> Result<(), ValidationError> {
        let Some(ca) = self.ca_cert_path.as_deref() else {
            return Err(ValidationError::new("missing_ca_cert")
                .with_message("CA certificate path is required".into()));
        };
        validate_file_exists(ca)?;

        match (&self.client_cert_path, &self.client_key_path) {
            (Some(cert), Some(key)) => {
                validate_file_exists(cert)?;
                validate_file_exists(key)
            }
            (None, None) => Ok(()),
            _ => Err(ValidationError::new("incomplete_client_auth").with_message(
                "Both client certificate and key must be provided or neither".into(),
            )),
        }
    }
}

fn validate_file_exists(path: &str) -> Result<(), ValidationError> {
    if path.is_empty() {
        return Err(
            ValidationError::new("empty_path").with_message("File path cannot be empty".into())
        );
    }

    let path_obj = Path::new(path);
    if !path_obj.is_file() {
        return Err(ValidationError::new("file_not_found")
            .with_message(format!("File does not exist: {path}").into()));
    }

    Ok(())
}
