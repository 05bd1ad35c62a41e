//! MQTT client builder.
//!
//! Wraps rumqttc's `MqttOptions` so the session can be created from a
//! [`Config`] in one call while tests and tools can still assemble options
//! fluently:
//!
//! ```ignore
//! let (client, event_loop) = ClientBuilder::new("gauge", "localhost", 1883, 16)?
//!     .keep_alive(30)
//!     .credentials("user", "pass")
//!     .build()?;
//! ```

use std::{fs, time::Duration};

use rumqttc::{AsyncClient, EventLoop, LastWill, MqttOptions, QoS, TlsConfiguration, Transport};
use validator::Validate;

use super::{
    config::{Config, TlsConfig},
    error::TransferError,
};

/// Accumulates connection options and produces a client/event-loop pair.
pub struct ClientBuilder {
    opts: MqttOptions,
    cap: usize,
    connection_timeout: u64,
    tls_config: Option<TlsConfig>,
}

impl ClientBuilder {
    /// Creates a builder for a plain TCP connection.
    pub fn new(
        client_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        cap: usize,
    ) -> Result<Self, TransferError> {
        Ok(Self {
            opts: MqttOptions::new(client_id, host, port),
            cap,
            connection_timeout: 10,
            tls_config: None,
        })
    }

    /// Validates `config` and translates it into builder settings.
    pub fn from_config(config: &Config) -> Result<Self, TransferError> {
        config.validate()?;

        let client_id = if config.client_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            config.client_id.clone()
        };
        let cap = config.request_channel_capacity.unwrap_or(10) as usize;

        let mut builder = Self::new(client_id, config.host.clone(), config.port, cap)?
            .keep_alive(config.keep_alive)
            .clean_session(config.clean_session)
            .max_inflight(config.max_inflight)
            .connection_timeout(config.connection_timeout);

        if let Some(size) = config.max_packet_size {
            builder = builder.max_packet_size(size as usize, size as usize);
        }
        if let Some((user, pass)) = config.credentials() {
            builder = builder.credentials(user, pass);
        }
        if !config.base_topic.is_empty() {
            builder = builder.set_last_will(&config.base_topic);
        }
        if let Some(tls) = config.tls.as_ref().filter(|tls| tls.is_enabled()) {
            builder.tls_config = Some(tls.clone());
        }

        Ok(builder)
    }

    pub fn keep_alive(mut self, secs: u64) -> Self {
        self.opts.set_keep_alive(Duration::from_secs(secs));
        self
    }

    pub fn max_packet_size(mut self, incoming: usize, outgoing: usize) -> Self {
        self.opts.set_max_packet_size(incoming, outgoing);
        self
    }

    pub fn clean_session(mut self, clean: bool) -> Self {
        self.opts.set_clean_session(clean);
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.opts.set_credentials(username, password);
        self
    }

    pub fn max_inflight(mut self, max: u16) -> Self {
        self.opts.set_inflight(max);
        self
    }

    /// Seconds allowed for the TCP/TLS handshake of each connect attempt.
    pub fn connection_timeout(mut self, secs: u64) -> Self {
        self.connection_timeout = secs;
        self
    }

    /// Registers a retained `offline` last-will on `<base_topic>/status`.
    pub fn set_last_will(mut self, base_topic: &str) -> Self {
        let last_will = LastWill::new(
            format!("{}/status", base_topic.trim_end_matches('/')),
            "offline".as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
        );
        self.opts.set_last_will(last_will);
        self
    }

    pub fn with_tls(
        mut self,
        ca_cert_path: impl Into<String>,
        client_cert_path: impl Into<String>,
        client_key_path: impl Into<String>,
    ) -> Self {
        self.tls_config = Some(TlsConfig::new(
            ca_cert_path,
            client_cert_path,
            client_key_path,
        ));
        self
    }

    pub fn with_tls_ca_only(mut self, ca_cert_path: impl Into<String>) -> Self {
        self.tls_config = Some(TlsConfig::with_ca_only(ca_cert_path));
        self
    }

    fn build_tls_transport(tls: &TlsConfig) -> Result<Transport, TransferError> {
        tls.validate_files()
            .map_err(|e| TransferError::ClientSetup(format!("Invalid TLS configuration: {}", e)))?;

        let ca_path = tls
            .ca_cert_path
            .as_deref()
            .ok_or_else(|| TransferError::ClientSetup("TLS configuration is not set".into()))?;
        let ca = fs::read(ca_path)?;

        let client_auth = match (&tls.client_cert_path, &tls.client_key_path) {
            (Some(cert), Some(key)) => Some((fs::read(cert)?, fs::read(key)?)),
            _ => None,
        };

        Ok(Transport::Tls(TlsConfiguration::Simple {
            ca,
            client_auth,
            alpn: None,
        }))
    }

    /// Consumes the builder. The event loop does not touch the network until
    /// it is first polled.
    pub fn build(self) -> Result<(AsyncClient, EventLoop), TransferError> {
        let mut opts = self.opts;
        if let Some(tls) = &self.tls_config {
            opts.set_transport(Self::build_tls_transport(tls)?);
        }

        let (client, mut event_loop) = AsyncClient::new(opts, self.cap);
        event_loop
            .network_options
            .set_connection_timeout(self.connection_timeout);

        Ok((client, event_loop))
    }
}

#[cfg(test)]
mod tests {
    use std::{fs::File, io::Write};

    use tempfile::TempDir;

    use super::*;

    struct TestFiles {
        _temp_dir: TempDir,
        ca_cert: String,
        client_cert: String,
        client_key: String,
    }

    impl TestFiles {
        fn new() -> std::io::Result<Self> {
            let temp_dir = TempDir::new()?;
            let ca_cert = temp_dir.path().join("ca.crt");
            let client_cert = temp_dir.path().join("client.crt");
            let client_key = temp_dir.path().join("client.key");

            File::create(&ca_cert)?.write_all(b"ca certificate content")?;
            File::create(&client_cert)?.write_all(b"client certificate content")?;
            File::create(&client_key)?.write_all(b"client key content")?;

            Ok(TestFiles {
                _temp_dir: temp_dir,
                ca_cert: ca_cert.to_string_lossy().into_owned(),
                client_cert: client_cert.to_string_lossy().into_owned(),
                client_key: client_key.to_string_lossy().into_owned(),
            })
        }
    }

    #[tokio::test]
    async fn test_build_tcp_client() {
        let result = ClientBuilder::new("test_client", "localhost", 1883, 16)
            .unwrap()
            .keep_alive(30)
            .clean_session(true)
            .credentials("user", "pass")
            .max_inflight(5)
            .build();

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_build_tls_client_with_client_auth() {
        let files = TestFiles::new().unwrap();

        let result = ClientBuilder::new("test_client", "localhost", 8883, 16)
            .unwrap()
            .with_tls(&files.ca_cert, &files.client_cert, &files.client_key)
            .build();

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_build_tls_missing_ca() {
        let result = ClientBuilder::new("test_client", "localhost", 8883, 16)
            .unwrap()
            .with_tls_ca_only("/nonexistent/ca.crt")
            .build();

        assert!(matches!(result, Err(TransferError::ClientSetup(_))));
    }

    #[tokio::test]
    async fn test_build_from_config() {
        let config = Config {
            base_topic: "greenhouse".into(),
            username: Some("user".into()),
            password: Some("pass".into()),
            ..Default::default()
        };

        let builder = ClientBuilder::from_config(&config).unwrap();
        assert_eq!(builder.cap, 64);
        assert!(builder.build().is_ok());
    }

    #[test]
    fn test_build_from_config_invalid() {
        let config = Config {
            host: String::new(),
            ..Default::default()
        };

        assert!(matches!(
            ClientBuilder::from_config(&config),
            Err(TransferError::ConfigError(_))
        ));
    }

    #[test]
    fn test_empty_client_id_gets_generated() {
        let builder = ClientBuilder::from_config(&Config::default()).unwrap();
        assert!(!builder.opts.client_id().is_empty());
    }
}
