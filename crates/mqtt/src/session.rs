//! Pumped MQTT session.
//!
//! A [`MqttSession`] owns a rumqttc client handle together with its event
//! loop. Nothing runs in the background: the owner calls [`MqttSession::pump`]
//! on every access, which drives the event loop for a short window. That
//! window is where the connect handshake happens, where keep-alive pings go
//! out, where queued publishes are flushed and where the connect outcome is
//! reported back as a [`SessionEvent`].
//!
//! ```text
//! owner ──pump()──> MqttSession ──poll()──> rumqttc EventLoop ──> broker
//!   ^                    │
//!   └── SessionEvent ────┘  (Connected / ConnectFailed / Disconnected)
//! ```
//!
//! A session is single-use. Once it reports `ConnectFailed` or `pump` returns
//! an error, the owner drops it and builds a fresh one.

use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Packet, QoS,
};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, trace, warn};

use super::{client::ClientBuilder, config::Config, error::TransferError, state::ConnectionState};

/// Connection outcome observed while pumping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The broker accepted the connection.
    Connected,
    /// The connect attempt failed; the reason is the innermost error message.
    ConnectFailed(String),
    /// An established connection was closed by the broker.
    Disconnected(String),
}

pub struct MqttSession {
    client: AsyncClient,
    event_loop: EventLoop,
    base_topic: String,
    qos: QoS,
    retain: bool,
    pump_window: Duration,
    state: ConnectionState,
}

impl MqttSession {
    /// Builds a session in the `Connecting` state. The broker is contacted
    /// on the first [`pump`](Self::pump).
    pub fn connect(config: &Config) -> Result<Self, TransferError> {
        let (client, event_loop) = ClientBuilder::from_config(config)?.build()?;
        info!(
            "Connecting to MQTT broker {}:{} (base topic: '{}')",
            config.host, config.port, config.base_topic
        );

        Ok(Self {
            client,
            event_loop,
            base_topic: config.base_topic.clone(),
            qos: config.qos(),
            retain: config.retain,
            pump_window: Duration::from_millis(config.pump_window_ms),
            state: ConnectionState::Connecting,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Drives the event loop until the pump window elapses.
    ///
    /// While connecting, the poll is awaited without the window: rumqttc
    /// builds the connection and waits for CONNACK inside that one future,
    /// and `connection_timeout` already bounds it. A failing poll there is
    /// the connect outcome and is returned as [`SessionEvent::ConnectFailed`].
    /// Once connected, the window restarts for flushing and keep-alives, and
    /// a failing poll is a pump failure returned as an error.
    pub async fn pump(&mut self) -> Result<Vec<SessionEvent>, TransferError> {
        let mut deadline = Instant::now() + self.pump_window;
        let mut events = Vec::new();

        loop {
            let polled = if self.state.is_connected() {
                match timeout_at(deadline, self.event_loop.poll()).await {
                    Ok(polled) => polled,
                    Err(_) => break,
                }
            } else {
                let polled = self.event_loop.poll().await;
                deadline = Instant::now() + self.pump_window;
                polled
            };

            match polled {
                Ok(event) => {
                    if let Some(session_event) = self.handle_event(event) {
                        let stop = !matches!(session_event, SessionEvent::Connected);
                        events.push(session_event);
                        if stop {
                            break;
                        }
                    }
                }
                Err(e) if !self.state.is_connected() => {
                    let reason = get_error_message(&e);
                    if is_fatal_error(&e) {
                        error!("Broker rejected the connection, check configuration: {}", reason);
                    } else {
                        debug!("Connect attempt failed: {:?}", e);
                    }
                    self.state = ConnectionState::Disconnected;
                    events.push(SessionEvent::ConnectFailed(reason));
                    break;
                }
                Err(e) => {
                    self.state = ConnectionState::Disconnected;
                    return Err(TransferError::from(e));
                }
            }
        }

        Ok(events)
    }

    /// Queues `payload` for `topic` (prefixed with the base topic). The
    /// message leaves the process on the next pump.
    pub fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) -> Result<(), TransferError> {
        if topic.is_empty() || topic.contains(&['+', '#'][..]) {
            return Err(TransferError::InvalidTopic(format!(
                "'{}' is not a valid publish topic",
                topic
            )));
        }

        let full_topic = self.with_base_topic(topic);
        trace!("Queueing publish to {}", full_topic);
        self.client
            .try_publish(full_topic, self.qos, self.retain, payload.into())?;
        Ok(())
    }

    fn with_base_topic(&self, topic: &str) -> String {
        if self.base_topic.is_empty() {
            topic.to_string()
        } else {
            format!(
                "{}/{}",
                self.base_topic.trim_end_matches('/'),
                topic.trim_start_matches('/')
            )
        }
    }

    fn handle_event(&mut self, event: Event) -> Option<SessionEvent> {
        match event {
            Event::Incoming(Packet::ConnAck(conn_ack)) => {
                if conn_ack.code == ConnectReturnCode::Success {
                    self.state = ConnectionState::Connected;
                    self.announce_online();
                    Some(SessionEvent::Connected)
                } else {
                    self.state = ConnectionState::Disconnected;
                    Some(SessionEvent::ConnectFailed(format!("{:?}", conn_ack.code)))
                }
            }
            Event::Incoming(Packet::Disconnect) => {
                warn!("Disconnected by broker");
                self.state = ConnectionState::Disconnected;
                Some(SessionEvent::Disconnected("Disconnected by broker".into()))
            }
            Event::Incoming(packet) => {
                trace!("Incoming packet: {:?}", packet);
                None
            }
            Event::Outgoing(outgoing) => {
                trace!("Outgoing packet: {:?}", outgoing);
                None
            }
        }
    }

    fn announce_online(&self) {
        if self.base_topic.is_empty() {
            return;
        }
        let topic = format!("{}/status", self.base_topic.trim_end_matches('/'));
        if let Err(e) = self
            .client
            .try_publish(topic, QoS::AtLeastOnce, true, "online".as_bytes().to_vec())
        {
            warn!("Failed to publish online status: {}", e);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    // Retrying with the same settings cannot succeed
    Fatal,
    Transient,
}

fn classify_connection_error(err: &ConnectionError) -> Disposition {
    use Disposition::*;

    match err {
        ConnectionError::Tls(_) => Fatal,
        ConnectionError::MqttState(_) => Fatal,
        ConnectionError::NotConnAck(_) => Fatal,
        ConnectionError::RequestsDone => Fatal,

        ConnectionError::Io(e) => match e.kind() {
            std::io::ErrorKind::AddrInUse
            | std::io::ErrorKind::PermissionDenied
            | std::io::ErrorKind::InvalidInput
            | std::io::ErrorKind::InvalidData => Fatal,
            _ => Transient,
        },

        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => Transient,

        ConnectionError::ConnectionRefused(code) => match code {
            ConnectReturnCode::RefusedProtocolVersion
            | ConnectReturnCode::BadClientId
            | ConnectReturnCode::BadUserNamePassword
            | ConnectReturnCode::NotAuthorized => Fatal,
            _ => Transient,
        },

        #[allow(unreachable_patterns)]
        _ => Transient,
    }
}

/// True when reconnecting with unchanged settings is pointless. The agent
/// still retries on its next tick; this only selects how loudly to log.
pub fn is_fatal_error(err: &ConnectionError) -> bool {
    matches!(classify_connection_error(err), Disposition::Fatal)
}

/// Walks the source chain and returns the root cause message.
fn get_error_message(e: &dyn std::error::Error) -> String {
    let mut current = e;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string().trim_matches('"').to_string()
}

#[cfg(test)]
mod tests {
    use std::io;

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        task::JoinHandle,
        time::{sleep, timeout},
    };

    use super::*;

    /// Accepts one client, answers its CONNECT after `connack_delay` and
    /// returns the bytes received afterwards, up to the first one carrying
    /// `expected`.
    async fn local_broker(
        connack_delay: Duration,
        expected: &'static [u8],
    ) -> (u16, JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            socket.read(&mut buf).await.unwrap();
            sleep(connack_delay).await;
            socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();

            let mut received = Vec::new();
            loop {
                let n = socket.read(&mut buf).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
                if received.windows(expected.len()).any(|w| w == expected) {
                    break;
                }
            }
            received
        });

        (port, handle)
    }

    async fn assert_connects_and_flushes(connack_delay: Duration) {
        let (port, broker) = local_broker(connack_delay, b"sensors/air/temp21.5").await;
        let config = Config {
            host: "127.0.0.1".into(),
            port,
            connection_timeout: 5,
            pump_window_ms: 100,
            ..Default::default()
        };
        let mut session = MqttSession::connect(&config).unwrap();

        let events = session.pump().await.unwrap();
        assert_eq!(events, vec![SessionEvent::Connected]);
        assert!(session.is_connected());

        session.publish("sensors/air/temp", "21.5").unwrap();
        assert!(session.pump().await.unwrap().is_empty());

        let received = timeout(Duration::from_secs(5), broker)
            .await
            .unwrap()
            .unwrap();
        // QoS 0 PUBLISH: topic immediately followed by the payload
        assert!(
            received
                .windows(b"sensors/air/temp21.5".len())
                .any(|w| w == b"sensors/air/temp21.5"),
            "publish not seen on the wire: {:?}",
            received
        );
    }

    fn unreachable_broker() -> Config {
        Config {
            host: "127.0.0.1".into(),
            // Reserved port; nothing listens there.
            port: 1,
            connection_timeout: 1,
            pump_window_ms: 2_000,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_new_session_is_connecting() {
        let session = MqttSession::connect(&Config::default()).unwrap();
        assert_eq!(session.state(), ConnectionState::Connecting);
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_connect_with_invalid_config_fails() {
        let config = Config {
            host: String::new(),
            ..Default::default()
        };
        assert!(MqttSession::connect(&config).is_err());
    }

    #[tokio::test]
    async fn test_pump_reports_connect_failure() {
        let mut session = MqttSession::connect(&unreachable_broker()).unwrap();

        let events = session.pump().await.unwrap();

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], SessionEvent::ConnectFailed(_)));
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_pump_connects_to_prompt_broker() {
        assert_connects_and_flushes(Duration::ZERO).await;
    }

    #[tokio::test]
    async fn test_pump_waits_for_connack_slower_than_window() {
        assert_connects_and_flushes(Duration::from_millis(400)).await;
    }

    #[tokio::test]
    async fn test_base_topic_is_applied() {
        let config = Config {
            base_topic: "greenhouse/".into(),
            ..Default::default()
        };
        let session = MqttSession::connect(&config).unwrap();
        assert_eq!(
            session.with_base_topic("/sensors/air/temp"),
            "greenhouse/sensors/air/temp"
        );

        let session = MqttSession::connect(&Config::default()).unwrap();
        assert_eq!(session.with_base_topic("sensors/air/temp"), "sensors/air/temp");
    }

    #[tokio::test]
    async fn test_publish_rejects_wildcards() {
        let session = MqttSession::connect(&Config::default()).unwrap();
        assert!(matches!(
            session.publish("sensors/+/temp", "1"),
            Err(TransferError::InvalidTopic(_))
        ));
        assert!(matches!(
            session.publish("", "1"),
            Err(TransferError::InvalidTopic(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_is_queued_before_connect() {
        let session = MqttSession::connect(&Config::default()).unwrap();
        assert!(session.publish("sensors/air/temp", "21.5").is_ok());
    }

    #[test]
    fn test_is_fatal_error_detection() {
        let transient = ConnectionError::Io(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        assert!(!is_fatal_error(&transient));

        let fatal = ConnectionError::Io(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "permission denied",
        ));
        assert!(is_fatal_error(&fatal));

        assert!(is_fatal_error(&ConnectionError::ConnectionRefused(
            ConnectReturnCode::BadUserNamePassword
        )));
        assert!(!is_fatal_error(&ConnectionError::NetworkTimeout));
    }

    #[test]
    fn test_get_error_message_strips_quotes() {
        let err = io::Error::new(io::ErrorKind::Other, "\"boom\"");
        assert_eq!(get_error_message(&err), "boom");
    }
}
