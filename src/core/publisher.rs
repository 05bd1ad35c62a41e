//! Broker delivery of aggregated series.
//!
//! The [`Publisher`] owns at most one broker client. Every access goes through
//! [`Publisher::get_client`], which connects when there is no client and pumps
//! the one it has. A failed connect or a failed pump throws the client away;
//! the next access starts a fresh connect. There is no retry timer of its own:
//! reconnect attempts happen at the publish cadence.
//!
//! ```text
//!  drain() ──> publish_batch ──get_client──> [no client] ──connect──> Connecting
//!                   │                              │                      │
//!                   │                          pump()  <──────────────────┘
//!                   │                              │
//!                   │        Connected <──CONNACK──┤──ConnectFailed──> discard
//!                   v
//!         publish(topic, mean) per series, then one flushing pump
//! ```

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use sensebee_mqtt::{ConnectionState, MqttSession, SessionEvent};
use tracing::{debug, info, trace, warn};

use super::{
    aggregate::aggregate,
    buffer::{Batch, LatestDataStore},
    scheduler::Ticker,
};
use crate::config::TransportConfig;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A live broker connection, driven by its owner.
#[async_trait]
pub trait BrokerClient: Send {
    /// Services the connection and reports connect outcomes. Must be called
    /// on every access.
    async fn pump(&mut self) -> Result<Vec<SessionEvent>, BoxError>;

    /// Queues one message; it leaves on the next pump.
    fn publish(&mut self, topic: &str, payload: String) -> Result<(), BoxError>;
}

#[async_trait]
impl BrokerClient for MqttSession {
    async fn pump(&mut self) -> Result<Vec<SessionEvent>, BoxError> {
        MqttSession::pump(self).await.map_err(|e| Box::new(e) as _)
    }

    fn publish(&mut self, topic: &str, payload: String) -> Result<(), BoxError> {
        MqttSession::publish(self, topic, payload).map_err(|e| Box::new(e) as _)
    }
}

/// Builds broker clients. Called again after every discarded client.
pub trait Connector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn BrokerClient>, BoxError>;
}

pub struct MqttConnector {
    config: TransportConfig,
}

impl MqttConnector {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

impl Connector for MqttConnector {
    fn connect(&self) -> Result<Box<dyn BrokerClient>, BoxError> {
        Ok(Box::new(MqttSession::connect(&self.config)?))
    }
}

/// Outcome of one [`Publisher::publish_batch`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    pub published: usize,
    /// Rejected by the client when queued.
    pub failed: usize,
    /// Discarded because no connected client was available.
    pub dropped: usize,
}

pub struct Publisher {
    connector: Arc<dyn Connector>,
    client: Option<Box<dyn BrokerClient>>,
    state: ConnectionState,
}

impl Publisher {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            client: None,
            state: ConnectionState::Disconnected,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Returns the client when it is connected.
    ///
    /// Without a client a new connect is issued first. The client is pumped
    /// either way; while the broker has not answered yet this returns `None`
    /// and keeps the client for the next call.
    pub async fn get_client(&mut self) -> Option<&mut (dyn BrokerClient + 'static)> {
        if self.client.is_none() {
            match self.connector.connect() {
                Ok(client) => {
                    debug!("Created broker client, waiting for the broker");
                    self.client = Some(client);
                    self.state = ConnectionState::Connecting;
                }
                Err(e) => {
                    warn!("Failed to create broker client: {}", e);
                    self.state = ConnectionState::Disconnected;
                    return None;
                }
            }
        }

        self.pump().await;

        if self.state.is_connected() {
            self.client.as_deref_mut()
        } else {
            None
        }
    }

    /// Publishes the mean of every series to its topic.
    ///
    /// Entries are independent: one failing does not stop the others, and
    /// nothing is retried on a later tick. Without a connected client the
    /// whole batch is dropped.
    ///
    /// The client's request queue is bounded, so an entry it refuses gets one
    /// flushing pump and a second try before it counts as failed. Batches
    /// larger than the queue still go out whole.
    pub async fn publish_batch(&mut self, batch: Batch) -> PublishReport {
        let mut report = PublishReport::default();

        if self.get_client().await.is_none() {
            report.dropped = batch.len();
            if !batch.is_empty() {
                warn!(
                    state = %self.state,
                    "Broker not connected, dropping {} series",
                    batch.len()
                );
            }
            return report;
        }

        let mut entries: Vec<_> = batch.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        for (key, series) in entries {
            let payload = aggregate(&series.values, series.precision).to_string();
            let mut result = self.queue(&series.topic, &payload);
            if result.is_err() && self.state.is_connected() {
                trace!(key = %key, "Publish refused, flushing the queue before retrying");
                self.pump().await;
                result = self.queue(&series.topic, &payload);
            }
            match result {
                Ok(()) => {
                    debug!(key = %key, topic = %series.topic, "Published {}", payload);
                    report.published += 1;
                }
                Err(e) => {
                    warn!(key = %key, topic = %series.topic, "Publish failed: {}", e);
                    report.failed += 1;
                }
            }
        }

        if report.published > 0 {
            self.pump().await;
        }
        report
    }

    /// Drains `store` and publishes it every `period`, forever.
    pub async fn run(mut self, store: Arc<LatestDataStore>, period: Duration) -> ! {
        info!("Publisher started (interval: {:?})", period);
        loop {
            let tick = Ticker::start(period);

            let report = self.publish_batch(store.drain()).await;
            if report != PublishReport::default() {
                info!(
                    "Published {} series ({} failed, {} dropped)",
                    report.published, report.failed, report.dropped
                );
            }

            tick.wait().await;
        }
    }

    async fn pump(&mut self) {
        let Some(client) = self.client.as_mut() else {
            return;
        };

        match client.pump().await {
            Ok(events) => {
                for event in events {
                    self.apply(event);
                }
            }
            Err(e) => {
                warn!("Broker connection lost: {}", e);
                self.discard();
            }
        }
    }

    fn queue(&mut self, topic: &str, payload: &str) -> Result<(), BoxError> {
        match self.client.as_mut() {
            Some(client) => client.publish(topic, payload.to_string()),
            None => Err("broker client was discarded".into()),
        }
    }

    fn apply(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Connected => {
                info!("Connected to broker");
                self.state = ConnectionState::Connected;
            }
            SessionEvent::ConnectFailed(reason) => {
                warn!("Connection to broker failed: {}", reason);
                self.discard();
            }
            SessionEvent::Disconnected(reason) => {
                warn!("Disconnected from broker: {}", reason);
                self.discard();
            }
        }
    }

    fn discard(&mut self) {
        self.client = None;
        self.state = ConnectionState::Disconnected;
    }
}
