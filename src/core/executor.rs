//! Wiring of the collector and publisher loops.
//!
//! The `Executor` owns both halves of the agent and the buffer between them.
//! [`Executor::run`] spawns the publisher as its own task at the publish
//! interval and drives the collector from the calling task at the collect
//! period, with each blocking tick handed to the blocking pool. The two loops
//! share nothing but the [`LatestDataStore`].

use std::{sync::Arc, time::Duration};

use tracing::info;

use super::{
    buffer::LatestDataStore,
    collector::Collector,
    publisher::{Connector, MqttConnector, Publisher},
    scheduler::{Clock, SystemClock},
    sensors::{build_sensors, registry::DeviceRegistry, Sensor},
};
use crate::config::{Config, ConfigError};

pub struct Executor {
    collector: Collector,
    publisher: Publisher,
    store: Arc<LatestDataStore>,
    collect_period: Duration,
    publish_period: Duration,
}

impl Executor {
    pub fn new(
        sensors: Vec<Sensor>,
        registry: DeviceRegistry,
        connector: Arc<dyn Connector>,
        clock: Arc<dyn Clock>,
        collect_period: Duration,
        publish_period: Duration,
    ) -> Self {
        let store = Arc::new(LatestDataStore::new());
        Self {
            collector: Collector::new(sensors, registry, store.clone(), clock),
            publisher: Publisher::new(connector),
            store,
            collect_period,
            publish_period,
        }
    }

    /// Builds the production executor: sensors from the `[[Sensors]]`
    /// entries, real devices, the MQTT transport and the system clock.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let sensors = build_sensors(&config.tree)?;
        Ok(Self::new(
            sensors,
            DeviceRegistry::default(),
            Arc::new(MqttConnector::new(config.transport.clone())),
            Arc::new(SystemClock),
            config.collect_period(),
            config.publish_interval()?,
        ))
    }

    pub fn store(&self) -> Arc<LatestDataStore> {
        self.store.clone()
    }

    pub fn sensors(&self) -> &[Sensor] {
        self.collector.sensors()
    }

    /// Runs both loops until the process exits.
    pub async fn run(self) -> ! {
        let Self {
            collector,
            publisher,
            store,
            collect_period,
            publish_period,
        } = self;

        info!(
            "Starting agent (collect every {:?}, publish every {:?})",
            collect_period, publish_period
        );
        tokio::spawn(publisher.run(store, publish_period));
        collector.run(collect_period).await
    }
}
