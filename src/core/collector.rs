//! Fixed-cadence sampling loop.

use std::{future, panic, sync::Arc, time::Duration};

use time::OffsetDateTime;
use tokio::task;
use tracing::{debug, info, trace, warn};

use super::{
    buffer::LatestDataStore,
    scheduler::{Clock, Ticker},
    sensors::{registry::DeviceRegistry, Sensor},
};

/// Owns the sensors and the device registry. Only the collector touches
/// hardware.
pub struct Collector {
    sensors: Vec<Sensor>,
    registry: DeviceRegistry,
    store: Arc<LatestDataStore>,
    clock: Arc<dyn Clock>,
}

impl Collector {
    pub fn new(
        sensors: Vec<Sensor>,
        registry: DeviceRegistry,
        store: Arc<LatestDataStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            sensors,
            registry,
            store,
            clock,
        }
    }

    pub fn sensors(&self) -> &[Sensor] {
        &self.sensors
    }

    /// Reads every due sensor once and merges the results into the store.
    /// Returns how many sensors were read.
    ///
    /// `last_read` moves on every attempt, so a failing sensor is retried at
    /// its own interval and not on every tick.
    pub fn tick(&mut self) -> usize {
        let now = self.clock.now();
        self.tick_at(now)
    }

    pub fn tick_at(&mut self, now: OffsetDateTime) -> usize {
        let mut readings = Vec::new();
        let mut attempted = 0;

        for sensor in self.sensors.iter_mut() {
            if !sensor.should_read_now(now) {
                continue;
            }
            trace!(sensor = sensor.label(), "Reading");
            readings.extend(sensor.read(&mut self.registry, now));
            sensor.mark_read(now);
            attempted += 1;
        }

        if !readings.is_empty() {
            let samples = self.store.merge(readings);
            debug!("Collected {} samples from {} sensors", samples, attempted);
        }
        attempted
    }

    /// Ticks every `period`, forever.
    ///
    /// Sensor reads block on the bus (up to seconds for a chip that is slow
    /// to become ready), so each tick runs on the blocking pool and the
    /// calling task stays free to observe shutdown.
    pub async fn run(mut self, period: Duration) -> ! {
        info!(
            "Collector started ({} sensors, tick {:?})",
            self.sensors.len(),
            period
        );
        loop {
            let tick = Ticker::start(period);
            self = match task::spawn_blocking(move || {
                self.tick();
                self
            })
            .await
            {
                Ok(collector) => collector,
                Err(e) if e.is_panic() => panic::resume_unwind(e.into_panic()),
                Err(_) => {
                    // Blocking tasks are only cancelled by runtime shutdown
                    warn!("Collector tick cancelled, stopping");
                    loop {
                        future::pending::<()>().await;
                    }
                }
            };
            tick.wait().await;
        }
    }
}
