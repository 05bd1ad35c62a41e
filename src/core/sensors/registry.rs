//! Keyed registry of open buses and chip handles.
//!
//! Sensors never own devices. They ask the registry for the handle matching
//! `(kind, bus, address)`, so two sensor entries pointing at the same
//! physical chip share one driver, and every chip on a bus shares one bus
//! handle. The registry lives inside the collector and is only touched from
//! the collector loop.

use std::{
    collections::{hash_map::Entry, HashMap},
    fmt,
    time::Duration,
};

use time::OffsetDateTime;
use tracing::{debug, info, warn};

use super::{
    bus::{shared, I2cBus, SharedBus},
    chips::{self, ChipDriver, ChipKind},
    error::{SensorError, SensorResult},
};

#[cfg(feature = "hardware")]
const POWER_OFF_TIME: Duration = Duration::from_millis(500);

/// Opens hardware on behalf of the registry. Tests substitute fakes.
pub trait DeviceFactory: Send {
    fn open_bus(&mut self, bus: u8) -> SensorResult<Box<dyn I2cBus>>;

    fn open_chip(
        &mut self,
        kind: ChipKind,
        bus: SharedBus,
        address: u16,
    ) -> SensorResult<Box<dyn ChipDriver>> {
        chips::open(kind, bus, address)
    }

    /// Switches a sensor's supply pin off and on again.
    fn power_cycle(&mut self, pin: u8) -> SensorResult<()>;
}

/// Real hardware through `rppal` when built with the `hardware` feature.
#[derive(Debug, Default)]
pub struct BuiltinFactory;

impl DeviceFactory for BuiltinFactory {
    #[cfg(feature = "hardware")]
    fn open_bus(&mut self, bus: u8) -> SensorResult<Box<dyn I2cBus>> {
        Ok(Box::new(super::bus::hal::RppalBus::open(bus)?))
    }

    #[cfg(not(feature = "hardware"))]
    fn open_bus(&mut self, bus: u8) -> SensorResult<Box<dyn I2cBus>> {
        Err(SensorError::Unsupported(format!(
            "I2C bus {} (built without the `hardware` feature)",
            bus
        )))
    }

    #[cfg(feature = "hardware")]
    fn power_cycle(&mut self, pin: u8) -> SensorResult<()> {
        super::bus::hal::power_cycle(pin, POWER_OFF_TIME)
    }

    #[cfg(not(feature = "hardware"))]
    fn power_cycle(&mut self, pin: u8) -> SensorResult<()> {
        Err(SensorError::Unsupported(format!(
            "GPIO pin {} (built without the `hardware` feature)",
            pin
        )))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceKey {
    pub kind: ChipKind,
    pub bus: u8,
    pub address: u16,
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:0x{:02x}", self.kind, self.bus, self.address)
    }
}

/// What a sensor needs from the registry to reach its chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipRequest {
    pub key: DeviceKey,
    /// Supply pin to power-cycle before the chip is opened.
    pub power_pin: Option<u8>,
    /// Re-open the chip once it has been open this long.
    pub reboot_interval: Option<Duration>,
}

struct ChipEntry {
    driver: Box<dyn ChipDriver>,
    opened_at: OffsetDateTime,
}

pub struct DeviceRegistry {
    factory: Box<dyn DeviceFactory>,
    buses: HashMap<u8, SharedBus>,
    chips: HashMap<DeviceKey, ChipEntry>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new(Box::new(BuiltinFactory))
    }
}

impl DeviceRegistry {
    pub fn new(factory: Box<dyn DeviceFactory>) -> Self {
        Self {
            factory,
            buses: HashMap::new(),
            chips: HashMap::new(),
        }
    }

    /// Shared handle for bus `bus`, opened on first use.
    pub fn bus(&mut self, bus: u8) -> SensorResult<SharedBus> {
        bus_handle(self.factory.as_mut(), &mut self.buses, bus)
    }

    /// Driver for the requested chip. Opens it on first use, and re-opens it
    /// when its reboot interval has elapsed. A failed open is not cached.
    pub fn chip(
        &mut self,
        request: &ChipRequest,
        now: OffsetDateTime,
    ) -> SensorResult<&mut Box<dyn ChipDriver>> {
        let key = request.key;

        let reboot_due = self.chips.get(&key).is_some_and(|entry| {
            request
                .reboot_interval
                .is_some_and(|interval| now - entry.opened_at >= interval)
        });
        if reboot_due {
            info!("Rebooting {}", key);
            self.chips.remove(&key);
        }

        match self.chips.entry(key) {
            Entry::Occupied(entry) => Ok(&mut entry.into_mut().driver),
            Entry::Vacant(slot) => {
                if let Some(pin) = request.power_pin {
                    info!("Powering on {} via GPIO {}", key, pin);
                    self.factory.power_cycle(pin)?;
                }
                let bus = bus_handle(self.factory.as_mut(), &mut self.buses, key.bus)?;
                let driver = self.factory.open_chip(key.kind, bus, key.address)?;
                debug!("Registered device {}", key);
                Ok(&mut slot
                    .insert(ChipEntry {
                        driver,
                        opened_at: now,
                    })
                    .driver)
            }
        }
    }

    /// Drops the handle so the next access re-opens the chip.
    pub fn evict(&mut self, key: &DeviceKey) -> bool {
        let removed = self.chips.remove(key).is_some();
        if removed {
            warn!("Evicted device {}", key);
        }
        removed
    }

    pub fn open_chips(&self) -> usize {
        self.chips.len()
    }

    pub fn open_buses(&self) -> usize {
        self.buses.len()
    }
}

fn bus_handle(
    factory: &mut dyn DeviceFactory,
    buses: &mut HashMap<u8, SharedBus>,
    bus: u8,
) -> SensorResult<SharedBus> {
    if let Some(handle) = buses.get(&bus) {
        return Ok(handle.clone());
    }
    let handle = shared(factory.open_bus(bus)?);
    buses.insert(bus, handle.clone());
    Ok(handle)
}


#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::{fake::FakeFactory, *};

    fn request(address: u16) -> ChipRequest {
        ChipRequest {
            key: DeviceKey {
                kind: ChipKind::Shtc3,
                bus: 1,
                address,
            },
            power_pin: None,
            reboot_interval: None,
        }
    }

    #[test]
    fn test_same_key_shares_one_handle() {
        let factory = FakeFactory::default();
        let counters = factory.counters.clone();
        let mut registry = DeviceRegistry::new(Box::new(factory));
        let now = datetime!(2024-01-01 0:00 UTC);

        registry.chip(&request(0x70), now).unwrap();
        registry.chip(&request(0x70), now).unwrap();
        registry.chip(&request(0x71), now).unwrap();

        let counters = counters.lock().unwrap();
        assert_eq!(counters.chips, 2);
        assert_eq!(counters.buses, 1);
        assert_eq!(registry.open_chips(), 2);
        assert_eq!(registry.open_buses(), 1);
    }

    #[test]
    fn test_reboot_interval_reopens_and_power_cycles() {
        let factory = FakeFactory::default();
        let counters = factory.counters.clone();
        let mut registry = DeviceRegistry::new(Box::new(factory));
        let start = datetime!(2024-01-01 0:00 UTC);
        let req = ChipRequest {
            power_pin: Some(17),
            reboot_interval: Some(Duration::from_secs(3600)),
            ..request(0x58)
        };

        registry.chip(&req, start).unwrap();
        registry
            .chip(&req, start + time::Duration::minutes(59))
            .unwrap();
        assert_eq!(counters.lock().unwrap().chips, 1);

        registry
            .chip(&req, start + time::Duration::minutes(60))
            .unwrap();
        let counters = counters.lock().unwrap();
        assert_eq!(counters.chips, 2);
        assert_eq!(counters.power_cycles, vec![17, 17]);
    }

    #[test]
    fn test_evict_forces_reopen() {
        let factory = FakeFactory::default();
        let counters = factory.counters.clone();
        let mut registry = DeviceRegistry::new(Box::new(factory));
        let now = datetime!(2024-01-01 0:00 UTC);
        let req = request(0x70);

        registry.chip(&req, now).unwrap();
        assert!(registry.evict(&req.key));
        assert!(!registry.evict(&req.key));
        registry.chip(&req, now).unwrap();

        assert_eq!(counters.lock().unwrap().chips, 2);
    }

    #[cfg(not(feature = "hardware"))]
    #[test]
    fn test_builtin_factory_without_hardware() {
        let mut registry = DeviceRegistry::default();
        assert!(matches!(
            registry.bus(1),
            Err(SensorError::Unsupported(_))
        ));
        assert_eq!(registry.open_buses(), 0);
    }
}
