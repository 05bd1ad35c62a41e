//! I2C bus and GPIO access.
//!
//! Everything above this module talks to [`I2cBus`]; the `hardware` feature
//! provides the Raspberry Pi implementation through `rppal`. Builds without
//! it still compile and run, but every bus fails to open.

use std::sync::{Arc, Mutex};

use super::error::SensorResult;

/// Blocking, addressed I2C transactions on one bus.
pub trait I2cBus: Send {
    fn write(&mut self, address: u16, bytes: &[u8]) -> SensorResult<()>;

    fn read(&mut self, address: u16, buf: &mut [u8]) -> SensorResult<()>;

    /// Write followed by a repeated-start read.
    fn write_read(&mut self, address: u16, bytes: &[u8], buf: &mut [u8]) -> SensorResult<()>;
}

/// One bus handle shared by every device on it.
pub type SharedBus = Arc<Mutex<Box<dyn I2cBus>>>;

pub fn shared(bus: Box<dyn I2cBus>) -> SharedBus {
    Arc::new(Mutex::new(bus))
}

/// Runs `op` with the bus locked. A poisoned lock still yields the bus; the
/// next transaction reports any real fault.
pub fn with_bus<T>(bus: &SharedBus, op: impl FnOnce(&mut dyn I2cBus) -> T) -> T {
    let mut guard = bus.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    op(guard.as_mut())
}

#[cfg(feature = "hardware")]
pub mod hal {
    use std::{thread, time::Duration};

    use rppal::{gpio::Gpio, i2c::I2c};
    use tracing::debug;

    use super::{I2cBus, SensorResult};
    use crate::core::sensors::error::SensorError;

    pub struct RppalBus {
        bus: u8,
        i2c: I2c,
    }

    impl RppalBus {
        pub fn open(bus: u8) -> SensorResult<Self> {
            let i2c = I2c::with_bus(bus).map_err(|e| SensorError::Io {
                bus,
                reason: e.to_string(),
            })?;
            debug!("Opened I2C bus {} at {} Hz", bus, i2c.clock_speed().unwrap_or(0));
            Ok(Self { bus, i2c })
        }

        fn io(&self, e: rppal::i2c::Error) -> SensorError {
            SensorError::Io {
                bus: self.bus,
                reason: e.to_string(),
            }
        }

        fn select(&mut self, address: u16) -> SensorResult<()> {
            self.i2c.set_slave_address(address).map_err(|e| self.io(e))
        }
    }

    impl I2cBus for RppalBus {
        fn write(&mut self, address: u16, bytes: &[u8]) -> SensorResult<()> {
            self.select(address)?;
            self.i2c.write(bytes).map(drop).map_err(|e| self.io(e))
        }

        fn read(&mut self, address: u16, buf: &mut [u8]) -> SensorResult<()> {
            self.select(address)?;
            self.i2c.read(buf).map(drop).map_err(|e| self.io(e))
        }

        fn write_read(&mut self, address: u16, bytes: &[u8], buf: &mut [u8]) -> SensorResult<()> {
            self.select(address)?;
            self.i2c.write_read(bytes, buf).map_err(|e| self.io(e))
        }
    }

    /// Drives `pin` low, waits, then high. The pin keeps its level after the
    /// handle is dropped.
    pub fn power_cycle(pin: u8, off_time: Duration) -> SensorResult<()> {
        let gpio = Gpio::new().map_err(|e| SensorError::Gpio(e.to_string()))?;
        let mut output = gpio
            .get(pin)
            .map_err(|e| SensorError::Gpio(e.to_string()))?
            .into_output();
        output.set_reset_on_drop(false);

        output.set_low();
        thread::sleep(off_time);
        output.set_high();
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory bus for tests.

    use std::collections::HashMap;

    use super::*;
    use crate::core::sensors::error::SensorError;

    /// Serves reads from per-address register images and records writes.
    #[derive(Default)]
    pub struct FakeBus {
        pub registers: HashMap<u16, Vec<u8>>,
        /// Queued replies for plain reads, per address.
        pub replies: HashMap<u16, Vec<Vec<u8>>>,
        pub writes: Arc<Mutex<Vec<(u16, Vec<u8>)>>>,
        pub fail: bool,
    }

    impl FakeBus {
        fn check(&self) -> SensorResult<()> {
            if self.fail {
                return Err(SensorError::Io {
                    bus: 1,
                    reason: "remote I/O error".into(),
                });
            }
            Ok(())
        }
    }

    impl I2cBus for FakeBus {
        fn write(&mut self, address: u16, bytes: &[u8]) -> SensorResult<()> {
            self.check()?;
            self.writes.lock().unwrap().push((address, bytes.to_vec()));
            Ok(())
        }

        fn read(&mut self, address: u16, buf: &mut [u8]) -> SensorResult<()> {
            self.check()?;
            let queue = self.replies.entry(address).or_default();
            if queue.is_empty() {
                return Err(SensorError::Io {
                    bus: 1,
                    reason: format!("no reply queued for 0x{:02x}", address),
                });
            }
            let reply = queue.remove(0);
            buf.copy_from_slice(&reply[..buf.len()]);
            Ok(())
        }

        fn write_read(&mut self, address: u16, bytes: &[u8], buf: &mut [u8]) -> SensorResult<()> {
            self.check()?;
            let start = bytes.first().copied().unwrap_or(0) as usize;
            let image = self.registers.get(&address).ok_or_else(|| SensorError::Io {
                bus: 1,
                reason: format!("no device at 0x{:02x}", address),
            })?;
            let end = start + buf.len();
            if end > image.len() {
                return Err(SensorError::Io {
                    bus: 1,
                    reason: "read past register image".into(),
                });
            }
            buf.copy_from_slice(&image[start..end]);
            Ok(())
        }
    }
}
