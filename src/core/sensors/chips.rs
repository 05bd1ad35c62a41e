//! Drivers for the supported I2C climate and air-quality chips.
//!
//! Each driver exposes the chip's measurements as an ordered list of named
//! channels. Readouts pick a channel by name or position through their
//! `Index` key. The Sensirion parts (SHTC3, SGP30, SCD30) and the HTU31D share
//! the 16-bit word plus CRC-8 framing decoded by [`words`].

use std::{fmt, str::FromStr, thread, time::Duration};

use tracing::{debug, info};

use super::{
    bus::{with_bus, SharedBus},
    error::{SensorError, SensorResult},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChipKind {
    Sgp30,
    Shtc3,
    Ahtx0,
    Htu31d,
    Gme680,
    Scd30,
}

const CLIMATE: &[&str] = &["temperature", "relative_humidity"];

impl ChipKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChipKind::Sgp30 => "sgp30",
            ChipKind::Shtc3 => "shtc3",
            ChipKind::Ahtx0 => "ahtx0",
            ChipKind::Htu31d => "htu31d",
            ChipKind::Gme680 => "gme680",
            ChipKind::Scd30 => "scd30",
        }
    }

    /// Address used when the sensor sets no `I2C.Address`.
    pub fn default_address(&self) -> u16 {
        match self {
            ChipKind::Sgp30 => 0x58,
            ChipKind::Shtc3 => 0x70,
            ChipKind::Ahtx0 => 0x38,
            ChipKind::Htu31d => 0x40,
            ChipKind::Gme680 => 0x77,
            ChipKind::Scd30 => 0x61,
        }
    }

    /// Measurement channels in the order `measure` returns them.
    pub fn channels(&self) -> &'static [&'static str] {
        match self {
            ChipKind::Sgp30 => &["co2", "tvoc"],
            ChipKind::Scd30 => &["co2", "temperature", "humidity"],
            ChipKind::Gme680 => &["temperature", "relative_humidity", "pressure", "gas"],
            ChipKind::Shtc3 | ChipKind::Ahtx0 | ChipKind::Htu31d => CLIMATE,
        }
    }
}

impl fmt::Display for ChipKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChipKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sgp30" => Ok(ChipKind::Sgp30),
            "shtc3" => Ok(ChipKind::Shtc3),
            "ahtx0" => Ok(ChipKind::Ahtx0),
            "htu31d" => Ok(ChipKind::Htu31d),
            "gme680" => Ok(ChipKind::Gme680),
            "scd30" => Ok(ChipKind::Scd30),
            other => Err(other.to_string()),
        }
    }
}

/// An opened chip.
pub trait ChipDriver: Send {
    fn kind(&self) -> ChipKind;

    /// One value per entry of `kind().channels()`.
    fn measure(&mut self) -> SensorResult<Vec<f64>>;
}

/// Opens and initializes the builtin driver for `kind`.
pub fn open(kind: ChipKind, bus: SharedBus, address: u16) -> SensorResult<Box<dyn ChipDriver>> {
    info!("Starting {} sensor at 0x{:02x}", kind, address);
    let device = Device { bus, address, kind };

    let driver: Box<dyn ChipDriver> = match kind {
        ChipKind::Shtc3 => Box::new(Shtc3::open(device)?),
        ChipKind::Ahtx0 => Box::new(Ahtx0::open(device)?),
        ChipKind::Htu31d => Box::new(Htu31d::open(device)?),
        ChipKind::Sgp30 => Box::new(Sgp30::open(device)?),
        ChipKind::Scd30 => Box::new(Scd30::open(device, SCD30_READY_TIMEOUT)?),
        ChipKind::Gme680 => return Err(SensorError::Unsupported(kind.to_string())),
    };
    Ok(driver)
}

/// CRC-8, polynomial 0x31, init 0xFF.
pub(crate) fn crc8(data: &[u8]) -> u8 {
    data.iter().fold(0xFF, |mut crc, byte| {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x31
            } else {
                crc << 1
            };
        }
        crc
    })
}

/// Splits `[hi, lo, crc]*` triples into words, verifying each CRC.
pub(crate) fn words(device: ChipKind, buf: &[u8]) -> SensorResult<Vec<u16>> {
    buf.chunks_exact(3)
        .map(|chunk| {
            if crc8(&chunk[..2]) != chunk[2] {
                return Err(SensorError::InvalidData {
                    device: device.to_string(),
                    reason: "CRC mismatch".into(),
                });
            }
            Ok(u16::from_be_bytes([chunk[0], chunk[1]]))
        })
        .collect()
}

/// A 16-bit command word followed by one argument word and its CRC.
fn command_with_arg(command: u16, arg: u16) -> [u8; 5] {
    let [c0, c1] = command.to_be_bytes();
    let [a0, a1] = arg.to_be_bytes();
    [c0, c1, a0, a1, crc8(&[a0, a1])]
}

struct Device {
    bus: SharedBus,
    address: u16,
    kind: ChipKind,
}

impl Device {
    fn write(&self, bytes: &[u8]) -> SensorResult<()> {
        with_bus(&self.bus, |bus| bus.write(self.address, bytes))
    }

    fn read(&self, len: usize) -> SensorResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        with_bus(&self.bus, |bus| bus.read(self.address, &mut buf))?;
        Ok(buf)
    }

    fn command(&self, bytes: &[u8], wait: Duration, len: usize) -> SensorResult<Vec<u8>> {
        self.write(bytes)?;
        thread::sleep(wait);
        self.read(len)
    }

    fn read_words(&self, bytes: &[u8], wait: Duration, count: usize) -> SensorResult<Vec<u16>> {
        words(self.kind, &self.command(bytes, wait, count * 3)?)
    }
}

fn ratio(raw: u16, full_scale: f64) -> f64 {
    raw as f64 / full_scale
}

struct Shtc3 {
    device: Device,
}

impl Shtc3 {
    fn open(device: Device) -> SensorResult<Self> {
        device.write(&[0x35, 0x17])?;
        thread::sleep(Duration::from_millis(1));
        Ok(Self { device })
    }
}

impl ChipDriver for Shtc3 {
    fn kind(&self) -> ChipKind {
        ChipKind::Shtc3
    }

    fn measure(&mut self) -> SensorResult<Vec<f64>> {
        self.device.write(&[0x35, 0x17])?;
        thread::sleep(Duration::from_millis(1));
        // Normal mode, temperature first, no clock stretching.
        let raw = self
            .device
            .read_words(&[0x78, 0x66], Duration::from_millis(13), 2)?;
        self.device.write(&[0xB0, 0x98])?;

        Ok(vec![
            -45.0 + 175.0 * ratio(raw[0], 65536.0),
            100.0 * ratio(raw[1], 65536.0),
        ])
    }
}

struct Ahtx0 {
    device: Device,
}

impl Ahtx0 {
    fn open(device: Device) -> SensorResult<Self> {
        device.write(&[0xBE, 0x08, 0x00])?;
        thread::sleep(Duration::from_millis(10));
        Ok(Self { device })
    }
}

impl ChipDriver for Ahtx0 {
    fn kind(&self) -> ChipKind {
        ChipKind::Ahtx0
    }

    fn measure(&mut self) -> SensorResult<Vec<f64>> {
        let b = self
            .device
            .command(&[0xAC, 0x33, 0x00], Duration::from_millis(80), 6)?;
        if b[0] & 0x80 != 0 {
            return Err(SensorError::NotReady(self.kind().to_string()));
        }

        let humidity = ((b[1] as u32) << 12) | ((b[2] as u32) << 4) | ((b[3] as u32) >> 4);
        let temperature = (((b[3] & 0x0F) as u32) << 16) | ((b[4] as u32) << 8) | b[5] as u32;
        let full_scale = (1u32 << 20) as f64;

        Ok(vec![
            temperature as f64 * 200.0 / full_scale - 50.0,
            humidity as f64 * 100.0 / full_scale,
        ])
    }
}

struct Htu31d {
    device: Device,
}

impl Htu31d {
    fn open(device: Device) -> SensorResult<Self> {
        device.write(&[0x1E])?;
        thread::sleep(Duration::from_millis(15));
        Ok(Self { device })
    }
}

impl ChipDriver for Htu31d {
    fn kind(&self) -> ChipKind {
        ChipKind::Htu31d
    }

    fn measure(&mut self) -> SensorResult<Vec<f64>> {
        self.device.write(&[0x5E])?;
        thread::sleep(Duration::from_millis(20));

        let mut buf = [0u8; 6];
        with_bus(&self.device.bus, |bus| {
            bus.write_read(self.device.address, &[0x00], &mut buf)
        })?;
        let raw = words(self.kind(), &buf)?;

        Ok(vec![
            -40.0 + 165.0 * ratio(raw[0], 65535.0),
            100.0 * ratio(raw[1], 65535.0),
        ])
    }
}

struct Sgp30 {
    device: Device,
}

impl Sgp30 {
    fn open(device: Device) -> SensorResult<Self> {
        info!("Warming up SGP30 sensor");
        device.write(&[0x20, 0x03])?;
        thread::sleep(Duration::from_millis(10));
        Ok(Self { device })
    }
}

impl ChipDriver for Sgp30 {
    fn kind(&self) -> ChipKind {
        ChipKind::Sgp30
    }

    fn measure(&mut self) -> SensorResult<Vec<f64>> {
        let raw = self
            .device
            .read_words(&[0x20, 0x08], Duration::from_millis(12), 2)?;
        Ok(raw.into_iter().map(f64::from).collect())
    }
}

const SCD30_READY_TIMEOUT: Duration = Duration::from_secs(5);
const SCD30_READY_POLL: Duration = Duration::from_millis(200);

struct Scd30 {
    device: Device,
    ready_timeout: Duration,
}

impl Scd30 {
    fn open(device: Device, ready_timeout: Duration) -> SensorResult<Self> {
        // 2 s measurement interval, then continuous measurement without
        // pressure compensation.
        device.write(&command_with_arg(0x4600, 2))?;
        device.write(&command_with_arg(0x0010, 0))?;
        Ok(Self {
            device,
            ready_timeout,
        })
    }

    fn data_ready(&self) -> SensorResult<bool> {
        let ready = self
            .device
            .read_words(&[0x02, 0x02], Duration::from_millis(3), 1)?;
        Ok(ready[0] == 1)
    }

    fn wait_ready(&self) -> SensorResult<bool> {
        let mut waited = Duration::ZERO;
        loop {
            if self.data_ready()? {
                return Ok(true);
            }
            if waited >= self.ready_timeout {
                return Ok(false);
            }
            thread::sleep(SCD30_READY_POLL);
            waited += SCD30_READY_POLL;
        }
    }
}

impl ChipDriver for Scd30 {
    fn kind(&self) -> ChipKind {
        ChipKind::Scd30
    }

    fn measure(&mut self) -> SensorResult<Vec<f64>> {
        if !self.wait_ready()? {
            debug!("SCD30 data not ready after {:?}", self.ready_timeout);
            return Err(SensorError::NotReady(self.kind().to_string()));
        }

        let raw = self
            .device
            .read_words(&[0x03, 0x00], Duration::from_millis(3), 6)?;
        Ok(raw
            .chunks_exact(2)
            .map(|pair| {
                let bits = ((pair[0] as u32) << 16) | pair[1] as u32;
                f32::from_bits(bits) as f64
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::sensors::bus::{fake::FakeBus, shared};

    fn framed(words: &[u16]) -> Vec<u8> {
        words
            .iter()
            .flat_map(|w| {
                let [hi, lo] = w.to_be_bytes();
                [hi, lo, crc8(&[hi, lo])]
            })
            .collect()
    }

    fn device(kind: ChipKind, bus: FakeBus) -> Device {
        Device {
            bus: shared(Box::new(bus)),
            address: kind.default_address(),
            kind,
        }
    }

    #[test]
    fn test_crc8_reference_vector() {
        // Datasheet example: 0xBEEF -> 0x92.
        assert_eq!(crc8(&[0xBE, 0xEF]), 0x92);
    }

    #[test]
    fn test_words_rejects_bad_crc() {
        let mut buf = framed(&[0x1234]);
        buf[2] ^= 0xFF;
        assert!(matches!(
            words(ChipKind::Sgp30, &buf),
            Err(SensorError::InvalidData { .. })
        ));
    }

    #[test]
    fn test_kind_parsing_is_case_insensitive() {
        assert_eq!("SHTC3".parse::<ChipKind>(), Ok(ChipKind::Shtc3));
        assert_eq!("Scd30".parse::<ChipKind>(), Ok(ChipKind::Scd30));
        assert!("bme280".parse::<ChipKind>().is_err());
    }

    #[test]
    fn test_shtc3_conversion() {
        let mut bus = FakeBus::default();
        bus.replies
            .insert(0x70, vec![framed(&[0x6666, 0x8000])]);
        let mut chip = Shtc3::open(device(ChipKind::Shtc3, bus)).unwrap();

        let values = chip.measure().unwrap();
        assert!((values[0] - 25.0).abs() < 0.01);
        assert!((values[1] - 50.0).abs() < 0.01);
    }

    #[test]
    fn test_sgp30_reports_raw_counts() {
        let mut bus = FakeBus::default();
        bus.replies.insert(0x58, vec![framed(&[415, 12])]);
        let mut chip = Sgp30::open(device(ChipKind::Sgp30, bus)).unwrap();

        assert_eq!(chip.measure().unwrap(), vec![415.0, 12.0]);
    }

    #[test]
    fn test_ahtx0_busy_is_not_ready() {
        let mut bus = FakeBus::default();
        bus.replies.insert(0x38, vec![vec![0x80, 0, 0, 0, 0, 0]]);
        let mut chip = Ahtx0::open(device(ChipKind::Ahtx0, bus)).unwrap();

        assert!(matches!(chip.measure(), Err(SensorError::NotReady(_))));
    }

    #[test]
    fn test_scd30_reads_floats_when_ready() {
        let co2 = 612.5f32.to_bits();
        let temp = 21.25f32.to_bits();
        let hum = 40.0f32.to_bits();
        let measurement = framed(&[
            (co2 >> 16) as u16,
            co2 as u16,
            (temp >> 16) as u16,
            temp as u16,
            (hum >> 16) as u16,
            hum as u16,
        ]);

        let mut bus = FakeBus::default();
        bus.replies
            .insert(0x61, vec![framed(&[1]), measurement]);
        let mut chip = Scd30::open(device(ChipKind::Scd30, bus), Duration::ZERO).unwrap();

        assert_eq!(chip.measure().unwrap(), vec![612.5, 21.25, 40.0]);
    }

    #[test]
    fn test_scd30_not_ready_within_timeout() {
        let mut bus = FakeBus::default();
        bus.replies.insert(0x61, vec![framed(&[0])]);
        let mut chip = Scd30::open(device(ChipKind::Scd30, bus), Duration::ZERO).unwrap();

        assert!(matches!(chip.measure(), Err(SensorError::NotReady(_))));
    }

    #[test]
    fn test_gme680_is_unsupported() {
        let bus = shared(Box::new(FakeBus::default()));
        assert!(matches!(
            open(ChipKind::Gme680, bus, 0x77),
            Err(SensorError::Unsupported(_))
        ));
    }
}
