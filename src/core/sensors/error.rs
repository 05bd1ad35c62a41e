use thiserror::Error;

/// Failure of a single sensor read. Never escapes `Sensor::read`; the
/// collector logs it and the sensor produces no reading for that tick.
#[derive(Error, Debug)]
pub enum SensorError {
    /// A bus transaction failed.
    #[error("I2C transfer on bus {bus} failed: {reason}")]
    Io { bus: u8, reason: String },

    /// The sensor needs `I2C.Address` and has none.
    #[error("I2C address not defined")]
    UndefinedAddress,

    /// A readout's `Index` names no channel the device exposes.
    #[error("Readout '{readout}' is not mapped to a channel of {backend}")]
    UnmappedReadout { readout: String, backend: String },

    /// Backend not available in this build or on this host.
    #[error("Unsupported backend: {0}")]
    Unsupported(String),

    /// The device has no fresh measurement yet.
    #[error("{0} has no data ready")]
    NotReady(String),

    /// The device answered with data that fails its checksum or shape.
    #[error("Invalid data from {device}: {reason}")]
    InvalidData { device: String, reason: String },

    #[error("GPIO error: {0}")]
    Gpio(String),
}

impl SensorError {
    /// Not-ready is routine for slow chips and logged quietly.
    pub fn is_transient(&self) -> bool {
        matches!(self, SensorError::NotReady(_))
    }
}

pub type SensorResult<T> = Result<T, SensorError>;
