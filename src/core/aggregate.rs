//! Reduction of a buffered series to the value that gets published.

use std::fmt;

use super::sensors::types::Values;

/// Mean of a series, rounded to its precision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aggregate {
    /// Precision 0.
    Integer(i64),
    Decimal { value: f64, precision: u32 },
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregate::Integer(value) => write!(f, "{}", value),
            Aggregate::Decimal { value, precision } => {
                write!(f, "{:.*}", *precision as usize, value)
            }
        }
    }
}

/// Arithmetic mean of `values`, rounded half away from zero to `precision`
/// digits.
///
/// # Panics
///
/// On an empty series. The publisher only drains series that hold at least
/// one sample.
pub fn aggregate(values: &Values, precision: u32) -> Aggregate {
    assert!(!values.is_empty(), "aggregate called on an empty series");

    let mean = values.values().sum::<f64>() / values.len() as f64;
    if precision == 0 {
        return Aggregate::Integer(mean.round() as i64);
    }

    let factor = 10f64.powi(precision as i32);
    Aggregate::Decimal {
        value: (mean * factor).round() / factor,
        precision,
    }
}
