use std::collections::BTreeMap;

/// Unix timestamp in whole seconds.
pub type Timestamp = i64;

/// Samples of one readout, keyed by the instant they were taken.
pub type Values = BTreeMap<Timestamp, f64>;

/// Output of one readout for one `Sensor::read` call.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub group: String,
    pub name: String,
    pub unit: Option<String>,
    pub precision: u32,
    pub topic: String,
    pub values: Values,
}

impl Reading {
    /// Buffer key; unique per readout across all configured sensors.
    pub fn key(&self) -> SeriesKey {
        SeriesKey {
            group: self.group.clone(),
            name: self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    pub group: String,
    pub name: String,
}

impl std::fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.group, self.name)
    }
}
