//! Runtime settings of the agent process itself.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use validator::Validate;

/// `[agent]` section.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AgentConfig {
    /// Lock file holding the PID of the running instance.
    pub pid_file: PathBuf,

    /// Collector tick in seconds. Sensors are checked for due-ness on every
    /// tick, so this is the finest sampling resolution.
    #[validate(range(min = 1, max = 3600, message = "Collect period must be between 1 and 3600 seconds"))]
    pub collect_period: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            pid_file: PathBuf::from("/run/sensebee/sensebee.pid"),
            collect_period: 1,
        }
    }
}
