//! Scheduler configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Scheduling configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between promotion cycles and dispatcher refreshes
    #[serde(rename = "interval-secs", default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Maximum number of simultaneously active schedules
    #[serde(rename = "concurrent-groups", default = "default_concurrent_groups")]
    pub concurrent_groups: usize,

    /// How long a request waits for a task selection
    #[serde(rename = "selection-timeout-ms", default = "default_selection_timeout_ms")]
    pub selection_timeout_ms: u64,
}

fn default_interval_secs() -> u64 {
    60
}

fn default_concurrent_groups() -> usize {
    10
}

fn default_selection_timeout_ms() -> u64 {
    1000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            concurrent_groups: default_concurrent_groups(),
            selection_timeout_ms: default_selection_timeout_ms(),
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn selection_timeout(&self) -> Duration {
        Duration::from_millis(self.selection_timeout_ms)
    }
}
