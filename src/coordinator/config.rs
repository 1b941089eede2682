//! Coordinator Configuration

use serde::{Deserialize, Serialize};

/// Configuration for the task coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Attempts granted to a submission that does not specify `max_attempts`
    pub default_max_attempts: u32,
    /// Maximum time a task may stay assigned/running before it counts as a
    /// transient failure of its agent (seconds)
    pub task_timeout_secs: u64,
    /// How long completed, failed and cancelled tasks stay queryable before
    /// the monitor cycle prunes them (seconds)
    pub terminal_retention_secs: u64,
    /// Capacity of the heartbeat and outcome ingestion channels
    pub inbound_buffer: usize,
    /// Capacity of the task event broadcast channel
    pub event_buffer: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: 3,
            task_timeout_secs: 300,
            terminal_retention_secs: 3600,
            inbound_buffer: 1024,
            event_buffer: 256,
        }
    }
}
