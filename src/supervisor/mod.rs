//! Fleet Supervision
//!
//! - Health monitor deriving liveness from heartbeats
//! - Resource manager adjusting per-agent memory envelopes

pub mod health_monitor;
pub mod resource_manager;

pub use health_monitor::{HealthConfig, HealthMonitor};
pub use resource_manager::{LoadTracker, ResourceConfig, ResourceManager};
