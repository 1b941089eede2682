pub mod adapters;
pub mod api;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod coordinator;
pub mod domain;
pub mod error;
pub mod logging;
pub mod persistence;
pub mod registry;
pub mod supervisor;

pub use config::AppConfig;
pub use coordination::{CircuitBreakerConfig, CircuitBreakerState, CircuitState, ErrorHandler};
pub use coordinator::{
    AgentCommand, AgentTransport, CoordinatorConfig, CoordinatorHandle, FleetSnapshot,
    Orchestrator, OutcomeDisposition, TaskCoordinator,
};
pub use error::{ConvoyError, DispatchError, Result};
pub use persistence::{open_store, PersistenceConfig, StateStore, StorageBackend};
pub use registry::AgentRegistry;
pub use supervisor::{HealthConfig, HealthMonitor, ResourceConfig, ResourceManager};
