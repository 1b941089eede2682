//! Task Coordination
//!
//! Routes submitted tasks to capable, healthy agents, delivers them through
//! an [`AgentTransport`], and runs the orchestrator loops that connect the
//! registry, health monitor, resource manager and error handler.

pub mod command;
pub mod config;
pub mod coordinator;
pub mod runtime;
pub mod state;
pub mod transport;

pub use command::AgentCommand;
pub use config::CoordinatorConfig;
pub use coordinator::{OutcomeDisposition, TaskCoordinator};
pub use runtime::{CoordinatorHandle, Orchestrator};
pub use state::FleetSnapshot;
pub use transport::AgentTransport;
