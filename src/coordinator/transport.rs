//! Outbound delivery seam between the coordinator and agents

use async_trait::async_trait;

use crate::domain::{Agent, AssignmentEvent, TaskId};
use crate::error::DispatchError;

/// Delivers assignments and cancellation signals to an agent's inbox.
///
/// Calls are wrapped by the error handler, which applies the timeout and
/// records the outcome against the agent's circuit.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn deliver(&self, agent: &Agent, assignment: &AssignmentEvent)
        -> Result<(), DispatchError>;

    /// Best-effort; the coordinator never waits on acknowledgment
    async fn cancel(&self, agent: &Agent, task_id: TaskId) -> Result<(), DispatchError>;
}
