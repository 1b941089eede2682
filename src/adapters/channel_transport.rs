//! In-process delivery for embedded agents

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::coordinator::{AgentCommand, AgentTransport};
use crate::domain::{Agent, AgentId, AssignmentEvent, TaskId};
use crate::error::DispatchError;

/// One bounded inbox per connected agent. An agent without an inbox, or
/// whose receiver was dropped, is unavailable.
#[derive(Default)]
pub struct ChannelTransport {
    inboxes: DashMap<AgentId, mpsc::Sender<AgentCommand>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or replace) the inbox for `agent_id`
    pub fn connect(&self, agent_id: impl Into<AgentId>, buffer: usize) -> mpsc::Receiver<AgentCommand> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        self.inboxes.insert(agent_id.into(), tx);
        rx
    }

    pub fn disconnect(&self, agent_id: &str) {
        self.inboxes.remove(agent_id);
    }

    async fn send(&self, agent: &Agent, command: AgentCommand) -> Result<(), DispatchError> {
        let tx = self
            .inboxes
            .get(&agent.id)
            .map(|tx| tx.clone())
            .ok_or_else(|| DispatchError::AgentUnavailable(agent.id.clone()))?;

        tx.send(command).await.map_err(|_| {
            debug!(agent_id = %agent.id, "inbox closed");
            self.inboxes.remove(&agent.id);
            DispatchError::AgentUnavailable(agent.id.clone())
        })
    }
}

#[async_trait]
impl AgentTransport for ChannelTransport {
    async fn deliver(&self, agent: &Agent, assignment: &AssignmentEvent) -> Result<(), DispatchError> {
        self.send(agent, AgentCommand::Assignment(assignment.clone()))
            .await
    }

    async fn cancel(&self, agent: &Agent, task_id: TaskId) -> Result<(), DispatchError> {
        self.send(agent, AgentCommand::Cancel { task_id }).await
    }
}
