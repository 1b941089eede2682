//! Messages the coordinator pushes into an agent inbox

use serde::{Deserialize, Serialize};

use crate::domain::{AssignmentEvent, TaskId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentCommand {
    /// Run this task
    Assignment(AssignmentEvent),
    /// Stop working on this task if still running
    Cancel { task_id: TaskId },
}

impl AgentCommand {
    pub fn task_id(&self) -> TaskId {
        match self {
            AgentCommand::Assignment(a) => a.task_id,
            AgentCommand::Cancel { task_id } => *task_id,
        }
    }
}
