//! In-memory state store

use async_trait::async_trait;
use dashmap::DashMap;

use crate::coordination::CircuitBreakerState;
use crate::domain::{Agent, AgentId, Task, TaskId};
use crate::error::Result;
use crate::persistence::StateStore;

#[derive(Debug, Default)]
pub struct MemoryStore {
    agents: DashMap<AgentId, Agent>,
    tasks: DashMap<TaskId, Task>,
    circuits: DashMap<String, CircuitBreakerState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn save_agent(&self, agent: &Agent) -> Result<()> {
        self.agents.insert(agent.id.clone(), agent.clone());
        Ok(())
    }

    async fn delete_agent(&self, agent_id: &str) -> Result<()> {
        self.agents.remove(agent_id);
        Ok(())
    }

    async fn load_agents(&self) -> Result<Vec<Agent>> {
        Ok(self.agents.iter().map(|e| e.value().clone()).collect())
    }

    async fn save_task(&self, task: &Task) -> Result<()> {
        self.tasks
            .entry(task.id)
            .and_modify(|stored| {
                if task.version >= stored.version {
                    *stored = task.clone();
                }
            })
            .or_insert_with(|| task.clone());
        Ok(())
    }

    async fn load_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.tasks.iter().map(|e| e.value().clone()).collect())
    }

    async fn delete_tasks(&self, task_ids: &[TaskId]) -> Result<()> {
        for id in task_ids {
            self.tasks.remove(id);
        }
        Ok(())
    }

    async fn save_circuit(&self, state: &CircuitBreakerState) -> Result<()> {
        self.circuits.insert(state.key.clone(), state.clone());
        Ok(())
    }

    async fn load_circuits(&self) -> Result<Vec<CircuitBreakerState>> {
        Ok(self.circuits.iter().map(|e| e.value().clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskSubmission;
    use chrono::Utc;
    use serde_json::json;

    #[tokio::test]
    async fn test_stale_task_version_is_ignored() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut task = Task::new(TaskSubmission::new("analysis", json!({})), 3, now).unwrap();
        let pending = task.clone();

        task.assign("a1", now).unwrap();
        task.complete(None, now).unwrap();
        store.save_task(&task).await.unwrap();
        store.save_task(&pending).await.unwrap();

        let loaded = store.load_tasks().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].status, crate::domain::TaskStatus::Completed);
    }
}
