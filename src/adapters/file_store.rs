//! JSON snapshot state store
//!
//! Each record kind lives in its own file (`agents.json`, `tasks.json`,
//! `circuits.json`). A write replaces the whole file through a temp file and
//! rename so a crash never leaves a torn snapshot behind.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

use crate::coordination::CircuitBreakerState;
use crate::domain::{Agent, AgentId, Task, TaskId};
use crate::error::Result;
use crate::persistence::StateStore;

const AGENTS_FILE: &str = "agents.json";
const TASKS_FILE: &str = "tasks.json";
const CIRCUITS_FILE: &str = "circuits.json";

pub struct FileStore {
    dir: PathBuf,
    agents: Mutex<BTreeMap<AgentId, Agent>>,
    tasks: Mutex<BTreeMap<TaskId, Task>>,
    circuits: Mutex<BTreeMap<String, CircuitBreakerState>>,
}

impl FileStore {
    /// Open (or create) a store rooted at `dir`
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let agents: Vec<Agent> = read_snapshot(&dir.join(AGENTS_FILE)).await?;
        let tasks: Vec<Task> = read_snapshot(&dir.join(TASKS_FILE)).await?;
        let circuits: Vec<CircuitBreakerState> = read_snapshot(&dir.join(CIRCUITS_FILE)).await?;

        debug!(
            agents = agents.len(),
            tasks = tasks.len(),
            circuits = circuits.len(),
            "loaded file store snapshots"
        );

        Ok(Self {
            agents: Mutex::new(agents.into_iter().map(|a| (a.id.clone(), a)).collect()),
            tasks: Mutex::new(tasks.into_iter().map(|t| (t.id, t)).collect()),
            circuits: Mutex::new(circuits.into_iter().map(|c| (c.key.clone(), c)).collect()),
            dir,
        })
    }

    async fn write_snapshot<T: Serialize>(&self, file: &str, values: Vec<&T>) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&values)?;
        let target = self.dir.join(file);
        let tmp = self.dir.join(format!("{}.tmp", file));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &target).await?;
        Ok(())
    }
}

async fn read_snapshot<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.is_empty() => Ok(Vec::new()),
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl StateStore for FileStore {
    async fn save_agent(&self, agent: &Agent) -> Result<()> {
        let mut agents = self.agents.lock().await;
        agents.insert(agent.id.clone(), agent.clone());
        self.write_snapshot(AGENTS_FILE, agents.values().collect()).await
    }

    async fn delete_agent(&self, agent_id: &str) -> Result<()> {
        let mut agents = self.agents.lock().await;
        if agents.remove(agent_id).is_none() {
            return Ok(());
        }
        self.write_snapshot(AGENTS_FILE, agents.values().collect()).await
    }

    async fn load_agents(&self) -> Result<Vec<Agent>> {
        Ok(self.agents.lock().await.values().cloned().collect())
    }

    async fn save_task(&self, task: &Task) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if let Some(stored) = tasks.get(&task.id) {
            if stored.version > task.version {
                return Ok(());
            }
        }
        tasks.insert(task.id, task.clone());
        self.write_snapshot(TASKS_FILE, tasks.values().collect()).await
    }

    async fn load_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.tasks.lock().await.values().cloned().collect())
    }

    async fn delete_tasks(&self, task_ids: &[TaskId]) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        let before = tasks.len();
        for id in task_ids {
            tasks.remove(id);
        }
        if tasks.len() == before {
            return Ok(());
        }
        self.write_snapshot(TASKS_FILE, tasks.values().collect()).await
    }

    async fn save_circuit(&self, state: &CircuitBreakerState) -> Result<()> {
        let mut circuits = self.circuits.lock().await;
        circuits.insert(state.key.clone(), state.clone());
        self.write_snapshot(CIRCUITS_FILE, circuits.values().collect())
            .await
    }

    async fn load_circuits(&self) -> Result<Vec<CircuitBreakerState>> {
        Ok(self.circuits.lock().await.values().cloned().collect())
    }
}
