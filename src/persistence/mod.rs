//! Persistence Layer for Restart Recovery
//!
//! Agent records, task records and circuit breaker state survive a restart.
//! Writes are write-behind: the in-memory components stay authoritative and
//! a failed write is logged, never propagated to the caller.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::adapters::{FileStore, MemoryStore, PostgresStore};
use crate::coordination::CircuitBreakerState;
use crate::domain::{Agent, Task, TaskId};
use crate::error::{ConvoyError, Result};

/// Durable storage for the records each component owns
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save_agent(&self, agent: &Agent) -> Result<()>;
    async fn delete_agent(&self, agent_id: &str) -> Result<()>;
    async fn load_agents(&self) -> Result<Vec<Agent>>;

    /// Implementations must ignore a task whose version is older than the stored one
    async fn save_task(&self, task: &Task) -> Result<()>;
    async fn load_tasks(&self) -> Result<Vec<Task>>;
    /// Drop records of tasks pruned from memory
    async fn delete_tasks(&self, task_ids: &[TaskId]) -> Result<()>;

    async fn save_circuit(&self, state: &CircuitBreakerState) -> Result<()>;
    async fn load_circuits(&self) -> Result<Vec<CircuitBreakerState>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Nothing survives a restart
    Memory,
    /// JSON snapshots under `data_dir`
    File,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub backend: StorageBackend,
    /// Directory for the file backend
    pub data_dir: PathBuf,
    /// PostgreSQL connection URL for the postgres backend
    pub database_url: Option<String>,
    /// Maximum connections in pool
    pub max_connections: u32,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::File,
            data_dir: PathBuf::from("data"),
            database_url: None,
            max_connections: 5,
        }
    }
}

/// Open the configured backend
pub async fn open_store(config: &PersistenceConfig) -> Result<Arc<dyn StateStore>> {
    match config.backend {
        StorageBackend::Memory => {
            info!("using in-memory state store; state will not survive restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        StorageBackend::File => {
            let store = FileStore::open(&config.data_dir).await?;
            info!(dir = %config.data_dir.display(), "using file state store");
            Ok(Arc::new(store))
        }
        StorageBackend::Postgres => {
            let url = config.database_url.as_deref().ok_or_else(|| {
                ConvoyError::InvalidConfig(
                    "persistence.database_url is required for the postgres backend".into(),
                )
            })?;
            let store = PostgresStore::new(url, config.max_connections).await?;
            store.migrate().await?;
            Ok(Arc::new(store))
        }
    }
}
