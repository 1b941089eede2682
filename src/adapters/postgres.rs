use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Row;
use tracing::{debug, info, instrument};

use crate::coordination::CircuitBreakerState;
use crate::domain::{Agent, Task, TaskId};
use crate::error::Result;
use crate::persistence::StateStore;

/// PostgreSQL storage adapter
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Create a PostgreSQL store from an existing connection pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl StateStore for PostgresStore {
    // ==================== Agents ====================

    #[instrument(skip(self, agent), fields(agent_id = %agent.id))]
    async fn save_agent(&self, agent: &Agent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO agents (id, status, record, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                record = EXCLUDED.record,
                updated_at = NOW()
            "#,
        )
        .bind(&agent.id)
        .bind(agent.status.as_str())
        .bind(Json(agent))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_agent(&self, agent_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM agents WHERE id = $1")
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        debug!(agent_id, "deleted agent record");
        Ok(())
    }

    async fn load_agents(&self) -> Result<Vec<Agent>> {
        let rows = sqlx::query("SELECT record FROM agents ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|r| -> Result<Agent> { Ok(r.try_get::<Json<Agent>, _>("record")?.0) })
            .collect()
    }

    // ==================== Tasks ====================

    #[instrument(skip(self, task), fields(task_id = %task.id, version = task.version))]
    async fn save_task(&self, task: &Task) -> Result<()> {
        // Older versions lose: out-of-order write-behind never regresses a task.
        sqlx::query(
            r#"
            INSERT INTO tasks (id, task_type, status, assigned_agent_id, version, record, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                assigned_agent_id = EXCLUDED.assigned_agent_id,
                version = EXCLUDED.version,
                record = EXCLUDED.record,
                updated_at = NOW()
            WHERE tasks.version <= EXCLUDED.version
            "#,
        )
        .bind(task.id)
        .bind(&task.task_type)
        .bind(task.status.as_str())
        .bind(task.assigned_agent_id.as_deref())
        .bind(i64::try_from(task.version).unwrap_or(i64::MAX))
        .bind(Json(task))
        .bind(task.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_tasks(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query("SELECT record FROM tasks ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|r| -> Result<Task> { Ok(r.try_get::<Json<Task>, _>("record")?.0) })
            .collect()
    }

    async fn delete_tasks(&self, task_ids: &[TaskId]) -> Result<()> {
        if task_ids.is_empty() {
            return Ok(());
        }
        let result = sqlx::query("DELETE FROM tasks WHERE id = ANY($1)")
            .bind(task_ids)
            .execute(&self.pool)
            .await?;
        debug!(deleted = result.rows_affected(), "pruned task records");
        Ok(())
    }

    // ==================== Circuit breakers ====================

    async fn save_circuit(&self, state: &CircuitBreakerState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO circuit_breakers (key, state, record, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (key) DO UPDATE SET
                state = EXCLUDED.state,
                record = EXCLUDED.record,
                updated_at = NOW()
            "#,
        )
        .bind(&state.key)
        .bind(state.state.as_str())
        .bind(Json(state))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_circuits(&self) -> Result<Vec<CircuitBreakerState>> {
        let rows = sqlx::query("SELECT record FROM circuit_breakers ORDER BY key")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|r| -> Result<CircuitBreakerState> { Ok(r.try_get::<Json<CircuitBreakerState>, _>("record")?.0) })
            .collect()
    }
}
