use thiserror::Error;

use crate::domain::{AgentId, TaskId, TaskStatus};

/// Main error type for the coordinator
#[derive(Error, Debug)]
pub enum ConvoyError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Lookup errors
    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Task {task_id} is already {status}")]
    TaskAlreadyTerminal { task_id: TaskId, status: TaskStatus },

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Circuit open for {0}")]
    CircuitOpen(String),

    #[error("Coordinator is shutting down; new submissions are rejected")]
    ShuttingDown,

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for ConvoyError
pub type Result<T> = std::result::Result<T, ConvoyError>;

/// Failure of a single outbound call to an agent
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Timeout after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Rejected by agent (status {status}): {reason}")]
    Rejected { status: u16, reason: String },

    #[error("Agent server error (status {status})")]
    Server { status: u16 },

    #[error("Agent {0} is unavailable")]
    AgentUnavailable(AgentId),

    #[error("Agent reported memory pressure: {0}")]
    ResourceExhausted(String),

    #[error("Circuit open for {0}")]
    CircuitOpen(String),
}
