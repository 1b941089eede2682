use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    AgentId, CircuitEvent, LivenessEvent, ScaleDirective, TaskEvent, TaskId, TaskStatus,
};

// ============================================================================
// Agent Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAgentResponse {
    pub agent_id: AgentId,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListAgentsQuery {
    pub capability: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeResponse {
    pub agent_id: AgentId,
    pub memory_min: u64,
    pub memory_max: u64,
}

// ============================================================================
// Task Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitTaskResponse {
    pub task_id: TaskId,
    pub status: TaskStatus,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListTasksQuery {
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptedResponse {
    pub accepted: bool,
}

// ============================================================================
// System Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub agents: usize,
    pub accepting_submissions: bool,
    pub uptime_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ============================================================================
// WebSocket Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WsMessage {
    #[serde(rename = "liveness")]
    Liveness(LivenessEvent),
    #[serde(rename = "scale")]
    Scale(ScaleDirective),
    #[serde(rename = "circuit")]
    Circuit(CircuitEvent),
    #[serde(rename = "task")]
    Task(TaskEvent),
    #[serde(rename = "lagged")]
    Lagged { missed: u64, at: DateTime<Utc> },
}
