//! Messages flowing into and out of the coordinator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::agent::{AgentId, AgentStatus};
use super::task::{TaskId, TaskStatus};

/// Periodic liveness message from an agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub agent_id: AgentId,
    #[serde(default)]
    pub reported_load: u32,
    /// Resident memory in bytes
    #[serde(default)]
    pub reported_memory: u64,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Heartbeat {
    pub fn new(agent_id: impl Into<String>, reported_load: u32, reported_memory: u64) -> Self {
        Self {
            agent_id: agent_id.into(),
            reported_load,
            reported_memory,
            timestamp: Utc::now(),
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Accepted heartbeat kept in the monitor's rolling window
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeartbeatRecord {
    pub agent_id: AgentId,
    pub received_at: DateTime<Utc>,
    /// Timestamp the agent put on the heartbeat
    pub reported_at: DateTime<Utc>,
    pub reported_load: u32,
    pub reported_memory: u64,
}

/// Work handed to an agent's inbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentEvent {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    #[serde(rename = "type")]
    pub task_type: String,
    pub payload: serde_json::Value,
    /// 1-based attempt number
    pub attempt: u32,
}

/// Health status change of an agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessEvent {
    pub agent_id: AgentId,
    pub previous: AgentStatus,
    pub status: AgentStatus,
    pub at: DateTime<Utc>,
}

impl LivenessEvent {
    /// Emitted on transition to unhealthy or evicted
    pub fn is_liveness_lost(&self) -> bool {
        self.status.has_lost_liveness()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleDirection {
    Up,
    Down,
}

impl std::fmt::Display for ScaleDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScaleDirection::Up => write!(f, "scale_up"),
            ScaleDirection::Down => write!(f, "scale_down"),
        }
    }
}

/// Advisory envelope change for the container runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleDirective {
    pub agent_id: AgentId,
    pub direction: ScaleDirection,
    pub memory_min: u64,
    pub memory_max: u64,
    pub at: DateTime<Utc>,
}

/// Membership changes in the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegistryEvent {
    Registered { agent_id: AgentId },
    Updated { agent_id: AgentId },
    StatusChanged { agent_id: AgentId, status: AgentStatus },
    Deregistered { agent_id: AgentId },
}

/// Circuit breaker transitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CircuitEvent {
    Opened {
        key: String,
        failure_count: u32,
        reset_timeout_secs: u64,
    },
    HalfOpened {
        key: String,
    },
    Closed {
        key: String,
    },
}

/// Task lifecycle notifications
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskEvent {
    Assigned {
        task_id: TaskId,
        agent_id: AgentId,
        attempt: u32,
    },
    Running {
        task_id: TaskId,
        agent_id: AgentId,
    },
    Requeued {
        task_id: TaskId,
        attempt_count: u32,
        reason: String,
    },
    Completed {
        task_id: TaskId,
        agent_id: AgentId,
    },
    /// Terminal; the task will not be retried again
    Failed {
        task_id: TaskId,
        attempt_count: u32,
        error: String,
    },
    Cancelled {
        task_id: TaskId,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            TaskEvent::Assigned { task_id, .. }
            | TaskEvent::Running { task_id, .. }
            | TaskEvent::Requeued { task_id, .. }
            | TaskEvent::Completed { task_id, .. }
            | TaskEvent::Failed { task_id, .. }
            | TaskEvent::Cancelled { task_id } => *task_id,
        }
    }

    /// Status the task holds right after this event
    pub fn status(&self) -> TaskStatus {
        match self {
            TaskEvent::Assigned { .. } => TaskStatus::Assigned,
            TaskEvent::Running { .. } => TaskStatus::Running,
            TaskEvent::Requeued { .. } => TaskStatus::Pending,
            TaskEvent::Completed { .. } => TaskStatus::Completed,
            TaskEvent::Failed { .. } => TaskStatus::Failed,
            TaskEvent::Cancelled { .. } => TaskStatus::Cancelled,
        }
    }
}
