//! Task records owned by the task coordinator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use super::agent::AgentId;
use crate::error::{ConvoyError, Result};

pub type TaskId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal states are immutable
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Held by an agent
    pub fn is_in_flight(&self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ConvoyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "assigned" => Ok(TaskStatus::Assigned),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(ConvoyError::Validation(format!(
                "unknown task status '{}'",
                other
            ))),
        }
    }
}

/// How a failure should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Timeout, connection refused, 5xx: retried and counted by the circuit
    Transient,
    /// Malformed payload, capability mismatch: fails the task immediately
    Fatal,
    /// Agent is short on memory: routed to the resource manager
    ResourceExhausted,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Fatal => write!(f, "fatal"),
            ErrorClass::ResourceExhausted => write!(f, "resource_exhausted"),
        }
    }
}

/// Inbound task submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSubmission {
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl TaskSubmission {
    pub fn new(task_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Result of failing one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Back to pending for another attempt
    Requeued,
    /// Attempt budget used up; task is now failed
    Exhausted,
}

/// A unit of work routed by type to a capable agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: String,
    /// Opaque to the coordinator
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    pub assigned_agent_id: Option<AgentId>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Every agent that has held this task, in order
    #[serde(default)]
    pub attempted_agents: Vec<AgentId>,
    /// Bumped on every mutation; stores never persist an older version
    #[serde(default)]
    pub version: u64,
}

impl Task {
    pub fn new(
        submission: TaskSubmission,
        default_max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let task_type = submission.task_type.trim().to_string();
        if task_type.is_empty() {
            return Err(ConvoyError::Validation("task type must not be empty".into()));
        }
        let max_attempts = submission.max_attempts.unwrap_or(default_max_attempts);
        if max_attempts == 0 {
            return Err(ConvoyError::Validation(
                "max_attempts must be at least 1".into(),
            ));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            task_type,
            payload: submission.payload,
            status: TaskStatus::Pending,
            assigned_agent_id: None,
            attempt_count: 0,
            max_attempts,
            created_at: now,
            assigned_at: None,
            completed_at: None,
            result: None,
            error: None,
            attempted_agents: Vec::new(),
            version: 0,
        })
    }

    /// Whether `agent_id` has held this task at some point
    pub fn was_held_by(&self, agent_id: &str) -> bool {
        self.attempted_agents.iter().any(|a| a == agent_id)
    }

    /// Most recent agent this task was handed to
    pub fn last_agent(&self) -> Option<&str> {
        self.attempted_agents.last().map(String::as_str)
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(ConvoyError::TaskAlreadyTerminal {
                task_id: self.id,
                status: self.status,
            });
        }
        Ok(())
    }

    fn invalid(&self, to: TaskStatus) -> ConvoyError {
        ConvoyError::InvalidStateTransition {
            from: self.status.to_string(),
            to: to.to_string(),
        }
    }

    /// pending -> assigned
    pub fn assign(&mut self, agent_id: &str, now: DateTime<Utc>) -> Result<()> {
        self.ensure_mutable()?;
        if self.status != TaskStatus::Pending {
            return Err(self.invalid(TaskStatus::Assigned));
        }
        self.status = TaskStatus::Assigned;
        self.assigned_agent_id = Some(agent_id.to_string());
        self.assigned_at = Some(now);
        self.attempted_agents.push(agent_id.to_string());
        self.version += 1;
        Ok(())
    }

    /// assigned -> running, only for the agent currently holding the task
    pub fn mark_running(&mut self, agent_id: &str) -> Result<()> {
        if self.status != TaskStatus::Assigned
            || self.assigned_agent_id.as_deref() != Some(agent_id)
        {
            return Err(self.invalid(TaskStatus::Running));
        }
        self.status = TaskStatus::Running;
        self.version += 1;
        Ok(())
    }

    /// Any non-terminal state -> completed
    pub fn complete(&mut self, result: Option<serde_json::Value>, now: DateTime<Utc>) -> Result<()> {
        self.ensure_mutable()?;
        self.status = TaskStatus::Completed;
        self.assigned_agent_id = None;
        self.result = result;
        self.error = None;
        self.completed_at = Some(now);
        self.version += 1;
        Ok(())
    }

    /// Consume one attempt after a transient failure or loss of the agent.
    pub fn fail_attempt(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> Result<AttemptOutcome> {
        self.ensure_mutable()?;
        if !self.status.is_in_flight() {
            return Err(self.invalid(TaskStatus::Pending));
        }
        self.attempt_count = (self.attempt_count + 1).min(self.max_attempts);
        self.error = Some(error.into());
        self.assigned_agent_id = None;
        self.assigned_at = None;
        self.version += 1;

        if self.attempt_count >= self.max_attempts {
            self.status = TaskStatus::Failed;
            self.completed_at = Some(now);
            Ok(AttemptOutcome::Exhausted)
        } else {
            self.status = TaskStatus::Pending;
            Ok(AttemptOutcome::Requeued)
        }
    }

    /// A fatal failure ends the task without further attempts.
    pub fn fail_fatal(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        self.ensure_mutable()?;
        if self.status.is_in_flight() {
            self.attempt_count = (self.attempt_count + 1).min(self.max_attempts);
        }
        self.status = TaskStatus::Failed;
        self.error = Some(error.into());
        self.assigned_agent_id = None;
        self.assigned_at = None;
        self.completed_at = Some(now);
        self.version += 1;
        Ok(())
    }

    /// in-flight -> pending without consuming an attempt
    pub fn requeue(&mut self, reason: impl Into<String>) -> Result<()> {
        self.ensure_mutable()?;
        if !self.status.is_in_flight() {
            return Err(self.invalid(TaskStatus::Pending));
        }
        self.status = TaskStatus::Pending;
        self.error = Some(reason.into());
        self.assigned_agent_id = None;
        self.assigned_at = None;
        self.version += 1;
        Ok(())
    }

    /// Returns the agent that was holding the task, if any.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<Option<AgentId>> {
        self.ensure_mutable()?;
        let holder = self.assigned_agent_id.take();
        self.status = TaskStatus::Cancelled;
        self.assigned_at = None;
        self.completed_at = Some(now);
        self.version += 1;
        Ok(holder)
    }
}

/// Agent-reported result of an attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeReport {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub success: bool,
    #[serde(default)]
    pub error_class: Option<ErrorClass>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl OutcomeReport {
    pub fn success(task_id: TaskId, agent_id: impl Into<String>, result: Option<serde_json::Value>) -> Self {
        Self {
            task_id,
            agent_id: agent_id.into(),
            success: true,
            error_class: None,
            result,
            error: None,
        }
    }

    pub fn failure(
        task_id: TaskId,
        agent_id: impl Into<String>,
        class: ErrorClass,
        error: impl Into<String>,
    ) -> Self {
        Self {
            task_id,
            agent_id: agent_id.into(),
            success: false,
            error_class: Some(class),
            result: None,
            error: Some(error.into()),
        }
    }

    /// Missing class on a failure defaults to transient
    pub fn class(&self) -> ErrorClass {
        self.error_class.unwrap_or(ErrorClass::Transient)
    }
}
