//! Agent records owned by the registry

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;

use crate::error::{ConvoyError, Result};

/// Stable agent identifier supplied by the agent itself
pub type AgentId = String;

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

/// Global envelope floor (512 MiB)
pub const MEMORY_FLOOR: u64 = 512 * MIB;
/// Global envelope ceiling (8 GiB)
pub const MEMORY_CEILING: u64 = 8 * GIB;

/// Heartbeat-derived agent status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Registered, no heartbeat seen yet
    Registering,
    Healthy,
    /// Missed at least one heartbeat interval
    Degraded,
    /// Missed enough intervals that its tasks were taken away
    Unhealthy,
    /// Removed from the fleet
    Evicted,
}

impl AgentStatus {
    /// Only healthy agents are eligible for new work
    pub fn can_accept_work(&self) -> bool {
        matches!(self, AgentStatus::Healthy)
    }

    /// Unhealthy and evicted agents must not hold in-flight tasks
    pub fn has_lost_liveness(&self) -> bool {
        matches!(self, AgentStatus::Unhealthy | AgentStatus::Evicted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Registering => "registering",
            AgentStatus::Healthy => "healthy",
            AgentStatus::Degraded => "degraded",
            AgentStatus::Unhealthy => "unhealthy",
            AgentStatus::Evicted => "evicted",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = ConvoyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "registering" => Ok(AgentStatus::Registering),
            "healthy" => Ok(AgentStatus::Healthy),
            "degraded" => Ok(AgentStatus::Degraded),
            "unhealthy" => Ok(AgentStatus::Unhealthy),
            "evicted" => Ok(AgentStatus::Evicted),
            other => Err(ConvoyError::Validation(format!(
                "unknown agent status '{}'",
                other
            ))),
        }
    }
}

/// Permitted memory range for an agent, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEnvelope {
    pub memory_min: u64,
    pub memory_max: u64,
    /// Last reported usage (0 until the first heartbeat)
    pub memory_current: u64,
}

impl ResourceEnvelope {
    /// Build an envelope clamped into `[floor, ceiling]` with `min <= max`
    pub fn bounded(memory_min: u64, memory_max: u64, floor: u64, ceiling: u64) -> Self {
        let memory_max = memory_max.clamp(floor, ceiling);
        let memory_min = memory_min.clamp(floor, memory_max);
        Self {
            memory_min,
            memory_max,
            memory_current: 0,
        }
    }

    pub fn with_current(mut self, memory_current: u64) -> Self {
        self.memory_current = memory_current;
        self
    }

    /// Fraction of `memory_max` currently in use
    pub fn utilization(&self) -> f64 {
        if self.memory_max == 0 {
            return 0.0;
        }
        self.memory_current as f64 / self.memory_max as f64
    }
}

impl Default for ResourceEnvelope {
    fn default() -> Self {
        Self::bounded(MEMORY_FLOOR, GIB, MEMORY_FLOOR, MEMORY_CEILING)
    }
}

/// Registration message sent by an agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub id: AgentId,
    pub capabilities: BTreeSet<String>,
    /// Address reachable inside the local network
    pub endpoint: String,
    /// Externally advertised address for cross-network deployments
    #[serde(default)]
    pub advertised_endpoint: Option<String>,
}

impl AgentDescriptor {
    pub fn new(
        id: impl Into<String>,
        capabilities: impl IntoIterator<Item = impl Into<String>>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            endpoint: endpoint.into(),
            advertised_endpoint: None,
        }
    }

    pub fn with_advertised_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.advertised_endpoint = Some(endpoint.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(ConvoyError::Validation("agent id must not be empty".into()));
        }
        if self.endpoint.trim().is_empty() {
            return Err(ConvoyError::Validation(format!(
                "agent {} has no endpoint",
                self.id
            )));
        }
        if self.capabilities.iter().any(|c| c.trim().is_empty()) {
            return Err(ConvoyError::Validation(format!(
                "agent {} advertises an empty capability",
                self.id
            )));
        }
        Ok(())
    }
}

/// A worker process known to the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub capabilities: BTreeSet<String>,
    pub status: AgentStatus,
    /// In-flight task count
    pub current_load: u32,
    pub resource_envelope: ResourceEnvelope,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
    pub endpoint: String,
    #[serde(default)]
    pub advertised_endpoint: Option<String>,
}

impl Agent {
    pub fn from_descriptor(
        descriptor: AgentDescriptor,
        envelope: ResourceEnvelope,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: descriptor.id,
            capabilities: descriptor.capabilities,
            status: AgentStatus::Registering,
            current_load: 0,
            resource_envelope: envelope,
            last_heartbeat_at: None,
            registered_at: now,
            endpoint: descriptor.endpoint,
            advertised_endpoint: descriptor.advertised_endpoint,
        }
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// Address the coordinator should dial, preferring the advertised one
    pub fn dispatch_endpoint(&self) -> &str {
        self.advertised_endpoint
            .as_deref()
            .filter(|e| !e.trim().is_empty())
            .unwrap_or(&self.endpoint)
    }
}
