//! Agent Registry
//!
//! Sole owner of [`Agent`] records. Other components read snapshots by value
//! and request mutations through the methods here; every map entry is locked
//! independently so dispatch never contends on a fleet-wide lock.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::domain::{
    Agent, AgentDescriptor, AgentId, AgentStatus, RegistryEvent, ResourceEnvelope,
};
use crate::error::{ConvoyError, Result};
use crate::persistence::StateStore;

pub struct AgentRegistry {
    agents: DashMap<AgentId, Agent>,
    default_envelope: ResourceEnvelope,
    store: Arc<dyn StateStore>,
    /// Agents whose heartbeat stamp has not been written yet
    unflushed: DashSet<AgentId>,
    event_tx: broadcast::Sender<RegistryEvent>,
}

impl AgentRegistry {
    pub fn new(default_envelope: ResourceEnvelope, store: Arc<dyn StateStore>) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            agents: DashMap::new(),
            default_envelope,
            store,
            unflushed: DashSet::new(),
            event_tx,
        }
    }

    /// Subscribe to membership changes
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_tx.subscribe()
    }

    /// Reload agent records from the store
    pub async fn restore(&self) -> Result<usize> {
        let agents = self.store.load_agents().await?;
        let count = agents.len();
        for agent in agents {
            if agent.status == AgentStatus::Evicted {
                continue;
            }
            self.agents.insert(agent.id.clone(), agent);
        }
        info!(count, "restored agent registry");
        Ok(count)
    }

    /// Register an agent; idempotent on the agent id.
    ///
    /// Re-registration refreshes endpoint and capabilities but keeps load,
    /// status and envelope untouched.
    pub async fn register(&self, descriptor: AgentDescriptor) -> Result<AgentId> {
        self.register_at(descriptor, Utc::now()).await
    }

    pub async fn register_at(
        &self,
        descriptor: AgentDescriptor,
        now: DateTime<Utc>,
    ) -> Result<AgentId> {
        descriptor.validate()?;
        let agent_id = descriptor.id.clone();

        let (snapshot, event) = match self.agents.entry(agent_id.clone()) {
            Entry::Occupied(mut entry) => {
                let agent = entry.get_mut();
                agent.endpoint = descriptor.endpoint;
                agent.advertised_endpoint = descriptor.advertised_endpoint;
                agent.capabilities = descriptor.capabilities;
                debug!(agent_id = %agent_id, "agent re-registered");
                (
                    agent.clone(),
                    RegistryEvent::Updated {
                        agent_id: agent_id.clone(),
                    },
                )
            }
            Entry::Vacant(entry) => {
                let agent = Agent::from_descriptor(descriptor, self.default_envelope, now);
                info!(
                    agent_id = %agent_id,
                    capabilities = ?agent.capabilities,
                    "agent registered"
                );
                (
                    entry.insert(agent).clone(),
                    RegistryEvent::Registered {
                        agent_id: agent_id.clone(),
                    },
                )
            }
        };

        self.persist(&snapshot).await;
        let _ = self.event_tx.send(event);
        Ok(agent_id)
    }

    /// Remove an agent from the fleet, returning its last record
    pub async fn deregister(&self, agent_id: &str) -> Result<Agent> {
        let (_, agent) = self
            .agents
            .remove(agent_id)
            .ok_or_else(|| ConvoyError::AgentNotFound(agent_id.to_string()))?;
        self.unflushed.remove(agent_id);

        if let Err(e) = self.store.delete_agent(agent_id).await {
            warn!(agent_id, error = %e, "failed to delete agent record");
        }
        let _ = self.event_tx.send(RegistryEvent::Deregistered {
            agent_id: agent_id.to_string(),
        });
        info!(agent_id, "agent deregistered");
        Ok(agent)
    }

    pub fn get(&self, agent_id: &str) -> Result<Agent> {
        self.agents
            .get(agent_id)
            .map(|a| a.clone())
            .ok_or_else(|| ConvoyError::AgentNotFound(agent_id.to_string()))
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    /// Agents matching the optional filters, ordered by id. No I/O.
    pub fn list(&self, capability: Option<&str>, status: Option<AgentStatus>) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self
            .agents
            .iter()
            .filter(|a| capability.map_or(true, |c| a.has_capability(c)))
            .filter(|a| status.map_or(true, |s| a.status == s))
            .map(|a| a.clone())
            .collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Set the status, returning the previous one
    pub async fn update_status(&self, agent_id: &str, status: AgentStatus) -> Result<AgentStatus> {
        let (previous, snapshot) = self.mutate(agent_id, |agent| {
            let previous = agent.status;
            agent.status = status;
            previous
        })?;

        if previous != status {
            self.persist(&snapshot).await;
            let _ = self.event_tx.send(RegistryEvent::StatusChanged {
                agent_id: agent_id.to_string(),
                status,
            });
        }
        Ok(previous)
    }

    /// Compare-and-set on status. Returns false when the agent's status is no
    /// longer `from` (a heartbeat raced the evaluation).
    pub async fn transition_status(
        &self,
        agent_id: &str,
        from: AgentStatus,
        to: AgentStatus,
    ) -> Result<bool> {
        let (applied, snapshot) = self.mutate(agent_id, |agent| {
            if agent.status == from {
                agent.status = to;
                true
            } else {
                false
            }
        })?;

        if applied && from != to {
            self.persist(&snapshot).await;
            let _ = self.event_tx.send(RegistryEvent::StatusChanged {
                agent_id: agent_id.to_string(),
                status: to,
            });
        }
        Ok(applied)
    }

    pub async fn update_envelope(&self, agent_id: &str, envelope: ResourceEnvelope) -> Result<()> {
        let (_, snapshot) = self.mutate(agent_id, |agent| {
            agent.resource_envelope = ResourceEnvelope {
                memory_current: agent.resource_envelope.memory_current,
                ..envelope
            };
        })?;
        self.persist(&snapshot).await;
        Ok(())
    }

    /// Stamp a received heartbeat. Only the health monitor calls this.
    ///
    /// The stamp reaches the store on the next [`Self::flush_heartbeats`];
    /// `reported_memory` is `None` for a heartbeat that arrived out of order.
    pub fn record_heartbeat(
        &self,
        agent_id: &str,
        at: DateTime<Utc>,
        reported_memory: Option<u64>,
    ) -> Result<Agent> {
        let (_, snapshot) = self.mutate(agent_id, |agent| {
            agent.last_heartbeat_at = Some(at);
            if let Some(memory) = reported_memory {
                agent.resource_envelope.memory_current = memory;
            }
        })?;
        self.unflushed.insert(snapshot.id.clone());
        Ok(snapshot)
    }

    /// Write heartbeat stamps recorded since the last flush
    pub async fn flush_heartbeats(&self) -> usize {
        let ids: Vec<AgentId> = self.unflushed.iter().map(|id| id.clone()).collect();
        let mut flushed = 0;
        for id in ids {
            self.unflushed.remove(&id);
            if let Ok(agent) = self.get(&id) {
                self.persist(&agent).await;
                flushed += 1;
            }
        }
        flushed
    }

    /// Add `delta` to the in-flight count, saturating at zero
    pub async fn adjust_load(&self, agent_id: &str, delta: i32) -> Result<u32> {
        let (load, snapshot) = self.mutate(agent_id, |agent| {
            agent.current_load = agent.current_load.saturating_add_signed(delta);
            agent.current_load
        })?;
        self.persist(&snapshot).await;
        Ok(load)
    }

    /// Overwrite loads from authoritative in-flight counts (restart recovery)
    pub async fn reset_loads(&self, loads: &HashMap<AgentId, u32>) {
        let ids: Vec<AgentId> = self.agents.iter().map(|a| a.id.clone()).collect();
        for id in ids {
            let load = loads.get(&id).copied().unwrap_or(0);
            if let Ok((_, snapshot)) = self.mutate(&id, |agent| agent.current_load = load) {
                self.persist(&snapshot).await;
            }
        }
    }

    fn mutate<T>(&self, agent_id: &str, f: impl FnOnce(&mut Agent) -> T) -> Result<(T, Agent)> {
        let mut agent = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| ConvoyError::AgentNotFound(agent_id.to_string()))?;
        let out = f(&mut agent);
        Ok((out, agent.clone()))
    }

    async fn persist(&self, agent: &Agent) {
        if let Err(e) = self.store.save_agent(agent).await {
            warn!(agent_id = %agent.id, error = %e, "failed to persist agent record");
        }
    }
}
