//! Resource Manager
//!
//! Tracks an EWMA of reported memory per agent and emits advisory
//! [`ScaleDirective`]s when utilization of `memory_max` stays past a
//! watermark. The container runtime consumes the directives; this component
//! only records the new envelope in the registry.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::domain::{AgentId, ResourceEnvelope, ScaleDirection, ScaleDirective, MIB};
use crate::error::Result;
use crate::registry::AgentRegistry;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Weight of the newest sample in the moving average
    pub ewma_alpha: f64,
    /// Utilization of `memory_max` above which samples count toward scale-up
    pub scale_up_utilization: f64,
    /// Consecutive samples above the high watermark before scaling up
    pub scale_up_samples: u32,
    pub scale_down_utilization: f64,
    pub scale_down_samples: u32,
    /// Multiplicative step applied to `memory_max`
    pub step_multiplier: f64,
    pub memory_floor_mb: u64,
    pub memory_ceiling_mb: u64,
    /// Envelope given to newly registered agents
    pub default_memory_min_mb: u64,
    pub default_memory_max_mb: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            ewma_alpha: 0.5,
            scale_up_utilization: 0.8,
            scale_up_samples: 2,
            scale_down_utilization: 0.3,
            scale_down_samples: 5,
            step_multiplier: 1.5,
            memory_floor_mb: 512,
            memory_ceiling_mb: 8192,
            default_memory_min_mb: 512,
            default_memory_max_mb: 1024,
        }
    }
}

impl ResourceConfig {
    pub fn floor(&self) -> u64 {
        self.memory_floor_mb * MIB
    }

    pub fn ceiling(&self) -> u64 {
        self.memory_ceiling_mb * MIB
    }

    pub fn default_envelope(&self) -> ResourceEnvelope {
        ResourceEnvelope::bounded(
            self.default_memory_min_mb * MIB,
            self.default_memory_max_mb * MIB,
            self.floor(),
            self.ceiling(),
        )
    }
}

/// Per-agent load signal
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadTracker {
    /// EWMA of reported memory in bytes
    pub ewma: f64,
    pub last_load: u32,
    pub samples: u64,
    above: u32,
    below: u32,
}

pub struct ResourceManager {
    config: ResourceConfig,
    registry: Arc<AgentRegistry>,
    trackers: DashMap<AgentId, LoadTracker>,
    event_tx: broadcast::Sender<ScaleDirective>,
}

impl ResourceManager {
    pub fn new(config: ResourceConfig, registry: Arc<AgentRegistry>) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            config,
            registry,
            trackers: DashMap::new(),
            event_tx,
        }
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    /// Subscribe to scale directives
    pub fn subscribe(&self) -> broadcast::Receiver<ScaleDirective> {
        self.event_tx.subscribe()
    }

    pub fn tracker(&self, agent_id: &str) -> Option<LoadTracker> {
        self.trackers.get(agent_id).map(|t| t.clone())
    }

    pub fn forget(&self, agent_id: &str) {
        self.trackers.remove(agent_id);
    }

    pub async fn on_load_sample(
        &self,
        agent_id: &str,
        load: u32,
        reported_memory: u64,
    ) -> Result<Option<ScaleDirective>> {
        self.on_load_sample_at(agent_id, load, reported_memory, Utc::now())
            .await
    }

    /// Fold one sample into the agent's average and emit a directive once a
    /// watermark has held for the configured number of consecutive samples.
    pub async fn on_load_sample_at(
        &self,
        agent_id: &str,
        load: u32,
        reported_memory: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<ScaleDirective>> {
        let envelope = self.registry.get(agent_id)?.resource_envelope;

        let direction = {
            let mut tracker = self.trackers.entry(agent_id.to_string()).or_default();
            tracker.ewma = if tracker.samples == 0 {
                reported_memory as f64
            } else {
                let alpha = self.config.ewma_alpha;
                alpha * reported_memory as f64 + (1.0 - alpha) * tracker.ewma
            };
            tracker.samples += 1;
            tracker.last_load = load;

            let utilization = if envelope.memory_max == 0 {
                0.0
            } else {
                tracker.ewma / envelope.memory_max as f64
            };

            if utilization > self.config.scale_up_utilization {
                tracker.above += 1;
                tracker.below = 0;
            } else if utilization < self.config.scale_down_utilization {
                tracker.below += 1;
                tracker.above = 0;
            } else {
                tracker.above = 0;
                tracker.below = 0;
            }

            debug!(
                agent_id,
                utilization,
                above = tracker.above,
                below = tracker.below,
                "load sample"
            );

            if tracker.above >= self.config.scale_up_samples {
                tracker.above = 0;
                Some(ScaleDirection::Up)
            } else if tracker.below >= self.config.scale_down_samples {
                tracker.below = 0;
                Some(ScaleDirection::Down)
            } else {
                None
            }
        };

        match direction {
            Some(direction) => self.apply(agent_id, envelope, direction, now).await,
            None => Ok(None),
        }
    }

    /// Memory pressure reported by an agent: scale up without waiting for
    /// the moving average.
    pub async fn on_memory_pressure(&self, agent_id: &str) -> Result<Option<ScaleDirective>> {
        let envelope = self.registry.get(agent_id)?.resource_envelope;
        if let Some(mut tracker) = self.trackers.get_mut(agent_id) {
            tracker.above = 0;
            tracker.below = 0;
        }
        info!(agent_id, "memory pressure reported");
        self.apply(agent_id, envelope, ScaleDirection::Up, Utc::now())
            .await
    }

    /// Envelope the agent should run with given its current average. Pure
    /// read; does not require consecutive samples.
    pub fn recommend_envelope(&self, agent_id: &str) -> Result<ResourceEnvelope> {
        let envelope = self.registry.get(agent_id)?.resource_envelope;
        let Some(tracker) = self.tracker(agent_id) else {
            return Ok(envelope);
        };
        let utilization = if envelope.memory_max == 0 {
            0.0
        } else {
            tracker.ewma / envelope.memory_max as f64
        };

        Ok(if utilization > self.config.scale_up_utilization {
            self.scaled(envelope, ScaleDirection::Up)
        } else if utilization < self.config.scale_down_utilization {
            self.scaled(envelope, ScaleDirection::Down)
        } else {
            envelope
        })
    }

    fn scaled(&self, envelope: ResourceEnvelope, direction: ScaleDirection) -> ResourceEnvelope {
        let current = envelope.memory_max as f64;
        let target = match direction {
            ScaleDirection::Up => current * self.config.step_multiplier,
            ScaleDirection::Down => current / self.config.step_multiplier,
        };
        ResourceEnvelope::bounded(
            envelope.memory_min,
            target.round() as u64,
            self.config.floor(),
            self.config.ceiling(),
        )
        .with_current(envelope.memory_current)
    }

    async fn apply(
        &self,
        agent_id: &str,
        envelope: ResourceEnvelope,
        direction: ScaleDirection,
        now: DateTime<Utc>,
    ) -> Result<Option<ScaleDirective>> {
        let next = self.scaled(envelope, direction);
        if next.memory_max == envelope.memory_max && next.memory_min == envelope.memory_min {
            debug!(agent_id, %direction, "envelope already at bound");
            return Ok(None);
        }

        self.registry.update_envelope(agent_id, next).await?;
        let directive = ScaleDirective {
            agent_id: agent_id.to_string(),
            direction,
            memory_min: next.memory_min,
            memory_max: next.memory_max,
            at: now,
        };
        info!(
            agent_id,
            %direction,
            memory_min = next.memory_min,
            memory_max = next.memory_max,
            "scale directive emitted"
        );
        let _ = self.event_tx.send(directive.clone());
        Ok(Some(directive))
    }
}
