//! Health Monitor
//!
//! Derives per-agent liveness from heartbeats. Heartbeat ingestion is the
//! only write path into `last_heartbeat_at`; evaluation runs on a fixed
//! cadence independent of heartbeat arrival and also writes heartbeat
//! stamps back to the store.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::domain::{
    Agent, AgentDescriptor, AgentId, AgentStatus, Heartbeat, HeartbeatRecord, LivenessEvent,
};
use crate::error::{ConvoyError, Result};
use crate::registry::AgentRegistry;

/// Configuration for the health monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Expected heartbeat interval and evaluation cadence (default: 5s)
    pub check_interval_secs: u64,
    /// Missed intervals before `degraded` (default: 1)
    pub degraded_after_misses: u32,
    /// Missed intervals before `unhealthy` (default: 3)
    pub unhealthy_after_misses: u32,
    /// Missed intervals before eviction (default: 10)
    pub evict_after_misses: u32,
    /// Heartbeats kept per agent for load averaging (default: 16)
    pub heartbeat_window: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 5,
            degraded_after_misses: 1,
            unhealthy_after_misses: 3,
            evict_after_misses: 10,
            heartbeat_window: 16,
        }
    }
}

impl HealthConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

pub struct HealthMonitor {
    config: HealthConfig,
    registry: Arc<AgentRegistry>,
    windows: DashMap<AgentId, VecDeque<HeartbeatRecord>>,
    event_tx: broadcast::Sender<LivenessEvent>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, registry: Arc<AgentRegistry>) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            config,
            registry,
            windows: DashMap::new(),
            event_tx,
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Subscribe to liveness changes
    pub fn subscribe(&self) -> broadcast::Receiver<LivenessEvent> {
        self.event_tx.subscribe()
    }

    /// Register through the monitor so a restarted agent starts with an
    /// empty heartbeat window.
    pub async fn register(&self, descriptor: AgentDescriptor) -> Result<AgentId> {
        self.register_at(descriptor, Utc::now()).await
    }

    pub async fn register_at(
        &self,
        descriptor: AgentDescriptor,
        now: DateTime<Utc>,
    ) -> Result<AgentId> {
        let agent_id = self.registry.register_at(descriptor, now).await?;
        self.windows.remove(&agent_id);
        Ok(agent_id)
    }

    pub async fn record_heartbeat(&self, heartbeat: &Heartbeat) -> Result<Option<HeartbeatRecord>> {
        self.record_heartbeat_at(heartbeat, Utc::now()).await
    }

    /// Accept a heartbeat received at `now`.
    ///
    /// Liveness always follows the receive time. The agent's own timestamp
    /// only decides whether the sample enters the rolling window: one older
    /// than the newest windowed sample returns `None`. Malformed and
    /// unknown-agent heartbeats are rejected.
    pub async fn record_heartbeat_at(
        &self,
        heartbeat: &Heartbeat,
        now: DateTime<Utc>,
    ) -> Result<Option<HeartbeatRecord>> {
        let agent_id = heartbeat.agent_id.trim();
        if agent_id.is_empty() {
            return Err(ConvoyError::Validation("heartbeat without agent id".into()));
        }
        let agent = self.registry.get(agent_id)?;

        let record = HeartbeatRecord {
            agent_id: agent.id.clone(),
            received_at: now,
            reported_at: heartbeat.timestamp,
            reported_load: heartbeat.reported_load,
            reported_memory: heartbeat.reported_memory,
        };

        let windowed = {
            let mut window = self.windows.entry(agent.id.clone()).or_default();
            match window.back().map(|last| last.reported_at) {
                Some(newest) if heartbeat.timestamp < newest => {
                    debug!(
                        agent_id = %agent.id,
                        reported_at = %heartbeat.timestamp,
                        %newest,
                        "out-of-order heartbeat kept out of window"
                    );
                    false
                }
                _ => {
                    window.push_back(record.clone());
                    while window.len() > self.config.heartbeat_window.max(1) {
                        window.pop_front();
                    }
                    true
                }
            }
        };

        let agent = self.registry.record_heartbeat(
            &agent.id,
            now,
            windowed.then_some(heartbeat.reported_memory),
        )?;

        if agent.status != AgentStatus::Healthy {
            if self
                .registry
                .transition_status(&agent.id, agent.status, AgentStatus::Healthy)
                .await?
            {
                info!(agent_id = %agent.id, previous = %agent.status, "agent healthy");
                self.emit(&agent.id, agent.status, AgentStatus::Healthy, now);
            }
        }

        debug!(
            agent_id = %agent.id,
            load = heartbeat.reported_load,
            memory = heartbeat.reported_memory,
            "heartbeat accepted"
        );
        Ok(windowed.then_some(record))
    }

    /// Status an agent should have at `now` given its last heartbeat
    pub fn classify(&self, agent: &Agent, now: DateTime<Utc>) -> AgentStatus {
        let interval_ms = (self.config.check_interval_secs as i64 * 1000).max(1);

        let Some(last) = agent.last_heartbeat_at else {
            let waited = (now - agent.registered_at).num_milliseconds() / interval_ms;
            return if waited >= self.config.evict_after_misses as i64 {
                AgentStatus::Evicted
            } else {
                agent.status
            };
        };

        let misses = ((now - last).num_milliseconds() / interval_ms).max(0);
        if misses >= self.config.evict_after_misses as i64 {
            AgentStatus::Evicted
        } else if misses >= self.config.unhealthy_after_misses as i64 {
            AgentStatus::Unhealthy
        } else if misses >= self.config.degraded_after_misses as i64 {
            AgentStatus::Degraded
        } else {
            AgentStatus::Healthy
        }
    }

    pub async fn evaluate(&self) -> Vec<LivenessEvent> {
        self.evaluate_at(Utc::now()).await
    }

    /// One monitor cycle: reclassify every agent and apply transitions
    pub async fn evaluate_at(&self, now: DateTime<Utc>) -> Vec<LivenessEvent> {
        let mut events = Vec::new();

        for agent in self.registry.list(None, None) {
            let next = self.classify(&agent, now);
            if next == agent.status {
                continue;
            }

            let applied = if next == AgentStatus::Evicted {
                match self.registry.deregister(&agent.id).await {
                    Ok(_) => {
                        self.windows.remove(&agent.id);
                        true
                    }
                    Err(_) => false,
                }
            } else {
                self.registry
                    .transition_status(&agent.id, agent.status, next)
                    .await
                    .unwrap_or(false)
            };
            if !applied {
                continue;
            }

            if next.has_lost_liveness() {
                warn!(agent_id = %agent.id, previous = %agent.status, status = %next, "liveness lost");
            } else {
                info!(agent_id = %agent.id, previous = %agent.status, status = %next, "agent status changed");
            }
            events.push(self.emit(&agent.id, agent.status, next, now));
        }

        let flushed = self.registry.flush_heartbeats().await;
        if flushed > 0 {
            debug!(flushed, "heartbeat stamps persisted");
        }
        events
    }

    /// Explicit deregistration, reported as an eviction
    pub async fn deregister(&self, agent_id: &str) -> Result<LivenessEvent> {
        let agent = self.registry.deregister(agent_id).await?;
        self.windows.remove(agent_id);
        info!(agent_id, "agent deregistered explicitly");
        Ok(self.emit(agent_id, agent.status, AgentStatus::Evicted, Utc::now()))
    }

    pub fn recent_heartbeats(&self, agent_id: &str) -> Vec<HeartbeatRecord> {
        self.windows
            .get(agent_id)
            .map(|w| w.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Mean reported load over the rolling window
    pub fn average_load(&self, agent_id: &str) -> Option<f64> {
        let window = self.windows.get(agent_id)?;
        if window.is_empty() {
            return None;
        }
        let total: u64 = window.iter().map(|r| r.reported_load as u64).sum();
        Some(total as f64 / window.len() as f64)
    }

    fn emit(
        &self,
        agent_id: &str,
        previous: AgentStatus,
        status: AgentStatus,
        at: DateTime<Utc>,
    ) -> LivenessEvent {
        let event = LivenessEvent {
            agent_id: agent_id.to_string(),
            previous,
            status,
            at,
        };
        let _ = self.event_tx.send(event.clone());
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryStore;
    use crate::domain::ResourceEnvelope;
    use chrono::Duration as ChronoDuration;

    async fn monitor_with_agent(now: DateTime<Utc>) -> (HealthMonitor, Arc<AgentRegistry>) {
        let registry = Arc::new(AgentRegistry::new(
            ResourceEnvelope::default(),
            Arc::new(MemoryStore::new()),
        ));
        registry
            .register_at(AgentDescriptor::new("a1", ["analysis"], "http://a1"), now)
            .await
            .unwrap();
        let monitor = HealthMonitor::new(HealthConfig::default(), registry.clone());
        (monitor, registry)
    }

    #[tokio::test]
    async fn test_first_heartbeat_marks_healthy() {
        let now = Utc::now();
        let (monitor, registry) = monitor_with_agent(now).await;
        let mut rx = monitor.subscribe();

        monitor
            .record_heartbeat_at(&Heartbeat::new("a1", 0, 0).at(now), now)
            .await
            .unwrap();

        assert_eq!(registry.get("a1").unwrap().status, AgentStatus::Healthy);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.previous, AgentStatus::Registering);
        assert_eq!(event.status, AgentStatus::Healthy);
    }

    #[tokio::test]
    async fn test_missed_heartbeats_walk_the_state_machine() {
        let now = Utc::now();
        let (monitor, registry) = monitor_with_agent(now).await;
        monitor
            .record_heartbeat_at(&Heartbeat::new("a1", 0, 0).at(now), now)
            .await
            .unwrap();

        assert!(monitor.evaluate_at(now + ChronoDuration::seconds(4)).await.is_empty());

        let events = monitor.evaluate_at(now + ChronoDuration::seconds(5)).await;
        assert_eq!(events[0].status, AgentStatus::Degraded);
        assert!(!events[0].is_liveness_lost());

        let events = monitor.evaluate_at(now + ChronoDuration::seconds(15)).await;
        assert_eq!(events[0].status, AgentStatus::Unhealthy);
        assert!(events[0].is_liveness_lost());
        assert_eq!(registry.get("a1").unwrap().status, AgentStatus::Unhealthy);

        let events = monitor.evaluate_at(now + ChronoDuration::seconds(50)).await;
        assert_eq!(events[0].status, AgentStatus::Evicted);
        assert!(registry.get("a1").is_err());
    }

    #[tokio::test]
    async fn test_heartbeat_recovers_unhealthy_agent_immediately() {
        let now = Utc::now();
        let (monitor, registry) = monitor_with_agent(now).await;
        monitor
            .record_heartbeat_at(&Heartbeat::new("a1", 0, 0).at(now), now)
            .await
            .unwrap();
        monitor.evaluate_at(now + ChronoDuration::seconds(20)).await;
        assert_eq!(registry.get("a1").unwrap().status, AgentStatus::Unhealthy);

        let later = now + ChronoDuration::seconds(21);
        monitor
            .record_heartbeat_at(&Heartbeat::new("a1", 1, 0).at(later), later)
            .await
            .unwrap();
        assert_eq!(registry.get("a1").unwrap().status, AgentStatus::Healthy);
    }

    #[tokio::test]
    async fn test_out_of_order_heartbeat_counts_for_liveness_only() {
        let now = Utc::now();
        let (monitor, registry) = monitor_with_agent(now).await;
        monitor
            .record_heartbeat_at(&Heartbeat::new("a1", 0, 64).at(now), now)
            .await
            .unwrap();

        let later = now + ChronoDuration::seconds(20);
        monitor.evaluate_at(later).await;
        assert_eq!(registry.get("a1").unwrap().status, AgentStatus::Unhealthy);

        let stale = Heartbeat::new("a1", 0, 999).at(now - ChronoDuration::seconds(1));
        assert!(monitor.record_heartbeat_at(&stale, later).await.unwrap().is_none());

        let agent = registry.get("a1").unwrap();
        assert_eq!(agent.status, AgentStatus::Healthy);
        assert_eq!(agent.last_heartbeat_at, Some(later));
        assert_eq!(agent.resource_envelope.memory_current, 64);
        assert_eq!(monitor.recent_heartbeats("a1").len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_malformed_and_unknown_heartbeats() {
        let now = Utc::now();
        let (monitor, _) = monitor_with_agent(now).await;

        assert!(monitor
            .record_heartbeat_at(&Heartbeat::new("  ", 0, 0), now)
            .await
            .is_err());
        assert!(matches!(
            monitor.record_heartbeat_at(&Heartbeat::new("ghost", 0, 0), now).await,
            Err(ConvoyError::AgentNotFound(_))
        ));
        assert!(monitor.recent_heartbeats("a1").is_empty());
    }

    #[tokio::test]
    async fn test_restarted_agent_with_earlier_clock_stays_live() {
        let now = Utc::now();
        let (monitor, registry) = monitor_with_agent(now).await;

        // Clock ran two minutes ahead before the restart
        let skewed = Heartbeat::new("a1", 0, 0).at(now + ChronoDuration::seconds(120));
        monitor.record_heartbeat_at(&skewed, now).await.unwrap();

        monitor
            .register_at(AgentDescriptor::new("a1", ["analysis"], "http://a1"), now)
            .await
            .unwrap();
        assert!(monitor.recent_heartbeats("a1").is_empty());

        let mut windowed = 0;
        for i in 1..=12 {
            let at = now + ChronoDuration::seconds(5 * i);
            if monitor
                .record_heartbeat_at(&Heartbeat::new("a1", 0, 0).at(at), at)
                .await
                .unwrap()
                .is_some()
            {
                windowed += 1;
            }
            monitor.evaluate_at(at).await;
        }

        assert_eq!(windowed, 12);
        assert_eq!(registry.get("a1").unwrap().status, AgentStatus::Healthy);
    }

    #[tokio::test]
    async fn test_skewed_heartbeats_without_reregistration_keep_agent_live() {
        let now = Utc::now();
        let (monitor, registry) = monitor_with_agent(now).await;
        let skewed = Heartbeat::new("a1", 0, 0).at(now + ChronoDuration::seconds(120));
        monitor.record_heartbeat_at(&skewed, now).await.unwrap();

        for i in 1..=12 {
            let at = now + ChronoDuration::seconds(5 * i);
            monitor
                .record_heartbeat_at(&Heartbeat::new("a1", 0, 0).at(at), at)
                .await
                .unwrap();
            assert!(monitor.evaluate_at(at).await.is_empty());
        }
        assert_eq!(registry.get("a1").unwrap().status, AgentStatus::Healthy);
    }

    #[tokio::test]
    async fn test_window_is_bounded_and_averages_load() {
        let now = Utc::now();
        let (monitor, _) = monitor_with_agent(now).await;
        for i in 0..20u32 {
            let at = now + ChronoDuration::seconds(i as i64);
            monitor
                .record_heartbeat_at(&Heartbeat::new("a1", i, 0).at(at), at)
                .await
                .unwrap();
        }
        assert_eq!(monitor.recent_heartbeats("a1").len(), 16);
        // loads 4..=19
        assert_eq!(monitor.average_load("a1"), Some(11.5));
    }

    #[tokio::test]
    async fn test_silent_registering_agent_is_evicted_after_grace() {
        let now = Utc::now();
        let (monitor, registry) = monitor_with_agent(now).await;

        assert!(monitor.evaluate_at(now + ChronoDuration::seconds(45)).await.is_empty());
        let events = monitor.evaluate_at(now + ChronoDuration::seconds(50)).await;
        assert_eq!(events[0].previous, AgentStatus::Registering);
        assert_eq!(events[0].status, AgentStatus::Evicted);
        assert!(registry.is_empty());
    }
}
