//! Orchestrator — wires the components together and runs their loops
//!
//! Heartbeats and outcomes arrive on bounded channels behind a clonable
//! [`CoordinatorHandle`]; each inbound stream, the monitor timer and the
//! event reactions run as independent tasks.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::coordinator::TaskCoordinator;
use super::state::FleetSnapshot;
use super::transport::AgentTransport;
use crate::config::AppConfig;
use crate::coordination::{CircuitBreakerState, ErrorHandler};
use crate::domain::{
    Agent, AgentDescriptor, AgentId, AgentStatus, CircuitEvent, Heartbeat, LivenessEvent,
    OutcomeReport, RegistryEvent, ResourceEnvelope, ScaleDirection, ScaleDirective, Task,
    TaskEvent, TaskId, TaskStatus, TaskSubmission,
};
use crate::error::{ConvoyError, Result};
use crate::persistence::StateStore;
use crate::registry::AgentRegistry;
use crate::supervisor::{HealthMonitor, ResourceManager};

/// Handle for submitting work and feeding events into a running orchestrator
#[derive(Clone)]
pub struct CoordinatorHandle {
    heartbeat_tx: mpsc::Sender<Heartbeat>,
    outcome_tx: mpsc::Sender<OutcomeReport>,
    registry: Arc<AgentRegistry>,
    health: Arc<HealthMonitor>,
    resources: Arc<ResourceManager>,
    errors: Arc<ErrorHandler>,
    tasks: Arc<TaskCoordinator>,
}

impl CoordinatorHandle {
    pub async fn register_agent(&self, descriptor: AgentDescriptor) -> Result<AgentId> {
        self.health.register(descriptor).await
    }

    /// Explicit deregistration; in-flight tasks are reassigned
    pub async fn deregister_agent(&self, agent_id: &str) -> Result<()> {
        self.health.deregister(agent_id).await.map(|_| ())
    }

    pub fn get_agent(&self, agent_id: &str) -> Result<Agent> {
        self.registry.get(agent_id)
    }

    pub fn list_agents(&self, capability: Option<&str>, status: Option<AgentStatus>) -> Vec<Agent> {
        self.registry.list(capability, status)
    }

    pub fn recommend_envelope(&self, agent_id: &str) -> Result<ResourceEnvelope> {
        self.resources.recommend_envelope(agent_id)
    }

    /// Queue a heartbeat for ingestion
    pub async fn send_heartbeat(&self, heartbeat: Heartbeat) -> Result<()> {
        self.heartbeat_tx
            .send(heartbeat)
            .await
            .map_err(|_| ConvoyError::Internal("coordinator heartbeat channel closed".into()))
    }

    /// Queue an outcome report for ingestion
    pub async fn report_outcome(&self, report: OutcomeReport) -> Result<()> {
        self.outcome_tx
            .send(report)
            .await
            .map_err(|_| ConvoyError::Internal("coordinator outcome channel closed".into()))
    }

    pub async fn submit(&self, submission: TaskSubmission) -> Result<TaskId> {
        self.tasks.submit(submission).await
    }

    pub async fn cancel(&self, task_id: TaskId) -> Result<Task> {
        self.tasks.cancel(task_id).await
    }

    pub fn get_status(&self, task_id: TaskId) -> Result<Task> {
        self.tasks.get_status(task_id)
    }

    pub fn list_tasks(&self, status: Option<TaskStatus>) -> Vec<Task> {
        self.tasks.list_tasks(status)
    }

    pub fn circuit_state(&self, key: &str) -> Option<CircuitBreakerState> {
        self.errors.state(key)
    }

    pub fn is_circuit_open(&self, key: &str) -> bool {
        self.errors.is_open(key)
    }

    pub fn fleet_snapshot(&self) -> FleetSnapshot {
        FleetSnapshot::collect(&self.registry, &self.tasks, &self.errors)
    }

    pub fn subscribe_liveness(&self) -> broadcast::Receiver<LivenessEvent> {
        self.health.subscribe()
    }

    pub fn subscribe_scale(&self) -> broadcast::Receiver<ScaleDirective> {
        self.resources.subscribe()
    }

    pub fn subscribe_circuits(&self) -> broadcast::Receiver<CircuitEvent> {
        self.errors.subscribe()
    }

    pub fn subscribe_tasks(&self) -> broadcast::Receiver<TaskEvent> {
        self.tasks.subscribe()
    }

    pub fn subscribe_registry(&self) -> broadcast::Receiver<RegistryEvent> {
        self.registry.subscribe()
    }
}

pub struct Orchestrator {
    check_interval: Duration,
    registry: Arc<AgentRegistry>,
    health: Arc<HealthMonitor>,
    resources: Arc<ResourceManager>,
    errors: Arc<ErrorHandler>,
    tasks: Arc<TaskCoordinator>,
    heartbeat_tx: mpsc::Sender<Heartbeat>,
    heartbeat_rx: mpsc::Receiver<Heartbeat>,
    outcome_tx: mpsc::Sender<OutcomeReport>,
    outcome_rx: mpsc::Receiver<OutcomeReport>,
}

impl Orchestrator {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn StateStore>,
        transport: Arc<dyn AgentTransport>,
    ) -> Self {
        let registry = Arc::new(AgentRegistry::new(
            config.resources.default_envelope(),
            store.clone(),
        ));
        let health = Arc::new(HealthMonitor::new(config.health.clone(), registry.clone()));
        let resources = Arc::new(ResourceManager::new(
            config.resources.clone(),
            registry.clone(),
        ));
        let errors = Arc::new(ErrorHandler::new(config.circuit.clone(), store.clone()));
        let tasks = Arc::new(TaskCoordinator::new(
            config.coordinator.clone(),
            registry.clone(),
            errors.clone(),
            resources.clone(),
            transport,
            store,
        ));

        let buffer = config.coordinator.inbound_buffer.max(1);
        let (heartbeat_tx, heartbeat_rx) = mpsc::channel(buffer);
        let (outcome_tx, outcome_rx) = mpsc::channel(buffer);

        Self {
            check_interval: config.health.check_interval(),
            registry,
            health,
            resources,
            errors,
            tasks,
            heartbeat_tx,
            heartbeat_rx,
            outcome_tx,
            outcome_rx,
        }
    }

    pub fn handle(&self) -> CoordinatorHandle {
        CoordinatorHandle {
            heartbeat_tx: self.heartbeat_tx.clone(),
            outcome_tx: self.outcome_tx.clone(),
            registry: self.registry.clone(),
            health: self.health.clone(),
            resources: self.resources.clone(),
            errors: self.errors.clone(),
            tasks: self.tasks.clone(),
        }
    }

    /// Reload persisted agents, circuits and tasks
    pub async fn restore(&self) -> Result<()> {
        let agents = self.registry.restore().await?;
        let circuits = self.errors.restore().await?;
        let tasks = self.tasks.restore().await?;
        info!(agents, circuits, tasks, "state restored");
        Ok(())
    }

    /// Run every loop until the shutdown signal fires
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            agents = self.registry.len(),
            check_interval_secs = self.check_interval.as_secs(),
            "orchestrator starting"
        );

        // Subscribe before anything is spawned so no early event is missed
        let liveness_rx = self.health.subscribe();
        let registry_rx = self.registry.subscribe();
        let circuit_rx = self.errors.subscribe();
        let scale_rx = self.resources.subscribe();

        self.tasks.retry_pending().await;

        let loops = vec![
            tokio::spawn(monitor_loop(
                self.check_interval,
                self.health.clone(),
                self.errors.clone(),
                self.tasks.clone(),
                shutdown_rx.resubscribe(),
            )),
            tokio::spawn(heartbeat_loop(
                self.heartbeat_rx,
                self.health.clone(),
                self.resources.clone(),
                shutdown_rx.resubscribe(),
            )),
            tokio::spawn(outcome_loop(
                self.outcome_rx,
                self.tasks.clone(),
                shutdown_rx.resubscribe(),
            )),
            tokio::spawn(reaction_loop(
                liveness_rx,
                registry_rx,
                circuit_rx,
                scale_rx,
                self.resources.clone(),
                self.tasks.clone(),
                shutdown_rx.resubscribe(),
            )),
        ];

        let _ = shutdown_rx.recv().await;
        info!("orchestrator: shutdown signal received");
        self.tasks.stop_accepting();

        for handle in loops {
            if let Err(e) = handle.await {
                warn!(error = %e, "orchestrator loop ended abnormally");
            }
        }
        info!("orchestrator: all loops exited");
    }
}

async fn monitor_loop(
    interval: Duration,
    health: Arc<HealthMonitor>,
    errors: Arc<ErrorHandler>,
    tasks: Arc<TaskCoordinator>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut tick = tokio::time::interval(interval);
    // Don't burst-fire missed ticks
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let transitions = health.evaluate().await;
                let half_opened = errors.tick().await;
                let timed_out = tasks.sweep_timeouts().await;
                let pruned = tasks.prune_terminal().await;
                if !transitions.is_empty() || !half_opened.is_empty() || timed_out > 0 || pruned > 0 {
                    debug!(
                        transitions = transitions.len(),
                        half_opened = half_opened.len(),
                        timed_out,
                        pruned,
                        "monitor cycle"
                    );
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }
    debug!("monitor loop exited");
}

async fn heartbeat_loop(
    mut rx: mpsc::Receiver<Heartbeat>,
    health: Arc<HealthMonitor>,
    resources: Arc<ResourceManager>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            Some(heartbeat) = rx.recv() => {
                match health.record_heartbeat(&heartbeat).await {
                    Ok(Some(record)) => {
                        if let Err(e) = resources
                            .on_load_sample(&record.agent_id, record.reported_load, record.reported_memory)
                            .await
                        {
                            debug!(agent_id = %record.agent_id, error = %e, "load sample not applied");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(agent_id = %heartbeat.agent_id, error = %e, "heartbeat dropped"),
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }
    debug!("heartbeat loop exited");
}

async fn outcome_loop(
    mut rx: mpsc::Receiver<OutcomeReport>,
    tasks: Arc<TaskCoordinator>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            Some(report) = rx.recv() => apply_outcome(&tasks, report).await,
            _ = shutdown_rx.recv() => break,
        }
    }
    // Outcomes already queued still settle their tasks
    while let Ok(report) = rx.try_recv() {
        apply_outcome(&tasks, report).await;
    }
    debug!("outcome loop exited");
}

async fn apply_outcome(tasks: &Arc<TaskCoordinator>, report: OutcomeReport) {
    let task_id = report.task_id;
    match tasks.handle_outcome(report).await {
        Ok(disposition) => debug!(task_id = %task_id, ?disposition, "outcome processed"),
        Err(e) => warn!(task_id = %task_id, error = %e, "outcome dropped"),
    }
}

async fn reaction_loop(
    mut liveness_rx: broadcast::Receiver<LivenessEvent>,
    mut registry_rx: broadcast::Receiver<RegistryEvent>,
    mut circuit_rx: broadcast::Receiver<CircuitEvent>,
    mut scale_rx: broadcast::Receiver<ScaleDirective>,
    resources: Arc<ResourceManager>,
    tasks: Arc<TaskCoordinator>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            event = liveness_rx.recv() => match event {
                Ok(event) => {
                    tasks.handle_liveness(&event).await;
                    if event.status == AgentStatus::Evicted {
                        resources.forget(&event.agent_id);
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "liveness events lagged, reconciling");
                    tasks.reconcile().await;
                }
                Err(RecvError::Closed) => break,
            },
            event = registry_rx.recv() => match event {
                Ok(RegistryEvent::Registered { .. }) | Ok(RegistryEvent::Updated { .. }) => {
                    tasks.retry_pending().await;
                }
                Ok(RegistryEvent::Deregistered { agent_id }) => {
                    tasks.reassign_from(&agent_id, "agent deregistered").await;
                }
                Ok(RegistryEvent::StatusChanged { .. }) => {}
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "registry events lagged, reconciling");
                    tasks.reconcile().await;
                }
                Err(RecvError::Closed) => break,
            },
            event = circuit_rx.recv() => match event {
                Ok(CircuitEvent::HalfOpened { .. }) | Ok(CircuitEvent::Closed { .. }) => {
                    tasks.retry_pending().await;
                }
                Ok(CircuitEvent::Opened { .. }) => {}
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "circuit events lagged, reconciling");
                    tasks.reconcile().await;
                }
                Err(RecvError::Closed) => break,
            },
            // A resized agent may now take work it turned away for memory
            directive = scale_rx.recv() => match directive {
                Ok(ScaleDirective { direction: ScaleDirection::Up, .. }) => {
                    tasks.retry_pending().await;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {
                    tasks.retry_pending().await;
                }
                Err(RecvError::Closed) => break,
            },
            _ = shutdown_rx.recv() => break,
        }
    }
    debug!("reaction loop exited");
}
