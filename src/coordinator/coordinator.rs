//! Task Coordinator
//!
//! Owns every [`Task`]. Assigns work by capability and load, dispatches it
//! fire-and-forget through the error handler, and drives retries off
//! dispatch failures, outcome reports and liveness events.
//!
//! Each task is mutated under its own map entry lock and only while that
//! lock is held is a terminal status checked, so the first terminal write
//! wins and later ones are discarded.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::config::CoordinatorConfig;
use super::transport::AgentTransport;
use crate::coordination::{ErrorHandler, Permit};
use crate::domain::{
    Agent, AgentId, AgentStatus, AssignmentEvent, AttemptOutcome, ErrorClass, LivenessEvent,
    OutcomeReport, Task, TaskEvent, TaskId, TaskStatus, TaskSubmission,
};
use crate::error::{ConvoyError, DispatchError, Result};
use crate::persistence::StateStore;
use crate::registry::AgentRegistry;
use crate::supervisor::ResourceManager;

/// What happened to an outcome report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeDisposition {
    Applied,
    /// Task already terminal, or the report came from a stale assignment
    Discarded,
}

/// A state change made under the task lock, applied after it is released
struct Transition {
    task: Task,
    event: TaskEvent,
    /// Agent whose in-flight count drops by one
    release: Option<AgentId>,
    /// Try to place the task again
    retry: bool,
    /// Agent left out of that placement attempt
    exclude: Option<AgentId>,
}

pub struct TaskCoordinator {
    config: CoordinatorConfig,
    tasks: DashMap<TaskId, Task>,
    registry: Arc<AgentRegistry>,
    errors: Arc<ErrorHandler>,
    resources: Arc<ResourceManager>,
    transport: Arc<dyn AgentTransport>,
    store: Arc<dyn StateStore>,
    event_tx: broadcast::Sender<TaskEvent>,
    accepting: AtomicBool,
}

impl TaskCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        registry: Arc<AgentRegistry>,
        errors: Arc<ErrorHandler>,
        resources: Arc<ResourceManager>,
        transport: Arc<dyn AgentTransport>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_buffer.max(16));
        Self {
            config,
            tasks: DashMap::new(),
            registry,
            errors,
            resources,
            transport,
            store,
            event_tx,
            accepting: AtomicBool::new(true),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.event_tx.subscribe()
    }

    /// Refuse new submissions; in-flight work keeps resolving
    pub fn stop_accepting(&self) {
        if self.accepting.swap(false, Ordering::SeqCst) {
            info!("task coordinator no longer accepting submissions");
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Reload tasks from the store and rebuild agent loads from them.
    ///
    /// In-flight tasks whose agent is gone are put back to pending without
    /// consuming an attempt.
    pub async fn restore(&self) -> Result<usize> {
        let tasks = self.store.load_tasks().await?;
        let count = tasks.len();
        let mut loads: HashMap<AgentId, u32> = HashMap::new();

        for mut task in tasks {
            if task.status.is_in_flight() {
                match task.assigned_agent_id.clone() {
                    Some(agent_id) if self.registry.contains(&agent_id) => {
                        *loads.entry(agent_id).or_default() += 1;
                    }
                    holder => {
                        warn!(
                            task_id = %task.id,
                            agent_id = ?holder,
                            "requeueing task held by unknown agent"
                        );
                        task.requeue("agent lost across restart")?;
                        self.persist(&task).await;
                    }
                }
            }
            self.tasks.insert(task.id, task);
        }

        self.registry.reset_loads(&loads).await;
        info!(count, "restored tasks");
        Ok(count)
    }

    /// Accept a submission and try to place it immediately
    pub async fn submit(self: &Arc<Self>, submission: TaskSubmission) -> Result<TaskId> {
        if !self.is_accepting() {
            return Err(ConvoyError::ShuttingDown);
        }
        let task = Task::new(submission, self.config.default_max_attempts, Utc::now())?;
        let task_id = task.id;
        info!(
            task_id = %task_id,
            task_type = %task.task_type,
            max_attempts = task.max_attempts,
            "task submitted"
        );

        self.tasks.insert(task_id, task.clone());
        self.persist(&task).await;
        self.try_assign(task_id).await;
        Ok(task_id)
    }

    pub fn get_status(&self, task_id: TaskId) -> Result<Task> {
        self.tasks
            .get(&task_id)
            .map(|t| t.clone())
            .ok_or(ConvoyError::TaskNotFound(task_id))
    }

    /// Tasks in creation order, optionally filtered by status
    pub fn list_tasks(&self, status: Option<TaskStatus>) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .iter()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .map(|t| t.clone())
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        tasks
    }

    pub fn count_by_status(&self) -> HashMap<TaskStatus, usize> {
        let mut counts = HashMap::new();
        for task in self.tasks.iter() {
            *counts.entry(task.status).or_default() += 1;
        }
        counts
    }

    /// Run the assignment algorithm for a pending task.
    ///
    /// Returns false when the task stays pending. The agent that held the
    /// previous attempt is only used when no other agent is eligible.
    pub async fn try_assign(self: &Arc<Self>, task_id: TaskId) -> bool {
        self.try_assign_excluding(task_id, None).await
    }

    /// As [`Self::try_assign`], never choosing `exclude`
    async fn try_assign_excluding(self: &Arc<Self>, task_id: TaskId, exclude: Option<&str>) -> bool {
        let Some((task_type, avoid)) = self.tasks.get(&task_id).and_then(|t| {
            (t.status == TaskStatus::Pending)
                .then(|| (t.task_type.clone(), t.last_agent().map(str::to_string)))
        }) else {
            return false;
        };

        let Some((agent, permit)) = self
            .select_agent(&task_type, avoid.as_deref(), exclude)
            .await
        else {
            debug!(task_id = %task_id, task_type = %task_type, "no eligible agent, task stays pending");
            return false;
        };

        let assigned = match self.tasks.get_mut(&task_id) {
            Some(mut task) if task.status == TaskStatus::Pending => {
                match task.assign(&agent.id, Utc::now()) {
                    Ok(()) => Some(task.clone()),
                    Err(_) => None,
                }
            }
            _ => None,
        };
        let Some(task) = assigned else {
            if permit == Permit::Probe {
                self.errors.release_probe(&agent.id);
            }
            return false;
        };

        if let Err(e) = self.registry.adjust_load(&agent.id, 1).await {
            debug!(agent_id = %agent.id, error = %e, "load not recorded");
        }
        let attempt = task.attempt_count + 1;
        info!(
            task_id = %task.id,
            agent_id = %agent.id,
            attempt,
            probe = permit == Permit::Probe,
            "task assigned"
        );
        self.persist(&task).await;
        self.emit(TaskEvent::Assigned {
            task_id,
            agent_id: agent.id.clone(),
            attempt,
        });

        tokio::spawn(Arc::clone(self).dispatch(task, agent.id));
        true
    }

    /// Healthy, capable agents whose circuit admits a dispatch, lowest load
    /// first with ties broken by id. `avoid` is tried last, `exclude` never.
    async fn select_agent(
        &self,
        task_type: &str,
        avoid: Option<&str>,
        exclude: Option<&str>,
    ) -> Option<(Agent, Permit)> {
        let mut candidates: Vec<Agent> = self
            .registry
            .list(Some(task_type), Some(AgentStatus::Healthy))
            .into_iter()
            .filter(|a| exclude != Some(a.id.as_str()))
            .filter(|a| !self.errors.is_open(&a.id))
            .collect();
        candidates.sort_by(|a, b| {
            let a_avoided = avoid == Some(a.id.as_str());
            let b_avoided = avoid == Some(b.id.as_str());
            a_avoided
                .cmp(&b_avoided)
                .then(a.current_load.cmp(&b.current_load))
                .then(a.id.cmp(&b.id))
        });

        for agent in candidates {
            let permit = self.errors.try_acquire(&agent.id).await;
            if permit.is_granted() {
                return Some((agent, permit));
            }
        }
        None
    }

    /// Deliver the assignment. Boxed so the retry path can spawn it again.
    fn dispatch(self: Arc<Self>, task: Task, agent_id: AgentId) -> BoxFuture<'static, ()> {
        async move {
            let agent = match self.registry.get(&agent_id) {
                Ok(agent) => agent,
                Err(_) => {
                    self.errors.release_probe(&agent_id);
                    warn!(task_id = %task.id, agent_id = %agent_id, "agent vanished before dispatch");
                    self.handle_dispatch_failure(
                        task.id,
                        &agent_id,
                        DispatchError::AgentUnavailable(agent_id.clone()),
                    )
                    .await;
                    return;
                }
            };

            let assignment = AssignmentEvent {
                task_id: task.id,
                agent_id: agent.id.clone(),
                task_type: task.task_type.clone(),
                payload: task.payload.clone(),
                attempt: task.attempt_count + 1,
            };
            let result = self
                .errors
                .execute_permitted(&agent.id, self.transport.deliver(&agent, &assignment))
                .await;

            match result {
                Ok(()) => self.mark_running(task.id, &agent.id).await,
                Err(e) => self.handle_dispatch_failure(task.id, &agent.id, e).await,
            }
        }
        .boxed()
    }

    async fn mark_running(&self, task_id: TaskId, agent_id: &str) {
        let running = self.tasks.get_mut(&task_id).and_then(|mut task| {
            task.mark_running(agent_id).ok().map(|_| task.clone())
        });
        match running {
            Some(task) => {
                debug!(task_id = %task_id, agent_id, "assignment delivered");
                self.persist(&task).await;
                self.emit(TaskEvent::Running {
                    task_id,
                    agent_id: agent_id.to_string(),
                });
            }
            None => debug!(task_id = %task_id, agent_id, "delivery acknowledged after task moved on"),
        }
    }

    async fn handle_dispatch_failure(
        self: &Arc<Self>,
        task_id: TaskId,
        agent_id: &str,
        error: DispatchError,
    ) {
        let class = ErrorHandler::classify(&error);
        warn!(task_id = %task_id, agent_id, error = %error, class = %class, "dispatch failed");
        self.apply_failure(task_id, agent_id, class, error.to_string())
            .await;
    }

    /// Route a failure of the current holder's attempt by class
    async fn apply_failure(
        self: &Arc<Self>,
        task_id: TaskId,
        agent_id: &str,
        class: ErrorClass,
        reason: String,
    ) -> bool {
        if class == ErrorClass::ResourceExhausted {
            if let Err(e) = self.resources.on_memory_pressure(agent_id).await {
                debug!(agent_id, error = %e, "memory pressure not applied");
            }
        }

        let transition = {
            let Some(mut task) = self.tasks.get_mut(&task_id) else {
                return false;
            };
            if !task.status.is_in_flight() || task.assigned_agent_id.as_deref() != Some(agent_id) {
                return false;
            }
            let now = Utc::now();
            match class {
                ErrorClass::Fatal => task.fail_fatal(reason.clone(), now).ok().map(|_| Transition {
                    event: TaskEvent::Failed {
                        task_id,
                        attempt_count: task.attempt_count,
                        error: reason.clone(),
                    },
                    task: task.clone(),
                    release: Some(agent_id.to_string()),
                    retry: false,
                    exclude: None,
                }),
                // Free attempt, so the same agent is not offered it again
                // until its envelope or the fleet changes.
                ErrorClass::ResourceExhausted => task.requeue(reason.clone()).ok().map(|_| Transition {
                    event: TaskEvent::Requeued {
                        task_id,
                        attempt_count: task.attempt_count,
                        reason: reason.clone(),
                    },
                    task: task.clone(),
                    release: Some(agent_id.to_string()),
                    retry: true,
                    exclude: Some(agent_id.to_string()),
                }),
                ErrorClass::Transient => task
                    .fail_attempt(reason.clone(), now)
                    .ok()
                    .map(|outcome| attempt_transition(&task, agent_id, outcome, &reason)),
            }
        };

        match transition {
            Some(transition) => {
                self.finish(transition).await;
                true
            }
            None => false,
        }
    }

    /// Apply an agent's outcome report
    pub async fn handle_outcome(self: &Arc<Self>, report: OutcomeReport) -> Result<OutcomeDisposition> {
        let (holder, stale) = {
            let task = self
                .tasks
                .get(&report.task_id)
                .ok_or(ConvoyError::TaskNotFound(report.task_id))?;
            if task.status.is_terminal() {
                debug!(task_id = %report.task_id, status = %task.status, "outcome for terminal task discarded");
                return Ok(OutcomeDisposition::Discarded);
            }
            if !task.was_held_by(&report.agent_id) {
                warn!(
                    task_id = %report.task_id,
                    agent_id = %report.agent_id,
                    "outcome from agent that never held the task"
                );
                return Ok(OutcomeDisposition::Discarded);
            }
            let holder = task.assigned_agent_id.clone();
            let stale = !task.status.is_in_flight() || holder.as_deref() != Some(&report.agent_id);
            (holder, stale)
        };

        if report.success {
            self.errors.record_outcome(&report.agent_id, true).await;
            let transition = {
                let Some(mut task) = self.tasks.get_mut(&report.task_id) else {
                    return Err(ConvoyError::TaskNotFound(report.task_id));
                };
                let holder = task.assigned_agent_id.clone();
                match task.complete(report.result.clone(), Utc::now()) {
                    Ok(()) => Transition {
                        event: TaskEvent::Completed {
                            task_id: report.task_id,
                            agent_id: report.agent_id.clone(),
                        },
                        task: task.clone(),
                        release: holder,
                        retry: false,
                        exclude: None,
                    },
                    Err(_) => return Ok(OutcomeDisposition::Discarded),
                }
            };
            info!(task_id = %report.task_id, agent_id = %report.agent_id, "task completed");

            // A previous holder finished first; the current one can stop.
            if let Some(current) = holder.filter(|h| *h != report.agent_id) {
                self.cancel_on_agent(current, report.task_id);
            }
            self.finish(transition).await;
            return Ok(OutcomeDisposition::Applied);
        }

        if stale {
            debug!(
                task_id = %report.task_id,
                agent_id = %report.agent_id,
                "failure from stale assignment discarded"
            );
            return Ok(OutcomeDisposition::Discarded);
        }

        let class = report.class();
        if class == ErrorClass::Transient {
            self.errors.record_outcome(&report.agent_id, false).await;
        }
        let reason = report
            .error
            .clone()
            .unwrap_or_else(|| format!("{} failure reported by agent", class));
        info!(task_id = %report.task_id, agent_id = %report.agent_id, class = %class, "task attempt failed");

        if self
            .apply_failure(report.task_id, &report.agent_id, class, reason)
            .await
        {
            Ok(OutcomeDisposition::Applied)
        } else {
            Ok(OutcomeDisposition::Discarded)
        }
    }

    /// Cancel a pending or in-flight task. In-flight holders are notified
    /// best-effort in the background.
    pub async fn cancel(self: &Arc<Self>, task_id: TaskId) -> Result<Task> {
        let (task, holder) = {
            let mut task = self
                .tasks
                .get_mut(&task_id)
                .ok_or(ConvoyError::TaskNotFound(task_id))?;
            let holder = task.cancel(Utc::now())?;
            (task.clone(), holder)
        };
        info!(task_id = %task_id, holder = ?holder, "task cancelled");

        if let Some(agent_id) = holder.clone() {
            self.cancel_on_agent(agent_id, task_id);
        }
        self.finish(Transition {
            event: TaskEvent::Cancelled { task_id },
            task: task.clone(),
            release: holder,
            retry: false,
            exclude: None,
        })
        .await;
        Ok(task)
    }

    fn cancel_on_agent(&self, agent_id: AgentId, task_id: TaskId) {
        if self.errors.is_open(&agent_id) {
            debug!(task_id = %task_id, agent_id = %agent_id, "circuit open, cancel not forwarded");
            return;
        }
        let Ok(agent) = self.registry.get(&agent_id) else {
            return;
        };
        let transport = Arc::clone(&self.transport);
        let timeout = std::time::Duration::from_millis(self.errors.config().call_timeout_ms);

        tokio::spawn(async move {
            match tokio::time::timeout(timeout, transport.cancel(&agent, task_id)).await {
                Ok(Ok(())) => debug!(task_id = %task_id, agent_id = %agent.id, "cancel forwarded"),
                Ok(Err(e)) => debug!(task_id = %task_id, agent_id = %agent.id, error = %e, "cancel not delivered"),
                Err(_) => debug!(task_id = %task_id, agent_id = %agent.id, "cancel timed out"),
            }
        });
    }

    /// React to a liveness change from the health monitor
    pub async fn handle_liveness(self: &Arc<Self>, event: &LivenessEvent) {
        if event.is_liveness_lost() {
            let reason = format!("agent {} became {}", event.agent_id, event.status);
            self.reassign_from(&event.agent_id, &reason).await;
        } else if event.status == AgentStatus::Healthy {
            self.retry_pending().await;
        }
    }

    /// Take every in-flight task away from `agent_id`, consuming one attempt
    /// each, and try to place them elsewhere.
    pub async fn reassign_from(self: &Arc<Self>, agent_id: &str, reason: &str) -> usize {
        let held: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|t| t.status.is_in_flight() && t.assigned_agent_id.as_deref() == Some(agent_id))
            .map(|t| t.id)
            .collect();
        if held.is_empty() {
            return 0;
        }
        warn!(agent_id, tasks = held.len(), reason, "reassigning in-flight tasks");

        let mut moved = 0;
        for task_id in held {
            let transition = {
                let Some(mut task) = self.tasks.get_mut(&task_id) else {
                    continue;
                };
                if !task.status.is_in_flight() || task.assigned_agent_id.as_deref() != Some(agent_id) {
                    continue;
                }
                match task.fail_attempt(reason, Utc::now()) {
                    Ok(outcome) => attempt_transition(&task, agent_id, outcome, reason),
                    Err(_) => continue,
                }
            };
            self.finish(transition).await;
            moved += 1;
        }
        moved
    }

    /// Retry every pending task, oldest first
    pub async fn retry_pending(self: &Arc<Self>) -> usize {
        let pending: Vec<TaskId> = self
            .list_tasks(Some(TaskStatus::Pending))
            .into_iter()
            .map(|t| t.id)
            .collect();
        let mut placed = 0;
        for task_id in pending {
            if self.try_assign(task_id).await {
                placed += 1;
            }
        }
        if placed > 0 {
            debug!(placed, "pending tasks placed");
        }
        placed
    }

    pub async fn sweep_timeouts(self: &Arc<Self>) -> usize {
        self.sweep_timeouts_at(Utc::now()).await
    }

    /// Fail attempts that have been in flight longer than the task timeout
    pub async fn sweep_timeouts_at(self: &Arc<Self>, now: DateTime<Utc>) -> usize {
        let mut swept = 0;
        for (task_id, agent_id) in self.expired_at(now) {
            if self.expire(task_id, agent_id, now).await {
                swept += 1;
            }
        }
        swept
    }

    fn expired_at(&self, now: DateTime<Utc>) -> Vec<(TaskId, AgentId)> {
        let limit = Duration::seconds(self.config.task_timeout_secs as i64);
        self.tasks
            .iter()
            .filter(|t| t.status.is_in_flight())
            .filter(|t| t.assigned_at.map_or(false, |at| now - at >= limit))
            .filter_map(|t| t.assigned_agent_id.clone().map(|a| (t.id, a)))
            .collect()
    }

    /// Time out one attempt. The circuit is only charged if the attempt was
    /// still open when the failure applied.
    async fn expire(self: &Arc<Self>, task_id: TaskId, agent_id: AgentId, now: DateTime<Utc>) -> bool {
        let reason = format!("no outcome within {}s", self.config.task_timeout_secs);
        if !self
            .apply_failure(task_id, &agent_id, ErrorClass::Transient, reason)
            .await
        {
            debug!(task_id = %task_id, agent_id = %agent_id, "attempt settled before timeout applied");
            return false;
        }
        warn!(task_id = %task_id, agent_id = %agent_id, "task execution timed out");
        self.errors.record_outcome_at(&agent_id, false, now).await;
        self.cancel_on_agent(agent_id, task_id);
        true
    }

    pub async fn prune_terminal(&self) -> usize {
        self.prune_terminal_at(Utc::now()).await
    }

    /// Forget terminal tasks that settled more than the retention ago
    pub async fn prune_terminal_at(&self, now: DateTime<Utc>) -> usize {
        let retention = Duration::seconds(self.config.terminal_retention_secs as i64);
        let expired: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|t| t.status.is_terminal())
            .filter(|t| t.completed_at.map_or(false, |at| now - at >= retention))
            .map(|t| t.id)
            .collect();
        if expired.is_empty() {
            return 0;
        }

        for id in &expired {
            self.tasks.remove_if(id, |_, t| t.status.is_terminal());
        }
        if let Err(e) = self.store.delete_tasks(&expired).await {
            warn!(count = expired.len(), error = %e, "failed to delete pruned task records");
        }
        debug!(count = expired.len(), "pruned terminal tasks");
        expired.len()
    }

    /// Full sweep after a missed event: reassign work held by agents that
    /// are gone or no longer live, then retry everything pending.
    pub async fn reconcile(self: &Arc<Self>) {
        let mut holders: Vec<AgentId> = self
            .tasks
            .iter()
            .filter(|t| t.status.is_in_flight())
            .filter_map(|t| t.assigned_agent_id.clone())
            .collect();
        holders.sort();
        holders.dedup();

        for agent_id in holders {
            let lost = match self.registry.get(&agent_id) {
                Ok(agent) => agent.status.has_lost_liveness(),
                Err(_) => true,
            };
            if lost {
                self.reassign_from(&agent_id, "agent lost (reconciliation)")
                    .await;
            }
        }
        self.retry_pending().await;
    }

    async fn finish(self: &Arc<Self>, transition: Transition) {
        let Transition {
            task,
            event,
            release,
            retry,
            exclude,
        } = transition;

        if let Some(agent_id) = release {
            if let Err(e) = self.registry.adjust_load(&agent_id, -1).await {
                debug!(agent_id = %agent_id, error = %e, "load not released");
            }
        }
        self.persist(&task).await;

        if let TaskEvent::Failed { attempt_count, error, .. } = &event {
            warn!(task_id = %task.id, attempt_count, error = %error, "task failed");
        }
        self.emit(event);

        if retry {
            self.try_assign_excluding(task.id, exclude.as_deref()).await;
        }
    }

    fn emit(&self, event: TaskEvent) {
        let _ = self.event_tx.send(event);
    }

    async fn persist(&self, task: &Task) {
        if let Err(e) = self.store.save_task(task).await {
            warn!(task_id = %task.id, error = %e, "failed to persist task");
        }
    }
}

fn attempt_transition(task: &Task, agent_id: &str, outcome: AttemptOutcome, reason: &str) -> Transition {
    let event = match outcome {
        AttemptOutcome::Requeued => TaskEvent::Requeued {
            task_id: task.id,
            attempt_count: task.attempt_count,
            reason: reason.to_string(),
        },
        AttemptOutcome::Exhausted => TaskEvent::Failed {
            task_id: task.id,
            attempt_count: task.attempt_count,
            error: reason.to_string(),
        },
    };
    Transition {
        task: task.clone(),
        event,
        release: Some(agent_id.to_string()),
        retry: outcome == AttemptOutcome::Requeued,
        exclude: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{ChannelTransport, MemoryStore};
    use crate::coordination::CircuitBreakerConfig;
    use crate::coordinator::AgentCommand;
    use crate::domain::{AgentDescriptor, Heartbeat, ResourceEnvelope};
    use crate::persistence::MockStateStore;
    use crate::supervisor::{HealthConfig, HealthMonitor, ResourceConfig};
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Fixture {
        registry: Arc<AgentRegistry>,
        monitor: HealthMonitor,
        transport: Arc<ChannelTransport>,
        coordinator: Arc<TaskCoordinator>,
    }

    fn fixture_with_store(store: Arc<dyn StateStore>) -> Fixture {
        let registry = Arc::new(AgentRegistry::new(ResourceEnvelope::default(), store.clone()));
        let errors = Arc::new(ErrorHandler::new(CircuitBreakerConfig::default(), store.clone()));
        let resources = Arc::new(ResourceManager::new(ResourceConfig::default(), registry.clone()));
        let transport = Arc::new(ChannelTransport::new());
        let coordinator = Arc::new(TaskCoordinator::new(
            CoordinatorConfig::default(),
            registry.clone(),
            errors,
            resources,
            transport.clone(),
            store,
        ));
        let monitor = HealthMonitor::new(HealthConfig::default(), registry.clone());
        Fixture {
            registry,
            monitor,
            transport,
            coordinator,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_store(Arc::new(MemoryStore::new()))
    }

    impl Fixture {
        async fn healthy_agent(&self, id: &str, capability: &str) -> mpsc::Receiver<AgentCommand> {
            self.registry
                .register(AgentDescriptor::new(id, [capability], format!("http://{id}")))
                .await
                .unwrap();
            self.monitor
                .record_heartbeat(&Heartbeat::new(id, 0, 0))
                .await
                .unwrap();
            self.transport.connect(id, 16)
        }
    }

    async fn next_assignment(rx: &mut mpsc::Receiver<AgentCommand>) -> AssignmentEvent {
        match tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv()).await {
            Ok(Some(AgentCommand::Assignment(a))) => a,
            other => panic!("expected assignment, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_submit_without_agents_stays_pending() {
        let fx = fixture();
        let id = fx
            .coordinator
            .submit(TaskSubmission::new("analysis", json!({})))
            .await
            .unwrap();
        let task = fx.coordinator.get_status(id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.assigned_agent_id.is_none());
    }

    #[tokio::test]
    async fn test_picks_least_loaded_then_lowest_id() {
        let fx = fixture();
        let mut rx_b = fx.healthy_agent("b", "analysis").await;
        let _rx_a = fx.healthy_agent("a", "analysis").await;
        fx.registry.adjust_load("a", 2).await.unwrap();

        let id = fx
            .coordinator
            .submit(TaskSubmission::new("analysis", json!({"n": 1})))
            .await
            .unwrap();
        assert_eq!(
            fx.coordinator.get_status(id).unwrap().assigned_agent_id.as_deref(),
            Some("b")
        );
        assert_eq!(next_assignment(&mut rx_b).await.task_id, id);
        assert_eq!(fx.registry.get("b").unwrap().current_load, 1);
    }

    #[tokio::test]
    async fn test_first_terminal_outcome_wins() {
        let fx = fixture();
        let mut rx = fx.healthy_agent("a1", "analysis").await;
        let id = fx
            .coordinator
            .submit(TaskSubmission::new("analysis", json!({})))
            .await
            .unwrap();
        next_assignment(&mut rx).await;

        let first = fx
            .coordinator
            .handle_outcome(OutcomeReport::success(id, "a1", Some(json!({"ok": true}))))
            .await
            .unwrap();
        let second = fx
            .coordinator
            .handle_outcome(OutcomeReport::failure(id, "a1", ErrorClass::Fatal, "late"))
            .await
            .unwrap();

        assert_eq!(first, OutcomeDisposition::Applied);
        assert_eq!(second, OutcomeDisposition::Discarded);
        let task = fx.coordinator.get_status(id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result, Some(json!({"ok": true})));
        assert_eq!(fx.registry.get("a1").unwrap().current_load, 0);
    }

    #[tokio::test]
    async fn test_outcome_from_stranger_is_discarded() {
        let fx = fixture();
        let mut rx = fx.healthy_agent("a1", "analysis").await;
        let id = fx
            .coordinator
            .submit(TaskSubmission::new("analysis", json!({})))
            .await
            .unwrap();
        next_assignment(&mut rx).await;

        let disposition = fx
            .coordinator
            .handle_outcome(OutcomeReport::success(id, "intruder", None))
            .await
            .unwrap();
        assert_eq!(disposition, OutcomeDisposition::Discarded);
        assert!(fx.coordinator.get_status(id).unwrap().status.is_in_flight());
    }

    #[tokio::test]
    async fn test_fatal_outcome_fails_without_retry() {
        let fx = fixture();
        let mut rx = fx.healthy_agent("a1", "analysis").await;
        let id = fx
            .coordinator
            .submit(TaskSubmission::new("analysis", json!({})).with_max_attempts(3))
            .await
            .unwrap();
        next_assignment(&mut rx).await;

        fx.coordinator
            .handle_outcome(OutcomeReport::failure(id, "a1", ErrorClass::Fatal, "bad payload"))
            .await
            .unwrap();

        let task = fx.coordinator.get_status(id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempt_count, 1);
        assert!(fx.coordinator.errors.state("a1").is_none());
    }

    #[tokio::test]
    async fn test_resource_exhausted_requeues_without_attempt() {
        let fx = fixture();
        let mut rx1 = fx.healthy_agent("a1", "analysis").await;
        let mut rx2 = fx.healthy_agent("a2", "analysis").await;
        let mut scale_rx = fx.coordinator.resources.subscribe();
        let id = fx
            .coordinator
            .submit(TaskSubmission::new("analysis", json!({})))
            .await
            .unwrap();
        next_assignment(&mut rx1).await;

        fx.coordinator
            .handle_outcome(OutcomeReport::failure(
                id,
                "a1",
                ErrorClass::ResourceExhausted,
                "oom",
            ))
            .await
            .unwrap();

        let task = fx.coordinator.get_status(id).unwrap();
        assert_eq!(task.attempt_count, 0);
        assert_eq!(task.assigned_agent_id.as_deref(), Some("a2"));
        assert_eq!(next_assignment(&mut rx2).await.task_id, id);
        assert_eq!(scale_rx.recv().await.unwrap().agent_id, "a1");
    }

    #[tokio::test]
    async fn test_cancel_pending_and_terminal() {
        let fx = fixture();
        let id = fx
            .coordinator
            .submit(TaskSubmission::new("analysis", json!({})))
            .await
            .unwrap();

        let task = fx.coordinator.cancel(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(matches!(
            fx.coordinator.cancel(id).await,
            Err(ConvoyError::TaskAlreadyTerminal { .. })
        ));
        assert!(matches!(
            fx.coordinator.cancel(uuid::Uuid::new_v4()).await,
            Err(ConvoyError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_running_notifies_agent() {
        let fx = fixture();
        let mut rx = fx.healthy_agent("a1", "analysis").await;
        let id = fx
            .coordinator
            .submit(TaskSubmission::new("analysis", json!({})))
            .await
            .unwrap();
        next_assignment(&mut rx).await;

        fx.coordinator.cancel(id).await.unwrap();
        assert_eq!(fx.registry.get("a1").unwrap().current_load, 0);
        let cmd = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cmd, AgentCommand::Cancel { task_id: id });
    }

    #[tokio::test]
    async fn test_timeout_sweep_consumes_attempt() {
        let fx = fixture();
        let mut rx = fx.healthy_agent("a1", "analysis").await;
        let id = fx
            .coordinator
            .submit(TaskSubmission::new("analysis", json!({})).with_max_attempts(1))
            .await
            .unwrap();
        next_assignment(&mut rx).await;

        let later = Utc::now() + Duration::seconds(301);
        assert_eq!(fx.coordinator.sweep_timeouts_at(later).await, 1);
        let task = fx.coordinator.get_status(id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_timeout_losing_to_success_does_not_charge_circuit() {
        let fx = fixture();
        let mut rx = fx.healthy_agent("a1", "analysis").await;
        let id = fx
            .coordinator
            .submit(TaskSubmission::new("analysis", json!({})))
            .await
            .unwrap();
        next_assignment(&mut rx).await;

        let later = Utc::now() + Duration::seconds(301);
        let expired = fx.coordinator.expired_at(later);
        assert_eq!(expired.len(), 1);

        fx.coordinator
            .handle_outcome(OutcomeReport::success(id, "a1", None))
            .await
            .unwrap();
        for (task_id, agent_id) in expired {
            assert!(!fx.coordinator.expire(task_id, agent_id, later).await);
        }

        assert_eq!(fx.coordinator.get_status(id).unwrap().status, TaskStatus::Completed);
        let failures = fx
            .coordinator
            .errors
            .state("a1")
            .map_or(0, |cb| cb.recent_failures.len());
        assert_eq!(failures, 0);
    }

    #[tokio::test]
    async fn test_prune_forgets_settled_tasks_after_retention() {
        let store = Arc::new(MemoryStore::new());
        let fx = fixture_with_store(store.clone());
        let kept = fx
            .coordinator
            .submit(TaskSubmission::new("analysis", json!({})))
            .await
            .unwrap();
        let settled = fx
            .coordinator
            .submit(TaskSubmission::new("analysis", json!({})))
            .await
            .unwrap();
        fx.coordinator.cancel(settled).await.unwrap();

        let now = Utc::now();
        assert_eq!(fx.coordinator.prune_terminal_at(now).await, 0);
        assert_eq!(
            fx.coordinator.prune_terminal_at(now + Duration::seconds(3601)).await,
            1
        );

        assert!(matches!(
            fx.coordinator.get_status(settled),
            Err(ConvoyError::TaskNotFound(_))
        ));
        assert_eq!(fx.coordinator.get_status(kept).unwrap().status, TaskStatus::Pending);
        let stored = store.load_tasks().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, kept);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_submissions() {
        let fx = fixture();
        fx.coordinator.stop_accepting();
        assert!(matches!(
            fx.coordinator
                .submit(TaskSubmission::new("analysis", json!({})))
                .await,
            Err(ConvoyError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_store_failure_does_not_fail_submission() {
        let mut store = MockStateStore::new();
        store
            .expect_save_task()
            .returning(|_| Err(ConvoyError::Internal("database down".into())));
        let fx = fixture_with_store(Arc::new(store));

        let id = fx
            .coordinator
            .submit(TaskSubmission::new("analysis", json!({})))
            .await
            .unwrap();
        assert_eq!(fx.coordinator.get_status(id).unwrap().status, TaskStatus::Pending);
    }
}
