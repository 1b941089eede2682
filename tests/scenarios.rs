//! End-to-end coordination scenarios driven through the public component API

use async_trait::async_trait;
use chrono::{Duration, Utc};
use convoy::adapters::{ChannelTransport, MemoryStore};
use convoy::coordination::{CircuitBreakerConfig, CircuitState, ErrorHandler, Permit};
use convoy::coordinator::{AgentCommand, AgentTransport, CoordinatorConfig, TaskCoordinator};
use convoy::domain::{
    Agent, AgentDescriptor, AgentStatus, AssignmentEvent, ErrorClass, Heartbeat, OutcomeReport,
    ResourceEnvelope, ScaleDirection, TaskId, TaskStatus, TaskSubmission, GIB, MEMORY_CEILING,
    MEMORY_FLOOR,
};
use convoy::error::DispatchError;
use convoy::persistence::StateStore;
use convoy::registry::AgentRegistry;
use convoy::supervisor::{HealthConfig, HealthMonitor, ResourceConfig, ResourceManager};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

const WAIT: std::time::Duration = std::time::Duration::from_secs(2);

struct Fleet {
    registry: Arc<AgentRegistry>,
    health: HealthMonitor,
    errors: Arc<ErrorHandler>,
    resources: Arc<ResourceManager>,
    coordinator: Arc<TaskCoordinator>,
}

fn fleet(transport: Arc<dyn AgentTransport>) -> Fleet {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
    let registry = Arc::new(AgentRegistry::new(ResourceEnvelope::default(), store.clone()));
    let errors = Arc::new(ErrorHandler::new(CircuitBreakerConfig::default(), store.clone()));
    let resources = Arc::new(ResourceManager::new(ResourceConfig::default(), registry.clone()));
    let coordinator = Arc::new(TaskCoordinator::new(
        CoordinatorConfig::default(),
        registry.clone(),
        errors.clone(),
        resources.clone(),
        transport,
        store,
    ));
    let health = HealthMonitor::new(HealthConfig::default(), registry.clone());
    Fleet {
        registry,
        health,
        errors,
        resources,
        coordinator,
    }
}

impl Fleet {
    async fn join(&self, id: &str, capability: &str) {
        self.registry
            .register(AgentDescriptor::new(id, [capability], format!("http://{id}:9000")))
            .await
            .unwrap();
        self.health
            .record_heartbeat(&Heartbeat::new(id, 0, 0))
            .await
            .unwrap();
        assert_eq!(self.registry.get(id).unwrap().status, AgentStatus::Healthy);
    }

    async fn wait_for(&self, task_id: TaskId, status: TaskStatus) {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            if self.coordinator.get_status(task_id).unwrap().status == status {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "task {task_id} never reached {status}, last seen {:?}",
                    self.coordinator.get_status(task_id).unwrap()
                );
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }
}

async fn next_assignment(rx: &mut mpsc::Receiver<AgentCommand>) -> AssignmentEvent {
    match tokio::time::timeout(WAIT, rx.recv()).await {
        Ok(Some(AgentCommand::Assignment(a))) => a,
        other => panic!("expected assignment, got {other:?}"),
    }
}

/// Transport whose agents never accept a delivery
#[derive(Default)]
struct FailingTransport {
    deliveries: AtomicUsize,
    out_of_memory: bool,
}

impl FailingTransport {
    fn out_of_memory() -> Self {
        Self {
            out_of_memory: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl AgentTransport for FailingTransport {
    async fn deliver(&self, _agent: &Agent, _assignment: &AssignmentEvent) -> Result<(), DispatchError> {
        self.deliveries.fetch_add(1, Ordering::SeqCst);
        if self.out_of_memory {
            return Err(DispatchError::ResourceExhausted("insufficient storage".into()));
        }
        Err(DispatchError::Server { status: 503 })
    }

    async fn cancel(&self, _agent: &Agent, _task_id: TaskId) -> Result<(), DispatchError> {
        Ok(())
    }
}

#[tokio::test]
async fn scenario_a_single_healthy_agent_gets_exactly_one_assignment() {
    let transport = Arc::new(ChannelTransport::new());
    let fleet = fleet(transport.clone());
    let mut inbox = transport.connect("a1", 8);
    fleet.join("a1", "analysis").await;

    let task_id = fleet
        .coordinator
        .submit(TaskSubmission::new("analysis", json!({"symbol": "BTC"})))
        .await
        .unwrap();

    let task = fleet.coordinator.get_status(task_id).unwrap();
    assert!(task.status.is_in_flight());
    assert_eq!(task.assigned_agent_id.as_deref(), Some("a1"));

    let assignment = next_assignment(&mut inbox).await;
    assert_eq!(assignment.task_id, task_id);
    assert_eq!(assignment.attempt, 1);
    assert_eq!(assignment.payload, json!({"symbol": "BTC"}));

    fleet.wait_for(task_id, TaskStatus::Running).await;
    assert!(inbox.try_recv().is_err());
}

#[tokio::test]
async fn scenario_b_missed_heartbeats_requeue_running_tasks() {
    let transport = Arc::new(ChannelTransport::new());
    let fleet = fleet(transport.clone());
    let mut inbox = transport.connect("a1", 8);
    fleet.join("a1", "analysis").await;

    let t0 = Utc::now();
    fleet
        .health
        .record_heartbeat_at(&Heartbeat::new("a1", 0, 0).at(t0), t0)
        .await
        .unwrap();

    let mut ids = Vec::new();
    for n in 0..2 {
        let id = fleet
            .coordinator
            .submit(TaskSubmission::new("analysis", json!({ "n": n })))
            .await
            .unwrap();
        next_assignment(&mut inbox).await;
        fleet.wait_for(id, TaskStatus::Running).await;
        ids.push(id);
    }
    assert_eq!(fleet.registry.get("a1").unwrap().current_load, 2);

    // Within one interval of the third miss nothing has been taken away
    let events = fleet.health.evaluate_at(t0 + Duration::seconds(14)).await;
    assert!(events.iter().all(|e| !e.is_liveness_lost()));

    let events = fleet.health.evaluate_at(t0 + Duration::seconds(15)).await;
    let lost = events
        .iter()
        .find(|e| e.agent_id == "a1")
        .expect("liveness event for a1");
    assert_eq!(lost.status, AgentStatus::Unhealthy);
    fleet.coordinator.handle_liveness(lost).await;

    for id in ids {
        let task = fleet.coordinator.get_status(id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempt_count, 1);
        assert!(task.assigned_agent_id.is_none());
    }
    assert_eq!(fleet.registry.get("a1").unwrap().current_load, 0);
    assert!(fleet
        .coordinator
        .list_tasks(None)
        .iter()
        .all(|t| !t.status.is_in_flight()));
}

#[tokio::test]
async fn scenario_b_recovered_agent_picks_pending_work_back_up() {
    let transport = Arc::new(ChannelTransport::new());
    let fleet = fleet(transport.clone());
    let mut inbox = transport.connect("a1", 8);
    fleet.join("a1", "analysis").await;

    let t0 = Utc::now();
    fleet
        .health
        .record_heartbeat_at(&Heartbeat::new("a1", 0, 0).at(t0), t0)
        .await
        .unwrap();
    let id = fleet
        .coordinator
        .submit(TaskSubmission::new("analysis", json!({})))
        .await
        .unwrap();
    next_assignment(&mut inbox).await;

    for event in fleet.health.evaluate_at(t0 + Duration::seconds(20)).await {
        fleet.coordinator.handle_liveness(&event).await;
    }
    assert_eq!(fleet.coordinator.get_status(id).unwrap().status, TaskStatus::Pending);

    let t1 = t0 + Duration::seconds(21);
    fleet
        .health
        .record_heartbeat_at(&Heartbeat::new("a1", 0, 0).at(t1), t1)
        .await
        .unwrap();
    assert_eq!(fleet.registry.get("a1").unwrap().status, AgentStatus::Healthy);
    assert_eq!(fleet.coordinator.retry_pending().await, 1);

    let assignment = next_assignment(&mut inbox).await;
    assert_eq!(assignment.task_id, id);
    assert_eq!(assignment.attempt, 2);
}

#[tokio::test]
async fn scenario_c_circuit_opens_then_admits_one_probe() {
    let errors = ErrorHandler::new(CircuitBreakerConfig::default(), Arc::new(MemoryStore::new()));
    let t0 = Utc::now();

    for _ in 0..5 {
        assert_eq!(errors.try_acquire_at("a1", t0).await, Permit::Allowed);
        errors.record_outcome_at("a1", false, t0).await;
    }
    assert!(errors.is_open_at("a1", t0));
    assert!(errors.is_open_at("a1", t0 + Duration::seconds(29)));
    assert_eq!(
        errors.try_acquire_at("a1", t0 + Duration::seconds(29)).await,
        Permit::Denied
    );

    let t1 = t0 + Duration::seconds(30);
    assert_eq!(errors.try_acquire_at("a1", t1).await, Permit::Probe);
    assert_eq!(errors.try_acquire_at("a1", t1).await, Permit::Denied);
    assert_eq!(errors.state("a1").unwrap().state, CircuitState::HalfOpen);

    errors.record_outcome_at("a1", true, t1).await;
    assert_eq!(errors.state("a1").unwrap().state, CircuitState::Closed);
    assert_eq!(errors.try_acquire_at("a1", t1).await, Permit::Allowed);
    assert_eq!(errors.try_acquire_at("a1", t1).await, Permit::Allowed);
}

#[tokio::test]
async fn scenario_c_failing_dispatches_open_the_circuit_and_park_the_task() {
    let transport = Arc::new(FailingTransport::default());
    let fleet = fleet(transport.clone());
    fleet.join("a1", "analysis").await;

    let id = fleet
        .coordinator
        .submit(TaskSubmission::new("analysis", json!({})).with_max_attempts(10))
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + WAIT;
    while !fleet.errors.is_open("a1") {
        assert!(tokio::time::Instant::now() < deadline, "circuit never opened");
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    fleet.wait_for(id, TaskStatus::Pending).await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert_eq!(transport.deliveries.load(Ordering::SeqCst), 5);
    let task = fleet.coordinator.get_status(id).unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempt_count, 5);
    assert!(!fleet.coordinator.try_assign(id).await);
}

#[tokio::test]
async fn scenario_d_always_failing_agent_exhausts_exactly_max_attempts() {
    let transport = Arc::new(ChannelTransport::new());
    let fleet = fleet(transport.clone());
    let mut inbox = transport.connect("a1", 8);
    fleet.join("a1", "analysis").await;
    let mut events = fleet.coordinator.subscribe();

    let id = fleet
        .coordinator
        .submit(TaskSubmission::new("analysis", json!({})).with_max_attempts(2))
        .await
        .unwrap();

    for attempt in 1..=2 {
        let assignment = next_assignment(&mut inbox).await;
        assert_eq!(assignment.attempt, attempt);
        fleet.wait_for(id, TaskStatus::Running).await;
        fleet
            .coordinator
            .handle_outcome(OutcomeReport::failure(id, "a1", ErrorClass::Transient, "boom"))
            .await
            .unwrap();
    }

    let task = fleet.coordinator.get_status(id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempt_count, 2);
    assert!(task.attempt_count <= task.max_attempts);

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(inbox.try_recv().is_err());

    let mut failed = 0;
    while let Ok(event) = events.try_recv() {
        if event.task_id() == id && event.status() == TaskStatus::Failed {
            failed += 1;
        }
    }
    assert_eq!(failed, 1);
}

#[tokio::test]
async fn scenario_d_failing_deliveries_stop_at_max_attempts() {
    let transport = Arc::new(FailingTransport::default());
    let fleet = fleet(transport.clone());
    fleet.join("a1", "analysis").await;

    let id = fleet
        .coordinator
        .submit(TaskSubmission::new("analysis", json!({})).with_max_attempts(2))
        .await
        .unwrap();

    fleet.wait_for(id, TaskStatus::Failed).await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(transport.deliveries.load(Ordering::SeqCst), 2);
    assert_eq!(fleet.coordinator.get_status(id).unwrap().attempt_count, 2);
    assert!(!fleet.errors.is_open("a1"));
}

#[tokio::test]
async fn scenario_e_sustained_memory_pressure_scales_up() {
    let transport = Arc::new(ChannelTransport::new());
    let fleet = fleet(transport);
    fleet.join("a1", "analysis").await;
    let mut directives = fleet.resources.subscribe();

    let high = (GIB as f64 * 0.85) as u64;
    let now = Utc::now();
    assert!(fleet
        .resources
        .on_load_sample_at("a1", 1, high, now)
        .await
        .unwrap()
        .is_none());
    let directive = fleet
        .resources
        .on_load_sample_at("a1", 1, high, now + Duration::seconds(5))
        .await
        .unwrap()
        .expect("scale up directive");

    assert_eq!(directive.direction, ScaleDirection::Up);
    assert_eq!(directive.memory_max, GIB + GIB / 2);
    assert_eq!(directives.recv().await.unwrap(), directive);
    assert_eq!(
        fleet.registry.get("a1").unwrap().resource_envelope.memory_max,
        GIB + GIB / 2
    );
}

#[tokio::test]
async fn scenario_e_scale_up_never_exceeds_ceiling() {
    let transport = Arc::new(ChannelTransport::new());
    let fleet = fleet(transport);
    fleet.join("a1", "analysis").await;
    let near_cap = 7 * GIB;
    fleet
        .registry
        .update_envelope(
            "a1",
            ResourceEnvelope::bounded(MEMORY_FLOOR, near_cap, MEMORY_FLOOR, MEMORY_CEILING),
        )
        .await
        .unwrap();

    let high = (near_cap as f64 * 0.9) as u64;
    fleet.resources.on_load_sample("a1", 1, high).await.unwrap();
    let directive = fleet
        .resources
        .on_load_sample("a1", 1, high)
        .await
        .unwrap()
        .expect("scale up directive");
    assert_eq!(directive.memory_max, MEMORY_CEILING);
}

#[tokio::test]
async fn reregistration_keeps_load_and_single_entry() {
    let transport = Arc::new(ChannelTransport::new());
    let fleet = fleet(transport.clone());
    let mut inbox = transport.connect("a1", 8);
    fleet.join("a1", "analysis").await;

    fleet
        .coordinator
        .submit(TaskSubmission::new("analysis", json!({})))
        .await
        .unwrap();
    next_assignment(&mut inbox).await;

    fleet
        .registry
        .register(AgentDescriptor::new("a1", ["analysis", "report"], "http://a1:9001"))
        .await
        .unwrap();

    let agent = fleet.registry.get("a1").unwrap();
    assert_eq!(fleet.registry.len(), 1);
    assert_eq!(agent.current_load, 1);
    assert_eq!(agent.endpoint, "http://a1:9001");
    assert!(agent.has_capability("report"));
}

#[tokio::test]
async fn late_success_from_previous_holder_completes_task() {
    let transport = Arc::new(ChannelTransport::new());
    let fleet = fleet(transport.clone());
    let mut inbox1 = transport.connect("a1", 8);
    let mut inbox2 = transport.connect("a2", 8);
    fleet.join("a1", "analysis").await;

    let id = fleet
        .coordinator
        .submit(TaskSubmission::new("analysis", json!({})))
        .await
        .unwrap();
    next_assignment(&mut inbox1).await;

    fleet.join("a2", "analysis").await;
    fleet.coordinator.reassign_from("a1", "operator drain").await;
    assert_eq!(next_assignment(&mut inbox2).await.task_id, id);

    fleet
        .coordinator
        .handle_outcome(OutcomeReport::success(id, "a1", Some(json!({"late": true}))))
        .await
        .unwrap();

    let task = fleet.coordinator.get_status(id).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(fleet.registry.get("a2").unwrap().current_load, 0);
    match tokio::time::timeout(WAIT, inbox2.recv()).await {
        Ok(Some(AgentCommand::Cancel { task_id })) => assert_eq!(task_id, id),
        other => panic!("expected cancel on a2, got {other:?}"),
    }
}

#[tokio::test]
async fn memory_exhausted_delivery_waits_instead_of_redispatching() {
    let transport = Arc::new(FailingTransport::out_of_memory());
    let fleet = fleet(transport.clone());
    fleet.join("a1", "analysis").await;
    let mut scale_rx = fleet.resources.subscribe();

    let task_id = fleet
        .coordinator
        .submit(TaskSubmission::new("analysis", json!({})).with_max_attempts(2))
        .await
        .unwrap();
    fleet.wait_for(task_id, TaskStatus::Pending).await;
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    assert_eq!(transport.deliveries.load(Ordering::SeqCst), 1);
    let task = fleet.coordinator.get_status(task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempt_count, 0);
    assert!(!fleet.errors.is_open("a1"));

    let directive = scale_rx.recv().await.unwrap();
    assert_eq!(directive.agent_id, "a1");
    assert_eq!(directive.direction, ScaleDirection::Up);
    assert_eq!(directive.memory_max, GIB + GIB / 2);
}
