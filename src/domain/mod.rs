//! Core records: agents, tasks and the events between components

pub mod agent;
pub mod events;
pub mod task;

pub use agent::{
    Agent, AgentDescriptor, AgentId, AgentStatus, ResourceEnvelope, GIB, MEMORY_CEILING,
    MEMORY_FLOOR, MIB,
};
pub use events::{
    AssignmentEvent, CircuitEvent, Heartbeat, HeartbeatRecord, LivenessEvent, RegistryEvent,
    ScaleDirection, ScaleDirective, TaskEvent,
};
pub use task::{
    AttemptOutcome, ErrorClass, OutcomeReport, Task, TaskId, TaskStatus, TaskSubmission,
};
