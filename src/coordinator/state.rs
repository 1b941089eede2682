//! Fleet-wide snapshot for dashboards

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::coordinator::TaskCoordinator;
use crate::coordination::ErrorHandler;
use crate::registry::AgentRegistry;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetSnapshot {
    pub agents_total: usize,
    pub agents_by_status: BTreeMap<String, usize>,
    pub tasks_by_status: BTreeMap<String, usize>,
    /// Circuits not fully closed
    pub open_circuits: usize,
    pub accepting_submissions: bool,
    pub at: DateTime<Utc>,
}

impl FleetSnapshot {
    pub fn collect(
        registry: &AgentRegistry,
        tasks: &TaskCoordinator,
        errors: &ErrorHandler,
    ) -> Self {
        let agents = registry.list(None, None);
        let mut agents_by_status = BTreeMap::new();
        for agent in &agents {
            *agents_by_status
                .entry(agent.status.as_str().to_string())
                .or_default() += 1;
        }

        let tasks_by_status = tasks
            .count_by_status()
            .into_iter()
            .map(|(status, count)| (status.as_str().to_string(), count))
            .collect();

        Self {
            agents_total: agents.len(),
            agents_by_status,
            tasks_by_status,
            open_circuits: errors.open_count(),
            accepting_submissions: tasks.is_accepting(),
            at: Utc::now(),
        }
    }
}
