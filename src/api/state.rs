use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::api::types::WsMessage;
use crate::coordinator::CoordinatorHandle;

/// Shared application state for API handlers
#[derive(Clone)]
pub struct AppState {
    pub coordinator: CoordinatorHandle,

    /// WebSocket broadcast channel
    pub ws_tx: broadcast::Sender<WsMessage>,

    /// Application start time
    pub start_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(coordinator: CoordinatorHandle) -> Self {
        let (ws_tx, _) = broadcast::channel(1024);
        Self {
            coordinator,
            ws_tx,
            start_time: Utc::now(),
        }
    }

    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.start_time).num_seconds()
    }
}
