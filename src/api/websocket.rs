use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use chrono::Utc;
use futures_util::{sink::SinkExt, stream::StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::api::state::AppState;
use crate::api::types::WsMessage;

/// WebSocket handler streaming coordinator events as JSON
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    // Subscribe to broadcast channel
    let mut rx = state.ws_tx.subscribe();

    // Spawn a task to forward broadcast messages to this WebSocket
    let send_task = tokio::spawn(async move {
        loop {
            let msg = match rx.recv().await {
                Ok(msg) => msg,
                Err(RecvError::Lagged(missed)) => WsMessage::Lagged {
                    missed,
                    at: Utc::now(),
                },
                Err(RecvError::Closed) => break,
            };
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to serialize WebSocket message: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    // Handle incoming messages (ping/pong) in the main task
    while let Some(Ok(msg)) = receiver.next().await {
        if let Message::Close(_) = msg {
            break;
        }
    }

    // Abort the send task when connection closes
    send_task.abort();

    info!("WebSocket connection closed");
}

/// Fan every coordinator event stream into the WebSocket channel
pub fn spawn_event_forwarder(
    state: &AppState,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    let mut liveness = state.coordinator.subscribe_liveness();
    let mut scale = state.coordinator.subscribe_scale();
    let mut circuits = state.coordinator.subscribe_circuits();
    let mut tasks = state.coordinator.subscribe_tasks();
    let ws_tx = state.ws_tx.clone();

    tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                Ok(e) = liveness.recv() => WsMessage::Liveness(e),
                Ok(e) = scale.recv() => WsMessage::Scale(e),
                Ok(e) = circuits.recv() => WsMessage::Circuit(e),
                Ok(e) = tasks.recv() => WsMessage::Task(e),
                _ = shutdown_rx.recv() => break,
            };
            // No subscribers is fine
            let _ = ws_tx.send(msg);
        }
        debug!("event forwarder exited");
    })
}
