use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};

use crate::api::{handlers, state::AppState, websocket::websocket_handler};

pub fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Agent endpoints
        .route(
            "/api/agents",
            get(handlers::list_agents).post(handlers::register_agent),
        )
        .route(
            "/api/agents/:id",
            get(handlers::get_agent).delete(handlers::deregister_agent),
        )
        .route("/api/agents/:id/envelope", get(handlers::get_envelope))
        // Inbound event endpoints
        .route("/api/heartbeats", post(handlers::post_heartbeat))
        .route("/api/outcomes", post(handlers::post_outcome))
        // Task endpoints
        .route(
            "/api/tasks",
            get(handlers::list_tasks).post(handlers::submit_task),
        )
        .route(
            "/api/tasks/:id",
            get(handlers::get_task).delete(handlers::cancel_task),
        )
        // System endpoints
        .route("/api/circuits/:key", get(handlers::get_circuit))
        .route("/api/fleet", get(handlers::get_fleet))
        .route("/health", get(handlers::health_handler))
        // WebSocket endpoint
        .route("/ws", get(websocket_handler))
        // Add state and CORS
        .with_state(state)
        .layer(cors)
}
