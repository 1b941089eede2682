use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use super::{error_response, ApiResult};
use crate::api::{state::AppState, types::*};
use crate::coordination::CircuitBreakerState;
use crate::coordinator::FleetSnapshot;
use crate::error::ConvoyError;

/// GET /health -- lightweight liveness/readiness probe
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let snapshot = state.coordinator.fleet_snapshot();
    Json(HealthResponse {
        status: if snapshot.accepting_submissions {
            "ok".to_string()
        } else {
            "draining".to_string()
        },
        agents: snapshot.agents_total,
        accepting_submissions: snapshot.accepting_submissions,
        uptime_secs: state.uptime_seconds(),
    })
}

/// GET /api/fleet
pub async fn get_fleet(State(state): State<AppState>) -> Json<FleetSnapshot> {
    Json(state.coordinator.fleet_snapshot())
}

/// GET /api/circuits/:key
pub async fn get_circuit(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Json<CircuitBreakerState>> {
    state.coordinator.circuit_state(&key).map(Json).ok_or_else(|| {
        let (_, body) = error_response(ConvoyError::Validation(format!(
            "no circuit recorded for {}",
            key
        )));
        (StatusCode::NOT_FOUND, body)
    })
}
