use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};

use super::{error_response, ApiResult};
use crate::api::{state::AppState, types::*};
use crate::domain::{Agent, AgentDescriptor, AgentStatus, Heartbeat};

/// POST /api/agents
pub async fn register_agent(
    State(state): State<AppState>,
    Json(descriptor): Json<AgentDescriptor>,
) -> ApiResult<(StatusCode, Json<RegisterAgentResponse>)> {
    let agent_id = state
        .coordinator
        .register_agent(descriptor)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(RegisterAgentResponse { agent_id })))
}

/// DELETE /api/agents/:id
pub async fn deregister_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> ApiResult<StatusCode> {
    state
        .coordinator
        .deregister_agent(&agent_id)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/agents/:id
pub async fn get_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> ApiResult<Json<Agent>> {
    state
        .coordinator
        .get_agent(&agent_id)
        .map(Json)
        .map_err(error_response)
}

/// GET /api/agents?capability=&status=
pub async fn list_agents(
    State(state): State<AppState>,
    Query(query): Query<ListAgentsQuery>,
) -> ApiResult<Json<Vec<Agent>>> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<AgentStatus>)
        .transpose()
        .map_err(error_response)?;
    Ok(Json(
        state
            .coordinator
            .list_agents(query.capability.as_deref(), status),
    ))
}

/// GET /api/agents/:id/envelope
pub async fn get_envelope(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> ApiResult<Json<EnvelopeResponse>> {
    let envelope = state
        .coordinator
        .recommend_envelope(&agent_id)
        .map_err(error_response)?;
    Ok(Json(EnvelopeResponse {
        agent_id,
        memory_min: envelope.memory_min,
        memory_max: envelope.memory_max,
    }))
}

/// POST /api/heartbeats
pub async fn post_heartbeat(
    State(state): State<AppState>,
    Json(heartbeat): Json<Heartbeat>,
) -> ApiResult<(StatusCode, Json<AcceptedResponse>)> {
    state
        .coordinator
        .send_heartbeat(heartbeat)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::ACCEPTED, Json(AcceptedResponse { accepted: true })))
}
