use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use super::{error_response, ApiResult};
use crate::api::{state::AppState, types::*};
use crate::domain::{OutcomeReport, Task, TaskStatus, TaskSubmission};

/// POST /api/tasks
pub async fn submit_task(
    State(state): State<AppState>,
    Json(submission): Json<TaskSubmission>,
) -> ApiResult<(StatusCode, Json<SubmitTaskResponse>)> {
    let task_id = state
        .coordinator
        .submit(submission)
        .await
        .map_err(error_response)?;
    let status = state
        .coordinator
        .get_status(task_id)
        .map(|t| t.status)
        .unwrap_or(TaskStatus::Pending);
    Ok((StatusCode::CREATED, Json(SubmitTaskResponse { task_id, status })))
}

/// GET /api/tasks/:id
pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> ApiResult<Json<Task>> {
    state
        .coordinator
        .get_status(task_id)
        .map(Json)
        .map_err(error_response)
}

/// DELETE /api/tasks/:id
pub async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> ApiResult<Json<Task>> {
    state
        .coordinator
        .cancel(task_id)
        .await
        .map(Json)
        .map_err(error_response)
}

/// GET /api/tasks?status=
pub async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListTasksQuery>,
) -> ApiResult<Json<Vec<Task>>> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<TaskStatus>)
        .transpose()
        .map_err(error_response)?;
    Ok(Json(state.coordinator.list_tasks(status)))
}

/// POST /api/outcomes
pub async fn post_outcome(
    State(state): State<AppState>,
    Json(report): Json<OutcomeReport>,
) -> ApiResult<(StatusCode, Json<AcceptedResponse>)> {
    state
        .coordinator
        .report_outcome(report)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::ACCEPTED, Json(AcceptedResponse { accepted: true })))
}
