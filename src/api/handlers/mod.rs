use axum::{http::StatusCode, Json};

use crate::api::types::ErrorResponse;
use crate::error::ConvoyError;

pub mod agents;
pub mod system;
pub mod tasks;

pub use agents::*;
pub use system::*;
pub use tasks::*;

pub type ApiResult<T> = std::result::Result<T, (StatusCode, Json<ErrorResponse>)>;

/// Map a coordinator error onto an HTTP status
pub fn error_response(e: ConvoyError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &e {
        ConvoyError::AgentNotFound(_) | ConvoyError::TaskNotFound(_) => StatusCode::NOT_FOUND,
        ConvoyError::Validation(_) => StatusCode::BAD_REQUEST,
        ConvoyError::TaskAlreadyTerminal { .. } | ConvoyError::InvalidStateTransition { .. } => {
            StatusCode::CONFLICT
        }
        ConvoyError::ShuttingDown | ConvoyError::CircuitOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
}
