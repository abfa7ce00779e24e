//! Presence lookup endpoint.

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use crate::error::{ApiError, ApiErrorBody};
use crate::gateway::presence::PresenceStatus;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/users/{user_id}/presence", get(get_presence))
}

// ---------------------------------------------------------------------------
// GET /api/v1/users/{user_id}/presence
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, ToSchema)]
pub struct PresenceResponse {
    pub user_id: String,
    pub status: PresenceStatus,
    pub last_active: Option<DateTime<Utc>>,
    /// Open connections across all gateway instances.
    pub connections: u64,
}

#[utoipa::path(
    get,
    path = "/api/v1/users/{user_id}/presence",
    tag = "Presence",
    params(
        ("user_id" = String, Path, description = "User ID"),
    ),
    responses(
        (status = 200, description = "Current presence", body = PresenceResponse),
        (status = 503, description = "Shared store unavailable", body = ApiErrorBody),
    ),
)]
pub async fn get_presence(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<PresenceResponse>, ApiError> {
    let record = state.presence.get_status(&user_id).await?;
    let connections = state.registry.count_connections(&user_id).await?;

    Ok(Json(PresenceResponse {
        user_id,
        status: record.status,
        last_active: record.last_active,
        connections,
    }))
}
