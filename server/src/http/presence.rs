use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::presence::{FreezeScope, RoomFamily, RoomKey};
use crate::proto::SystemState;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ScopeQuery {
    pub scope: Option<String>,
}

/// GET /presence/count
pub async fn presence_count(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let count = state
        .coordinator
        .presence_count()
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    Ok(Json(json!({ "count": count })))
}

/// GET /freeze-state?scope=<competition_id>
pub async fn freeze_state(
    State(state): State<AppState>,
    Query(query): Query<ScopeQuery>,
) -> Result<Json<Value>, StatusCode> {
    let scope = FreezeScope::from(query.scope);
    let system = state
        .coordinator
        .system_state(scope)
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    Ok(Json(json!({
        "frozen": system.frozen,
        "global_frozen": system.global_frozen,
        "scope": system.scope,
        "timestamp": Utc::now(),
    })))
}

/// GET /room/{family}/{id}/count
///
/// Singleton families ignore the id segment.
pub async fn room_count(
    State(state): State<AppState>,
    Path((family, id)): Path<(String, String)>,
) -> Result<Json<Value>, StatusCode> {
    let family: RoomFamily = family.parse().map_err(|_| StatusCode::NOT_FOUND)?;
    let room = RoomKey::new(family, id);
    let count = state
        .coordinator
        .room_count(room.clone())
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    Ok(Json(json!({
        "family": room.family,
        "room_id": room.id,
        "count": count,
    })))
}

/// GET /status
///
/// Reachable during maintenance so monitors can watch the switch.
pub async fn status(State(state): State<AppState>) -> Result<Json<SystemState>, StatusCode> {
    state
        .coordinator
        .system_state(FreezeScope::Global)
        .await
        .map(Json)
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}

/// GET /health
pub async fn health_check() -> &'static str {
    "ok"
}
