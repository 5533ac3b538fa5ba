use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::json;

use crate::state::AppState;

/// Paths that stay reachable while the platform is disabled.
const ALWAYS_OPEN: &[&str] = &["/health", "/status", "/control"];

/// Answer ordinary traffic with 503 while maintenance mode is on.
pub async fn maintenance_gate(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    if state.coordinator.is_enabled() || ALWAYS_OPEN.contains(&req.uri().path()) {
        return next.run(req).await;
    }
    tracing::debug!(path = %req.uri().path(), "Request refused during maintenance");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({
            "error": "maintenance",
            "message": "The platform is temporarily unavailable for maintenance.",
            "timestamp": Utc::now(),
        })),
    )
        .into_response()
}
