use axum::{body::Bytes, extract::State, http::StatusCode, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::presence::FreezeScope;
use crate::proto::{DomainEvent, Envelope};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Freeze,
    Unfreeze,
    Disable,
    Enable,
    Publish,
}

#[derive(Debug, Deserialize)]
pub struct ControlRequest {
    pub token: String,
    pub action: ControlAction,
    #[serde(default)]
    pub scope: Option<String>,
    /// Domain event to relay, for `publish`.
    #[serde(default)]
    pub event: Option<Envelope>,
}

/// POST /control
///
/// Every failure (control disabled, bad token, malformed body) answers a
/// bare 404 so the endpoint does not reveal itself.
pub async fn control(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>, StatusCode> {
    if !state.control.is_configured() {
        return Err(StatusCode::NOT_FOUND);
    }
    let request: ControlRequest =
        serde_json::from_slice(&body).map_err(|_| StatusCode::NOT_FOUND)?;
    if !state.control.authorize(&request.token) {
        tracing::warn!("Control request with invalid token");
        return Err(StatusCode::NOT_FOUND);
    }

    let scope = FreezeScope::from(request.scope);
    let coordinator = &state.coordinator;
    let sent = match request.action {
        ControlAction::Freeze => coordinator.set_frozen(scope.clone(), true),
        ControlAction::Unfreeze => coordinator.set_frozen(scope.clone(), false),
        ControlAction::Disable => coordinator.set_enabled(false),
        ControlAction::Enable => coordinator.set_enabled(true),
        ControlAction::Publish => {
            let envelope = request.event.ok_or(StatusCode::NOT_FOUND)?;
            let event = DomainEvent::from_parts(&envelope.event, envelope.data)
                .map_err(|_| StatusCode::NOT_FOUND)?;
            coordinator.publish(event)
        }
    };
    sent.map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;

    tracing::info!(action = ?request.action, scope = %scope, "Control action applied");
    Ok(Json(json!({ "ok": true })))
}
