use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::Response,
};

use crate::state::AppState;
use crate::ws::actor;

/// GET /ws
/// WebSocket upgrade endpoint. Each upgraded socket gets a fresh connection
/// id and its own actor. Maintenance mode is enforced by the router layer.
pub async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let connection_id = uuid::Uuid::now_v7().to_string();
    tracing::debug!(connection_id = %connection_id, "WebSocket upgrade");
    ws.on_upgrade(move |socket| actor::run_connection(socket, state, connection_id))
}
