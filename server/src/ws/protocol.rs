use crate::coordinator::CoordinatorError;
use crate::proto::{ClientMessage, ProtocolError};
use crate::state::AppState;

/// Decode a text frame and hand it to the coordinator. Undecodable frames
/// are logged and dropped; the connection stays open.
pub fn handle_text_message(text: &str, state: &AppState, connection_id: &str) {
    let message = match ClientMessage::decode(text) {
        Ok(message) => message,
        Err(e) => {
            log_rejected(connection_id, &e);
            return;
        }
    };
    if let Err(e) = forward_client_message(state, connection_id, message) {
        tracing::warn!(connection_id = %connection_id, error = %e, "Coordinator unavailable");
    }
}

/// Route a decoded client message. Privileged control frames are checked
/// against the control token here and silently dropped when unauthorized.
pub fn forward_client_message(
    state: &AppState,
    connection_id: &str,
    message: ClientMessage,
) -> Result<(), CoordinatorError> {
    match message {
        ClientMessage::AdminFreezeControl(control) => {
            if !state.control.authorize(&control.token) {
                tracing::warn!(
                    connection_id = %connection_id,
                    "Unauthorized freeze control ignored"
                );
                return Ok(());
            }
            tracing::info!(
                connection_id = %connection_id,
                scope = %control.scope,
                frozen = control.frozen,
                "Freeze control accepted"
            );
            state.coordinator.set_frozen(control.scope, control.frozen)
        }
        other => state.coordinator.client_message(connection_id, other),
    }
}

pub fn log_rejected(connection_id: &str, error: &ProtocolError) {
    tracing::warn!(
        connection_id = %connection_id,
        error = %error,
        "Rejected client frame"
    );
}
