use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};

use crate::proto::{ClientMessage, ServerMessage};
use crate::state::AppState;
use crate::ws::protocol;

/// Ping interval: server sends WebSocket ping every 30 seconds.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Pong timeout: if pong not received within 10 seconds after ping, close.
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Run the actor-per-connection pattern for an upgraded WebSocket.
///
/// Splits the WebSocket into reader and writer halves:
/// - Writer task: owns the sink, forwards coordinator events and control
///   frames (ping/pong/close) to the client
/// - Reader loop: decodes incoming frames and forwards them to the coordinator
///
/// The coordinator holds the sender of this connection's outbox. When it
/// drops that sender (reaped, shutdown) the writer closes the socket.
pub async fn run_connection(socket: WebSocket, state: AppState, connection_id: String) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel::<Arc<ServerMessage>>();
    let (control_tx, control_rx) = mpsc::unbounded_channel::<Message>();

    if state.coordinator.attach(&connection_id, outbox_tx).is_err() {
        tracing::warn!(connection_id = %connection_id, "Coordinator stopped, refusing connection");
        return;
    }

    tracing::info!(connection_id = %connection_id, "WebSocket actor started");

    let mut writer_handle = tokio::spawn(writer_task(ws_sender, outbox_rx, control_rx));

    // Track pong reception
    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<()>();

    let ping_tx = control_tx.clone();
    let ping_handle = tokio::spawn(async move {
        let mut ping_timer = interval(PING_INTERVAL);
        // Skip the first immediate tick
        ping_timer.tick().await;

        loop {
            ping_timer.tick().await;

            if ping_tx.send(Message::Ping(vec![1, 2, 3, 4].into())).is_err() {
                break;
            }

            match timeout(PONG_TIMEOUT, pong_rx.recv()).await {
                Ok(Some(())) => {}
                _ => {
                    tracing::warn!("Pong timeout, closing connection");
                    let _ = ping_tx.send(Message::Close(Some(CloseFrame {
                        code: 1001,
                        reason: "Pong timeout".into(),
                    })));
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            _ = &mut writer_handle => {
                tracing::info!(connection_id = %connection_id, "Outbound side closed");
                break;
            }
            frame = ws_receiver.next() => match frame {
                Some(Ok(msg)) => match msg {
                    Message::Text(text) => {
                        protocol::handle_text_message(text.as_str(), &state, &connection_id);
                    }
                    Message::Binary(_) => {
                        tracing::debug!(connection_id = %connection_id, "Ignoring binary frame");
                    }
                    Message::Pong(_) => {
                        let _ = pong_tx.send(());
                        let _ = state
                            .coordinator
                            .client_message(&connection_id, ClientMessage::Heartbeat);
                    }
                    Message::Ping(data) => {
                        let _ = control_tx.send(Message::Pong(data));
                    }
                    Message::Close(frame) => {
                        tracing::info!(
                            connection_id = %connection_id,
                            reason = ?frame,
                            "Client initiated close"
                        );
                        break;
                    }
                },
                Some(Err(e)) => {
                    tracing::warn!(
                        connection_id = %connection_id,
                        error = %e,
                        "WebSocket receive error"
                    );
                    break;
                }
                None => {
                    tracing::info!(connection_id = %connection_id, "WebSocket stream ended");
                    break;
                }
            }
        }
    }

    writer_handle.abort();
    ping_handle.abort();

    let _ = state.coordinator.detach(&connection_id);

    tracing::info!(connection_id = %connection_id, "WebSocket actor stopped");
}

/// Writer task: serializes coordinator events and forwards control frames to
/// the WebSocket sink. Ends when the outbox closes or the socket breaks.
async fn writer_task(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut outbox: mpsc::UnboundedReceiver<Arc<ServerMessage>>,
    mut control: mpsc::UnboundedReceiver<Message>,
) {
    loop {
        let msg = tokio::select! {
            event = outbox.recv() => match event {
                Some(event) => Message::Text(event.to_json().into()),
                None => {
                    let _ = ws_sender
                        .send(Message::Close(Some(CloseFrame {
                            code: 1000,
                            reason: "Session closed".into(),
                        })))
                        .await;
                    break;
                }
            },
            Some(frame) = control.recv() => frame,
        };
        let closing = matches!(msg, Message::Close(_));
        if ws_sender.send(msg).await.is_err() || closing {
            break;
        }
    }
}
