//! Server half of the polling transport.
//!
//! A polling connection is attached to the coordinator exactly like a
//! WebSocket, except that its outbound queue is parked in a mailbox and
//! drained by `GET /poll/{id}` instead of being written to a socket.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::coordinator::CoordinatorHandle;
use crate::presence::ConnectionId;
use crate::proto::{ClientMessage, Envelope, ServerMessage};
use crate::state::AppState;
use crate::ws::protocol;

type Inbox = mpsc::UnboundedReceiver<Arc<ServerMessage>>;

/// Outcome of draining a mailbox.
#[derive(Debug)]
pub enum Drained {
    Events(Vec<Arc<ServerMessage>>),
    /// The coordinator dropped the connection and nothing is left to read.
    Closed,
}

pub struct Mailbox {
    inbox: Mutex<Inbox>,
    last_seen: Mutex<Instant>,
}

impl Mailbox {
    fn new(inbox: Inbox) -> Self {
        Self {
            inbox: Mutex::new(inbox),
            last_seen: Mutex::new(Instant::now()),
        }
    }

    async fn touch(&self) {
        *self.last_seen.lock().await = Instant::now();
    }

    async fn drain(&self) -> Drained {
        self.touch().await;
        let mut inbox = self.inbox.lock().await;
        let mut events = Vec::new();
        loop {
            match inbox.try_recv() {
                Ok(event) => events.push(event),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    if events.is_empty() {
                        return Drained::Closed;
                    }
                    break;
                }
            }
        }
        Drained::Events(events)
    }
}

/// Mailboxes of every live polling connection.
#[derive(Clone, Default)]
pub struct Mailboxes {
    inner: Arc<DashMap<ConnectionId, Arc<Mailbox>>>,
}

impl Mailboxes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, connection_id: &str, inbox: Inbox) {
        self.inner
            .insert(connection_id.to_string(), Arc::new(Mailbox::new(inbox)));
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<Mailbox>> {
        self.inner.get(connection_id).map(|m| m.value().clone())
    }

    pub fn remove(&self, connection_id: &str) -> bool {
        self.inner.remove(connection_id).is_some()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Drop mailboxes nobody polled within `stale_after`. Returns their ids.
    pub async fn sweep(&self, stale_after: Duration) -> Vec<ConnectionId> {
        let snapshot: Vec<(ConnectionId, Arc<Mailbox>)> = self
            .inner
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let mut removed = Vec::new();
        for (connection_id, mailbox) in snapshot {
            let idle = mailbox.last_seen.lock().await.elapsed();
            if idle > stale_after && self.remove(&connection_id) {
                removed.push(connection_id);
            }
        }
        removed
    }
}

/// Periodically detach polling connections whose client went away without
/// saying so.
pub fn spawn_mailbox_sweeper(
    mailboxes: Mailboxes,
    coordinator: CoordinatorHandle,
    stale_after: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let period = (stale_after / 2).max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = mailboxes.sweep(stale_after).await;
                    for connection_id in &removed {
                        let _ = coordinator.detach(connection_id);
                    }
                    if !removed.is_empty() {
                        tracing::info!(removed = removed.len(), "Swept idle polling mailboxes");
                    }
                }
            }
        }
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct ConnectRequest {
    pub display_name: Option<String>,
    pub tab_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub connection_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PollResponse {
    pub events: Vec<ServerMessage>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub presence_count: usize,
}

/// POST /poll/connect
pub async fn connect(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<ConnectResponse>, StatusCode> {
    let request: ConnectRequest = if body.is_empty() {
        ConnectRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|_| StatusCode::BAD_REQUEST)?
    };
    let connection_id = uuid::Uuid::now_v7().to_string();
    let (tx, rx) = mpsc::unbounded_channel();

    state.mailboxes.insert(&connection_id, rx);
    let registered = state.coordinator.attach(&connection_id, tx).and_then(|_| {
        state.coordinator.client_message(
            &connection_id,
            ClientMessage::Register {
                display_name: request.display_name,
                tab_id: request.tab_id,
            },
        )
    });
    // The round trip returns once the registration above has been applied.
    let applied = match registered {
        Ok(()) => state.coordinator.touch(&connection_id).await.ok(),
        Err(_) => None,
    };
    if applied.is_none() {
        state.mailboxes.remove(&connection_id);
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    tracing::info!(connection_id = %connection_id, "Polling connection opened");
    Ok(Json(ConnectResponse { connection_id }))
}

/// GET /poll/{id}
pub async fn poll(
    State(state): State<AppState>,
    Path(connection_id): Path<String>,
) -> Result<Json<PollResponse>, StatusCode> {
    let mailbox = state.mailboxes.get(&connection_id).ok_or(StatusCode::NOT_FOUND)?;
    match mailbox.drain().await {
        Drained::Events(events) => Ok(Json(PollResponse {
            events: events.iter().map(|e| e.as_ref().clone()).collect(),
        })),
        Drained::Closed => {
            state.mailboxes.remove(&connection_id);
            tracing::debug!(connection_id = %connection_id, "Polling connection gone");
            Err(StatusCode::NOT_FOUND)
        }
    }
}

/// POST /poll/{id}/emit
pub async fn emit(
    State(state): State<AppState>,
    Path(connection_id): Path<String>,
    Json(envelope): Json<Envelope>,
) -> StatusCode {
    let Some(mailbox) = state.mailboxes.get(&connection_id) else {
        return StatusCode::NOT_FOUND;
    };
    mailbox.touch().await;
    let message = match ClientMessage::from_envelope(envelope) {
        Ok(message) => message,
        Err(e) => {
            protocol::log_rejected(&connection_id, &e);
            return StatusCode::BAD_REQUEST;
        }
    };
    match protocol::forward_client_message(&state, &connection_id, message) {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// POST /poll/{id}/heartbeat
pub async fn heartbeat(
    State(state): State<AppState>,
    Path(connection_id): Path<String>,
) -> Result<Json<HeartbeatResponse>, StatusCode> {
    let mailbox = state.mailboxes.get(&connection_id).ok_or(StatusCode::NOT_FOUND)?;
    mailbox.touch().await;
    match state.coordinator.touch(&connection_id).await {
        Ok(Some(presence_count)) => Ok(Json(HeartbeatResponse { presence_count })),
        Ok(None) => {
            state.mailboxes.remove(&connection_id);
            Err(StatusCode::NOT_FOUND)
        }
        Err(_) => Err(StatusCode::SERVICE_UNAVAILABLE),
    }
}

/// POST /poll/{id}/disconnect
pub async fn disconnect(
    State(state): State<AppState>,
    Path(connection_id): Path<String>,
) -> StatusCode {
    if !state.mailboxes.remove(&connection_id) {
        return StatusCode::NOT_FOUND;
    }
    let _ = state.coordinator.detach(&connection_id);
    tracing::info!(connection_id = %connection_id, "Polling connection closed");
    StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_drain_returns_queued_events_then_closed() {
        let mailboxes = Mailboxes::new();
        let (tx, rx) = mpsc::unbounded_channel();
        mailboxes.insert("c1", rx);
        tx.send(Arc::new(ServerMessage::PresenceCount { count: 2 })).unwrap();
        tx.send(Arc::new(ServerMessage::PresenceCount { count: 3 })).unwrap();

        let mailbox = mailboxes.get("c1").unwrap();
        match mailbox.drain().await {
            Drained::Events(events) => assert_eq!(events.len(), 2),
            Drained::Closed => panic!("mailbox closed early"),
        }
        match mailbox.drain().await {
            Drained::Events(events) => assert!(events.is_empty()),
            Drained::Closed => panic!("mailbox closed early"),
        }

        drop(tx);
        assert!(matches!(mailbox.drain().await, Drained::Closed));
    }

    #[tokio::test]
    async fn test_sweep_removes_idle_mailboxes() {
        let mailboxes = Mailboxes::new();
        let (_tx, rx) = mpsc::unbounded_channel();
        mailboxes.insert("idle", rx);

        assert!(mailboxes.sweep(Duration::from_secs(60)).await.is_empty());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mailboxes.sweep(Duration::from_millis(5)).await, vec!["idle".to_string()]);
        assert!(mailboxes.is_empty());
    }
}
