//! Polling transport: the socket event stream emulated over HTTP.
//!
//! `emit` posts one envelope. A background loop drains the connection's
//! server-side mailbox every `poll_interval` and sends a heartbeat every
//! `heartbeat_interval`; the heartbeat reply carries the online count, which
//! is fed through the same count filter as pushed `presence_count` events.
//! When the server answers 404 the connection was reaped, so the transport
//! connects again and re-joins its rooms.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{
    ClientIdentity, ClientShared, Handler, HandlerId, Transport, TransportError, TransportKind,
    TransportOptions,
};
use crate::http::poll::{ConnectResponse, HeartbeatResponse, PollResponse};
use crate::presence::RoomKey;
use crate::proto::{room_event_name, room_payload, Envelope, ServerMessage};

pub struct PollingTransport {
    inner: Arc<Inner>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    http: reqwest::Client,
    base_url: String,
    identity: ClientIdentity,
    shared: Arc<ClientShared>,
    /// Serializes reconnects so concurrent 404s open only one connection.
    reconnect: Mutex<()>,
}

impl PollingTransport {
    pub async fn connect(
        base_url: &str,
        identity: ClientIdentity,
        options: TransportOptions,
    ) -> Result<Self, TransportError> {
        let inner = Arc::new(Inner {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            identity,
            shared: Arc::new(ClientShared::new(options.dedup_window)),
            reconnect: Mutex::new(()),
        });
        inner.open().await?;

        let cancel = CancellationToken::new();
        inner.shared.spawn_sweeper(cancel.clone());
        let task = tokio::spawn(run_timers(inner.clone(), options, cancel.clone()));
        Ok(Self {
            inner,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }
}

impl Inner {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn current(&self) -> Result<String, TransportError> {
        self.shared.connection_id().ok_or(TransportError::Closed)
    }

    /// Open a new server-side connection and re-join remembered rooms.
    async fn open(&self) -> Result<String, TransportError> {
        let response = self
            .http
            .post(self.url("/poll/connect"))
            .json(&self.identity.register_payload())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TransportError::Status(response.status()));
        }
        let ConnectResponse { connection_id } = response.json().await?;
        self.shared.set_connection_id(Some(connection_id.clone()));
        tracing::debug!(connection_id = %connection_id, "Polling connection opened");

        for room in self.shared.rooms() {
            self.post_emit(&connection_id, room_event_name(room.family, true), room_payload(&room))
                .await?;
        }
        Ok(connection_id)
    }

    /// Reconnect after `stale` was reported gone, unless another task
    /// already replaced it.
    async fn reopen(&self, stale: &str) -> Result<String, TransportError> {
        let _guard = self.reconnect.lock().await;
        match self.shared.connection_id() {
            Some(current) if current != stale => Ok(current),
            _ => {
                tracing::info!(connection_id = %stale, "Polling connection lost, reconnecting");
                self.open().await
            }
        }
    }

    async fn post_emit(
        &self,
        connection_id: &str,
        event: &str,
        data: Value,
    ) -> Result<StatusCode, TransportError> {
        let response = self
            .http
            .post(self.url(&format!("/poll/{connection_id}/emit")))
            .json(&Envelope::new(event, data))
            .send()
            .await?;
        Ok(response.status())
    }

    async fn emit(&self, event: &str, data: Value) -> Result<(), TransportError> {
        let connection_id = self.current()?;
        let mut status = self.post_emit(&connection_id, event, data.clone()).await?;
        if status == StatusCode::NOT_FOUND {
            let fresh = self.reopen(&connection_id).await?;
            status = self.post_emit(&fresh, event, data).await?;
        }
        if status.is_success() {
            Ok(())
        } else {
            Err(TransportError::Status(status))
        }
    }

    async fn poll_once(&self) -> Result<(), TransportError> {
        let connection_id = self.current()?;
        let response = self
            .http
            .get(self.url(&format!("/poll/{connection_id}")))
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => {
                self.reopen(&connection_id).await?;
            }
            status if status.is_success() => {
                let PollResponse { events } = response.json().await?;
                for event in events {
                    self.shared.deliver(event);
                }
            }
            status => return Err(TransportError::Status(status)),
        }
        Ok(())
    }

    async fn heartbeat_once(&self) -> Result<(), TransportError> {
        let connection_id = self.current()?;
        let response = self
            .http
            .post(self.url(&format!("/poll/{connection_id}/heartbeat")))
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => {
                self.reopen(&connection_id).await?;
            }
            status if status.is_success() => {
                let HeartbeatResponse { presence_count } = response.json().await?;
                self.shared.deliver(ServerMessage::PresenceCount {
                    count: presence_count,
                });
            }
            status => return Err(TransportError::Status(status)),
        }
        Ok(())
    }

    async fn close(&self) {
        let Some(connection_id) = self.shared.connection_id() else {
            return;
        };
        let _ = self
            .http
            .post(self.url(&format!("/poll/{connection_id}/disconnect")))
            .send()
            .await;
        self.shared.set_connection_id(None);
    }
}

async fn run_timers(inner: Arc<Inner>, options: TransportOptions, cancel: CancellationToken) {
    let mut poll = tokio::time::interval(options.poll_interval);
    let mut heartbeat = tokio::time::interval(options.heartbeat_interval);
    heartbeat.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = poll.tick() => {
                if let Err(e) = inner.poll_once().await {
                    tracing::debug!(error = %e, "Poll failed");
                }
            }
            _ = heartbeat.tick() => {
                if let Err(e) = inner.heartbeat_once().await {
                    tracing::debug!(error = %e, "Heartbeat failed");
                }
            }
        }
    }
    tracing::debug!("Polling timers stopped");
}

#[async_trait]
impl Transport for PollingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Polling
    }

    fn connection_id(&self) -> Option<String> {
        self.inner.shared.connection_id()
    }

    async fn emit(&self, event: &str, data: Value) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.inner.emit(event, data).await
    }

    fn on(&self, event: &str, handler: Handler) -> HandlerId {
        self.inner.shared.on(event, handler)
    }

    fn off(&self, event: &str, id: HandlerId) -> bool {
        self.inner.shared.off(event, id)
    }

    async fn join(&self, room: RoomKey) -> Result<(), TransportError> {
        self.inner.shared.add_room(room.clone());
        self.emit(room_event_name(room.family, true), room_payload(&room)).await
    }

    async fn leave(&self, room: RoomKey) -> Result<(), TransportError> {
        self.inner.shared.remove_room(&room);
        self.emit(room_event_name(room.family, false), room_payload(&room)).await
    }

    /// Cancels the timers before telling the server, so no poll races the
    /// disconnect and reopens the connection.
    async fn disconnect(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
        self.inner.close().await;
    }
}
