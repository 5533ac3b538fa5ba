//! Persistent transport over a single WebSocket.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::{
    ClientIdentity, ClientShared, Handler, HandlerId, Transport, TransportError, TransportKind,
    TransportOptions,
};
use crate::presence::RoomKey;
use crate::proto::{room_event_name, room_payload, Envelope, ServerMessage};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);

pub struct SocketTransport {
    shared: Arc<ClientShared>,
    outgoing: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SocketTransport {
    /// Open the socket and start the session loop. The first connection
    /// attempt must succeed; later drops are retried with backoff.
    pub async fn connect(
        url: &str,
        identity: ClientIdentity,
        options: TransportOptions,
    ) -> Result<Self, TransportError> {
        let (socket, _) = connect_async(url).await?;
        let shared = Arc::new(ClientShared::new(options.dedup_window));
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        shared.spawn_sweeper(cancel.clone());

        let session = Session {
            url: url.to_string(),
            identity,
            options,
            shared: shared.clone(),
            outgoing: outgoing_rx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(session.run(socket));

        Ok(Self {
            shared,
            outgoing,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Persistent
    }

    fn connection_id(&self) -> Option<String> {
        self.shared.connection_id()
    }

    async fn emit(&self, event: &str, data: Value) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.outgoing
            .send(frame(event, data))
            .map_err(|_| TransportError::Closed)
    }

    fn on(&self, event: &str, handler: Handler) -> HandlerId {
        self.shared.on(event, handler)
    }

    fn off(&self, event: &str, id: HandlerId) -> bool {
        self.shared.off(event, id)
    }

    async fn join(&self, room: RoomKey) -> Result<(), TransportError> {
        self.shared.add_room(room.clone());
        self.emit(room_event_name(room.family, true), room_payload(&room)).await
    }

    async fn leave(&self, room: RoomKey) -> Result<(), TransportError> {
        self.shared.remove_room(&room);
        self.emit(room_event_name(room.family, false), room_payload(&room)).await
    }

    async fn disconnect(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }
}

/// Why one socket session ended.
enum SessionEnd {
    Cancelled,
    Dropped,
}

struct Session {
    url: String,
    identity: ClientIdentity,
    options: TransportOptions,
    shared: Arc<ClientShared>,
    outgoing: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
}

impl Session {
    async fn run(mut self, first: Socket) {
        let mut socket = Some(first);
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if let Some(ws) = socket.take() {
                backoff = INITIAL_BACKOFF;
                match self.drive(ws).await {
                    SessionEnd::Cancelled => break,
                    SessionEnd::Dropped => {
                        tracing::info!(url = %self.url, "Socket dropped, reconnecting");
                    }
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            match connect_async(self.url.as_str()).await {
                Ok((ws, _)) => socket = Some(ws),
                Err(e) => {
                    tracing::debug!(url = %self.url, error = %e, "Reconnect failed");
                    backoff = (backoff * 2).min(self.options.max_backoff);
                }
            }
        }
        self.shared.set_connection_id(None);
        tracing::debug!(url = %self.url, "Socket session stopped");
    }

    /// Register, re-join remembered rooms, then pump frames until the socket
    /// drops or the transport is cancelled.
    async fn drive(&mut self, ws: Socket) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();

        let mut hello = vec![frame("register", self.identity.register_payload())];
        for room in self.shared.rooms() {
            hello.push(frame(room_event_name(room.family, true), room_payload(&room)));
        }
        for text in hello {
            if sink.send(Message::Text(text.into())).await.is_err() {
                return SessionEnd::Dropped;
            }
        }

        let mut heartbeat = tokio::time::interval(self.options.heartbeat_interval);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Cancelled;
                }
                Some(text) = self.outgoing.recv() => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        return SessionEnd::Dropped;
                    }
                }
                _ = heartbeat.tick() => {
                    if sink.send(Message::Text(frame("heartbeat", Value::Null).into())).await.is_err() {
                        return SessionEnd::Dropped;
                    }
                }
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerMessage>(text.as_str()) {
                            Ok(message) => {
                                self.shared.deliver(message);
                            }
                            Err(e) => tracing::debug!(error = %e, "Undecodable server frame"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::Dropped,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "Socket read error");
                        return SessionEnd::Dropped;
                    }
                }
            }
        }
    }
}

fn frame(event: &str, data: Value) -> String {
    serde_json::to_string(&Envelope::new(event, data)).unwrap_or_default()
}
