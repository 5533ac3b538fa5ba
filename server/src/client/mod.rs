//! Client-side transports.
//!
//! Callers talk to the coordinator through [`Transport`] and never learn
//! which variant they hold: [`SocketTransport`] keeps one WebSocket open,
//! [`PollingTransport`] emulates the same event stream with periodic HTTP
//! requests. Both re-register and re-join their rooms after losing the
//! server, and both filter incoming events through [`ClientShared`].
//!
//! ```rust,ignore
//! let transport = client::connect(
//!     TransportKind::Polling,
//!     "http://127.0.0.1:1990",
//!     ClientIdentity::named("alice"),
//!     TransportOptions::default(),
//! )
//! .await?;
//! transport.on("team_update", Arc::new(|msg| println!("{msg:?}")));
//! transport.join(RoomKey::team("T1")).await?;
//! ```

pub mod handlers;
pub mod polling;
pub mod socket;

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::config::PresenceConfig;
use crate::presence::RoomKey;

pub use handlers::{ClientShared, Handler, HandlerId};
pub use polling::PollingTransport;
pub use socket::SocketTransport;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid server url `{0}`")]
    InvalidUrl(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server answered {0}")]
    Status(reqwest::StatusCode),
    #[error("transport is closed")]
    Closed,
}

/// Which implementation [`connect`] builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Persistent,
    Polling,
}

/// Who the client registers as. No display name means anonymous.
#[derive(Debug, Clone, Default)]
pub struct ClientIdentity {
    pub display_name: Option<String>,
    pub tab_id: Option<String>,
}

impl ClientIdentity {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn named(display_name: impl Into<String>) -> Self {
        Self {
            display_name: Some(display_name.into()),
            tab_id: None,
        }
    }

    #[must_use]
    pub fn with_tab(mut self, tab_id: impl Into<String>) -> Self {
        self.tab_id = Some(tab_id.into());
        self
    }

    pub(crate) fn register_payload(&self) -> Value {
        serde_json::json!({
            "display_name": self.display_name,
            "tab_id": self.tab_id,
        })
    }
}

/// Client timers.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub heartbeat_interval: Duration,
    pub poll_interval: Duration,
    /// Upper bound of the reconnect backoff.
    pub max_backoff: Duration,
    pub dedup_window: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            poll_interval: Duration::from_millis(2000),
            max_backoff: Duration::from_secs(10),
            dedup_window: Duration::from_secs(600),
        }
    }
}

impl From<&PresenceConfig> for TransportOptions {
    fn from(config: &PresenceConfig) -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            dedup_window: Duration::from_secs(config.dedup_window_secs),
            ..Self::default()
        }
    }
}

/// The capability set both transports share.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Server-assigned id of the current connection, once known.
    fn connection_id(&self) -> Option<String>;

    /// Send one event envelope to the coordinator.
    async fn emit(&self, event: &str, data: Value) -> Result<(), TransportError>;

    /// Register a callback for an event name.
    fn on(&self, event: &str, handler: Handler) -> HandlerId;

    fn off(&self, event: &str, id: HandlerId) -> bool;

    /// Join a room and keep it joined across reconnects.
    async fn join(&self, room: RoomKey) -> Result<(), TransportError>;

    async fn leave(&self, room: RoomKey) -> Result<(), TransportError>;

    /// Stop all timers and close the connection.
    async fn disconnect(&self);
}

/// Open a transport of the given kind against `base_url` (`http://host:port`).
pub async fn connect(
    kind: TransportKind,
    base_url: &str,
    identity: ClientIdentity,
    options: TransportOptions,
) -> Result<Box<dyn Transport>, TransportError> {
    let transport: Box<dyn Transport> = match kind {
        TransportKind::Persistent => {
            Box::new(SocketTransport::connect(&socket_url(base_url)?, identity, options).await?)
        }
        TransportKind::Polling => {
            Box::new(PollingTransport::connect(base_url, identity, options).await?)
        }
    };
    Ok(transport)
}

/// `http://host:port` -> `ws://host:port/ws`
pub fn socket_url(base_url: &str) -> Result<String, TransportError> {
    let base = base_url.trim_end_matches('/');
    if let Some(rest) = base.strip_prefix("https://") {
        Ok(format!("wss://{rest}/ws"))
    } else if let Some(rest) = base.strip_prefix("http://") {
        Ok(format!("ws://{rest}/ws"))
    } else {
        Err(TransportError::InvalidUrl(base_url.to_string()))
    }
}
