//! The presence coordinator: a single sequential actor owning the registry,
//! rooms, replay buffers and freeze state.
//!
//! Handlers and background tasks never touch that state directly. They send
//! a [`Command`] through a [`CoordinatorHandle`]; the actor applies commands
//! strictly one at a time, so no two mutations ever interleave. Queries carry
//! a oneshot sender for the reply.

pub mod actor;
pub mod dispatch;
pub mod reaper;

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::PresenceConfig;
use crate::dedup::DedupTracker;
use crate::presence::{ConnectionId, FreezeScope, RoomKey};
use crate::proto::{ClientMessage, DomainEvent, ServerMessage, SystemState};

pub use actor::Coordinator;
pub use reaper::spawn_reaper;

/// Sender half of a connection's outbound queue. The transport that owns the
/// connection drains the receiver.
pub type ConnectionSender = mpsc::UnboundedSender<Arc<ServerMessage>>;

/// Commands applied by the coordinator actor.
pub enum Command {
    /// A transport connection opened; record where to deliver its events.
    Attach {
        connection_id: ConnectionId,
        sender: ConnectionSender,
    },
    /// A transport connection closed: unregister it and leave all rooms.
    Detach { connection_id: ConnectionId },
    /// A decoded, non-privileged client frame.
    Client {
        connection_id: ConnectionId,
        message: ClientMessage,
    },
    /// A domain event from a collaborator.
    Publish(DomainEvent),
    SetFrozen { scope: FreezeScope, frozen: bool },
    SetEnabled(bool),
    PresenceCount(oneshot::Sender<usize>),
    RoomCount {
        room: RoomKey,
        reply: oneshot::Sender<usize>,
    },
    /// Heartbeat that reports the online count, or `None` when the
    /// connection is no longer registered.
    Touch {
        connection_id: ConnectionId,
        reply: oneshot::Sender<Option<usize>>,
    },
    SystemState {
        scope: FreezeScope,
        reply: oneshot::Sender<SystemState>,
    },
    Reap,
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("coordinator is not running")]
    Stopped,
    #[error("coordinator dropped the reply")]
    NoReply,
}

/// Tunables for the coordinator's in-memory state.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub stale_after: Duration,
    pub recent_capacity: usize,
    pub replay_window: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(300),
            recent_capacity: 100,
            replay_window: Duration::from_secs(3600),
        }
    }
}

impl From<&PresenceConfig> for CoordinatorSettings {
    fn from(config: &PresenceConfig) -> Self {
        Self {
            stale_after: Duration::from_secs(config.stale_after_secs),
            recent_capacity: config.recent_capacity,
            replay_window: Duration::from_secs(config.replay_window_secs),
        }
    }
}

/// Cloneable entry point to the coordinator actor.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<Command>,
    availability: watch::Receiver<bool>,
}

impl CoordinatorHandle {
    pub fn send(&self, command: Command) -> Result<(), CoordinatorError> {
        self.tx.send(command).map_err(|_| CoordinatorError::Stopped)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply))?;
        rx.await.map_err(|_| CoordinatorError::NoReply)
    }

    pub fn attach(&self, connection_id: &str, sender: ConnectionSender) -> Result<(), CoordinatorError> {
        self.send(Command::Attach {
            connection_id: connection_id.to_string(),
            sender,
        })
    }

    pub fn detach(&self, connection_id: &str) -> Result<(), CoordinatorError> {
        self.send(Command::Detach {
            connection_id: connection_id.to_string(),
        })
    }

    pub fn client_message(
        &self,
        connection_id: &str,
        message: ClientMessage,
    ) -> Result<(), CoordinatorError> {
        self.send(Command::Client {
            connection_id: connection_id.to_string(),
            message,
        })
    }

    pub fn publish(&self, event: DomainEvent) -> Result<(), CoordinatorError> {
        self.send(Command::Publish(event))
    }

    pub fn set_frozen(&self, scope: FreezeScope, frozen: bool) -> Result<(), CoordinatorError> {
        self.send(Command::SetFrozen { scope, frozen })
    }

    pub fn set_enabled(&self, enabled: bool) -> Result<(), CoordinatorError> {
        self.send(Command::SetEnabled(enabled))
    }

    pub async fn presence_count(&self) -> Result<usize, CoordinatorError> {
        self.request(Command::PresenceCount).await
    }

    pub async fn room_count(&self, room: RoomKey) -> Result<usize, CoordinatorError> {
        self.request(|reply| Command::RoomCount { room, reply }).await
    }

    pub async fn touch(&self, connection_id: &str) -> Result<Option<usize>, CoordinatorError> {
        let connection_id = connection_id.to_string();
        self.request(|reply| Command::Touch {
            connection_id,
            reply,
        })
        .await
    }

    pub async fn system_state(&self, scope: FreezeScope) -> Result<SystemState, CoordinatorError> {
        self.request(|reply| Command::SystemState { scope, reply }).await
    }

    /// Whether the platform currently accepts ordinary traffic.
    pub fn is_enabled(&self) -> bool {
        *self.availability.borrow()
    }
}

/// Start the coordinator actor. It runs until `cancel` fires or every handle
/// is dropped.
pub fn spawn(
    settings: CoordinatorSettings,
    dedup: DedupTracker,
    cancel: CancellationToken,
) -> (CoordinatorHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let coordinator = Coordinator::new(&settings, dedup);
    let handle = CoordinatorHandle {
        tx,
        availability: coordinator.availability(),
    };
    let task = tokio::spawn(run_coordinator(coordinator, rx, cancel));
    (handle, task)
}

async fn run_coordinator(
    mut coordinator: Coordinator,
    mut rx: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
) {
    tracing::info!("Presence coordinator started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Presence coordinator shutting down");
                break;
            }
            command = rx.recv() => match command {
                Some(command) => coordinator.handle(command, Instant::now()),
                None => {
                    tracing::info!("Coordinator command channel closed, shutting down");
                    break;
                }
            }
        }
    }
    coordinator.close_all();
}
