use chrono::Utc;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::watch;

use super::{Command, ConnectionSender, CoordinatorSettings};
use crate::dedup::DedupTracker;
use crate::presence::{
    ConnectionId, ConnectionRegistry, FreezeScope, FreezeState, RecentEvents, RoomKey,
    RoomManager, SessionRef,
};
use crate::proto::{ClientMessage, ServerMessage, SystemState};

/// State owned by the coordinator actor.
///
/// Every method is synchronous and touches only in-memory maps, so the
/// actor loop never blocks. Tests drive it directly.
pub struct Coordinator {
    pub(super) registry: ConnectionRegistry,
    pub(super) rooms: RoomManager,
    pub(super) recent: RecentEvents,
    pub(super) freeze: FreezeState,
    pub(super) outbound: HashMap<ConnectionId, ConnectionSender>,
    pub(super) dedup: DedupTracker,
    pub(super) replay_window: chrono::Duration,
    availability: watch::Sender<bool>,
}

impl Coordinator {
    pub fn new(settings: &CoordinatorSettings, dedup: DedupTracker) -> Self {
        let (availability, _) = watch::channel(true);
        Self {
            registry: ConnectionRegistry::new(settings.stale_after),
            rooms: RoomManager::new(),
            recent: RecentEvents::new(settings.recent_capacity),
            freeze: FreezeState::new(),
            outbound: HashMap::new(),
            dedup,
            replay_window: chrono::Duration::from_std(settings.replay_window)
                .unwrap_or_else(|_| chrono::Duration::hours(1)),
            availability,
        }
    }

    /// Receiver tracking the maintenance switch (true = accepting traffic).
    pub fn availability(&self) -> watch::Receiver<bool> {
        self.availability.subscribe()
    }

    pub fn handle(&mut self, command: Command, now: Instant) {
        match command {
            Command::Attach {
                connection_id,
                sender,
            } => self.attach(connection_id, sender),
            Command::Detach { connection_id } => self.detach(&connection_id),
            Command::Client {
                connection_id,
                message,
            } => self.handle_client(&connection_id, message, now),
            Command::Publish(event) => {
                self.publish(event);
            }
            Command::SetFrozen { scope, frozen } => self.set_frozen(scope, frozen),
            Command::SetEnabled(enabled) => self.set_enabled(enabled),
            Command::PresenceCount(reply) => {
                let _ = reply.send(self.online_count(now));
            }
            Command::RoomCount { room, reply } => {
                let _ = reply.send(self.members_count(&room));
            }
            Command::Touch {
                connection_id,
                reply,
            } => {
                let count = if self.touch(&connection_id, now) {
                    Some(self.online_count(now))
                } else {
                    None
                };
                let _ = reply.send(count);
            }
            Command::SystemState { scope, reply } => {
                let _ = reply.send(self.system_state(scope, now));
            }
            Command::Reap => {
                self.reap(now);
            }
        }
    }

    pub fn handle_client(&mut self, connection_id: &str, message: ClientMessage, now: Instant) {
        match message {
            ClientMessage::Register {
                display_name,
                tab_id,
            } => {
                self.register(connection_id, display_name.as_deref(), tab_id.as_deref(), now);
            }
            ClientMessage::Rename { display_name } => {
                self.rename(connection_id, &display_name, now);
            }
            ClientMessage::Heartbeat => {
                self.touch(connection_id, now);
            }
            ClientMessage::Join(request) => {
                self.join(
                    &request.room,
                    connection_id,
                    request.competition_id.as_deref(),
                    now,
                );
            }
            ClientMessage::Leave(request) => {
                self.touch(connection_id, now);
                self.leave(&request.room, connection_id);
            }
            ClientMessage::Publish(event) => {
                self.touch(connection_id, now);
                self.publish(event);
            }
            ClientMessage::GetSystemState { scope } => {
                self.touch(connection_id, now);
                let state = self.system_state(scope, now);
                self.send_to(connection_id, ServerMessage::SystemState(state).into());
            }
            ClientMessage::AdminFreezeControl(_) => {
                // Authorized control frames arrive as Command::SetFrozen.
                tracing::warn!(
                    connection_id = %connection_id,
                    "Unauthenticated control frame reached the coordinator, dropped"
                );
            }
        }
    }

    pub fn attach(&mut self, connection_id: ConnectionId, sender: ConnectionSender) {
        let _ = sender.send(
            ServerMessage::Connected {
                connection_id: connection_id.clone(),
            }
            .into(),
        );
        tracing::debug!(connection_id = %connection_id, "Connection attached");
        self.outbound.insert(connection_id, sender);
    }

    /// Transport closed: drop the outbound queue, unregister and leave rooms.
    pub fn detach(&mut self, connection_id: &str) {
        self.outbound.remove(connection_id);
        self.unregister(connection_id);
        tracing::debug!(connection_id = %connection_id, "Connection detached");
    }

    pub fn register(
        &mut self,
        connection_id: &str,
        display_name: Option<&str>,
        tab_id: Option<&str>,
        now: Instant,
    ) -> SessionRef {
        let before = self.registry.count();
        let session = self.registry.register(connection_id, display_name, tab_id, now);
        if session.is_new {
            tracing::info!(
                connection_id = %connection_id,
                identity = ?session.identity,
                "Session registered"
            );
        }
        self.announce_count_change(before, connection_id);
        session
    }

    pub fn rename(&mut self, connection_id: &str, display_name: &str, now: Instant) -> SessionRef {
        let before = self.registry.count();
        let session = self.registry.rename(connection_id, display_name, now);
        tracing::info!(
            connection_id = %connection_id,
            display_name = %display_name,
            "Connection renamed"
        );
        self.announce_count_change(before, connection_id);
        session
    }

    /// Broadcast the online count if it moved; otherwise just tell the
    /// connection that triggered the change.
    fn announce_count_change(&self, before: usize, connection_id: &str) {
        let count = self.registry.count();
        if count != before {
            self.broadcast_presence();
        } else {
            self.send_to(connection_id, ServerMessage::PresenceCount { count }.into());
        }
    }

    pub fn touch(&mut self, connection_id: &str, now: Instant) -> bool {
        self.registry.touch(connection_id, now)
    }

    /// Unregister a connection and purge it from every room. Returns whether
    /// an identity went fully offline.
    pub fn unregister(&mut self, connection_id: &str) -> bool {
        let before = self.registry.count();
        let left = self.registry.unregister(connection_id);
        for room in self.rooms.purge_connection(connection_id) {
            self.broadcast_room_count(&room);
        }
        if self.registry.count() != before {
            self.broadcast_presence();
        }
        left
    }

    /// Join a room. A connection that never registered is registered
    /// anonymously first, so rooms only ever hold registered connections.
    pub fn join(
        &mut self,
        room: &RoomKey,
        connection_id: &str,
        competition_id: Option<&str>,
        now: Instant,
    ) {
        if !self.touch(connection_id, now) {
            self.register(connection_id, None, None, now);
        }
        if !self.rooms.join(room, connection_id, competition_id) {
            return;
        }
        tracing::debug!(connection_id = %connection_id, room = %room, "Joined room");
        self.broadcast_room_count(room);

        if room.family.keeps_history() {
            let cutoff = Utc::now() - self.replay_window;
            let events = self.recent.since(room, cutoff);
            self.send_to(
                connection_id,
                ServerMessage::RecentTeamUpdates {
                    family: room.family,
                    room_id: room.id.clone(),
                    events,
                }
                .into(),
            );
        }
    }

    pub fn leave(&mut self, room: &RoomKey, connection_id: &str) {
        if self.rooms.leave(room, connection_id) {
            tracing::debug!(connection_id = %connection_id, room = %room, "Left room");
            self.broadcast_room_count(room);
        }
    }

    pub fn members_count(&self, room: &RoomKey) -> usize {
        self.rooms.members_count(room)
    }

    /// Online identities, after evicting anything stale.
    pub fn online_count(&mut self, now: Instant) -> usize {
        self.reap(now);
        self.registry.count()
    }

    /// One reaper pass over registry, rooms and replay buffers. Emits at most
    /// one presence broadcast. Returns the number of evicted connections.
    pub fn reap(&mut self, now: Instant) -> usize {
        let before = self.registry.count();
        let removed = self.registry.reap(now);
        for connection_id in &removed {
            self.outbound.remove(connection_id);
        }

        let registry = &self.registry;
        let changed_rooms = self.rooms.retain_members(|id| registry.contains(id));
        for room in &changed_rooms {
            self.broadcast_room_count(room);
        }
        self.recent.prune(Utc::now() - self.replay_window);

        if !removed.is_empty() {
            tracing::info!(
                removed = removed.len(),
                rooms = changed_rooms.len(),
                "Reaped stale connections"
            );
        }
        if self.registry.count() != before {
            self.broadcast_presence();
        }
        removed.len()
    }

    /// Apply a freeze transition and broadcast it. Repeating a transition
    /// still broadcasts so reconnecting clients converge.
    pub fn set_frozen(&mut self, scope: FreezeScope, frozen: bool) {
        let changed = self.freeze.set(&scope, frozen);
        tracing::info!(scope = %scope, frozen, changed, "Freeze state set");
        let message = ServerMessage::SystemFreeze {
            frozen,
            scope: scope.clone(),
            timestamp: Utc::now(),
        };
        match scope {
            FreezeScope::Global => self.broadcast_all(message),
            FreezeScope::Competition(ref competition_id) => {
                self.broadcast_competition(competition_id, message);
            }
        }
    }

    pub fn freeze_status(&self, scope: &FreezeScope) -> bool {
        self.freeze.status(scope)
    }

    /// Flip maintenance mode and tell every connection.
    pub fn set_enabled(&mut self, enabled: bool) {
        let changed = self.freeze.set_enabled(enabled);
        self.availability.send_replace(enabled);
        tracing::info!(enabled, changed, "Availability set");
        let timestamp = Utc::now();
        let message = if enabled {
            ServerMessage::ServiceRestored { timestamp }
        } else {
            ServerMessage::ServiceMaintenance { timestamp }
        };
        self.broadcast_all(message);
    }

    pub fn system_state(&mut self, scope: FreezeScope, now: Instant) -> SystemState {
        let presence_count = self.online_count(now);
        SystemState {
            frozen: self.freeze_status(&scope),
            global_frozen: self.freeze.global(),
            enabled: self.freeze.enabled(),
            scope,
            presence_count,
            timestamp: Utc::now(),
        }
    }

    /// Drop every outbound queue, closing the transports behind them.
    pub fn close_all(&mut self) {
        let count = self.outbound.len();
        self.outbound.clear();
        tracing::info!(connections = count, "Closed all outbound queues");
    }
}
