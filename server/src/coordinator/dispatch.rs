//! Fan-out of server messages to connections and rooms.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;

use super::Coordinator;
use crate::presence::{ConnectionId, FreezeScope, RoomKey};
use crate::proto::{Broadcast, DomainEvent, DomainEventKind, ProtocolError, ServerMessage, TeamAction};

impl Coordinator {
    /// Queue a message for one connection. Unknown or closed connections are
    /// skipped silently.
    pub fn send_to(&self, connection_id: &str, message: Arc<ServerMessage>) {
        if let Some(sender) = self.outbound.get(connection_id) {
            let _ = sender.send(message);
        }
    }

    /// Send to every registered connection.
    pub fn broadcast_all(&self, message: ServerMessage) {
        let message = Arc::new(message);
        for connection_id in self.registry.connection_ids() {
            self.send_to(connection_id, message.clone());
        }
    }

    /// Send to the members of one room. A room nobody joined is a no-op.
    pub fn broadcast_room(&self, room: &RoomKey, message: ServerMessage) -> usize {
        let message = Arc::new(message);
        let mut delivered = 0;
        for connection_id in self.rooms.members(room) {
            self.send_to(connection_id, message.clone());
            delivered += 1;
        }
        delivered
    }

    /// Send once to every connection in the union of `rooms`.
    fn broadcast_rooms(&self, rooms: &[RoomKey], message: ServerMessage) -> usize {
        let message = Arc::new(message);
        let mut targets: HashSet<&ConnectionId> = HashSet::new();
        for room in rooms {
            targets.extend(self.rooms.members(room));
        }
        for connection_id in &targets {
            self.send_to(connection_id, message.clone());
        }
        targets.len()
    }

    pub fn broadcast_presence(&self) {
        let count = self.registry.count();
        tracing::debug!(count, "Broadcasting presence count");
        self.broadcast_all(ServerMessage::PresenceCount { count });
    }

    pub fn broadcast_room_count(&self, room: &RoomKey) {
        self.broadcast_room(
            room,
            ServerMessage::RoomMemberCount {
                family: room.family,
                room_id: room.id.clone(),
                count: self.rooms.members_count(room),
            },
        );
    }

    /// Rooms tagged with the competition, plus the leaderboard room.
    pub(super) fn broadcast_competition(&self, competition_id: &str, message: ServerMessage) {
        let mut rooms = self.rooms.rooms_for_competition(competition_id);
        let leaderboard = RoomKey::leaderboard();
        if !rooms.contains(&leaderboard) {
            rooms.push(leaderboard);
        }
        self.broadcast_rooms(&rooms, message);
    }

    /// Relay a domain event to its target rooms. Returns the number of
    /// connections it was queued for.
    pub fn publish(&mut self, event: DomainEvent) -> usize {
        let rooms = match target_rooms(&event) {
            Ok(rooms) => rooms,
            Err(e) => {
                tracing::warn!(event = event.kind.as_str(), error = %e, "Dropping domain event");
                return 0;
            }
        };

        if event.kind == DomainEventKind::LeaderboardUpdate {
            let scope = FreezeScope::from(event.field("competition_id").map(str::to_string));
            if self.freeze_status(&scope) {
                tracing::debug!(scope = %scope, "Leaderboard frozen, update withheld");
                return 0;
            }
        }

        let broadcast_id = match event.broadcast_id {
            Some(ref id) => {
                if !self.dedup.first_sighting(id) {
                    tracing::debug!(broadcast_id = %id, "Duplicate broadcast dropped");
                    return 0;
                }
                id.clone()
            }
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                self.dedup.remember(&id);
                id
            }
        };

        let keep_history = match event.kind {
            DomainEventKind::TeamUpdate => {
                matches!(event.team_action(), Ok(TeamAction::PointsUpdate))
            }
            DomainEventKind::ActivityUpdate => true,
            _ => false,
        };

        let mut payload = event.payload;
        payload.remove("timestamp");
        let broadcast = Broadcast {
            broadcast_id,
            timestamp: Utc::now(),
            payload,
        };

        if keep_history {
            for room in rooms.iter().filter(|r| r.family.keeps_history()) {
                self.recent.push(room, broadcast.clone());
            }
        }

        let delivered = self.broadcast_rooms(&rooms, ServerMessage::domain(event.kind, broadcast));
        tracing::debug!(
            event = event.kind.as_str(),
            rooms = rooms.len(),
            delivered,
            "Domain event relayed"
        );
        delivered
    }
}

/// Rooms a domain event is delivered to.
fn target_rooms(event: &DomainEvent) -> Result<Vec<RoomKey>, ProtocolError> {
    let rooms = match event.kind {
        DomainEventKind::NewSolve => vec![RoomKey::challenge(event.require("challenge_id")?)],
        DomainEventKind::FirstBlood => vec![
            RoomKey::challenge(event.require("challenge_id")?),
            RoomKey::activity(),
        ],
        DomainEventKind::TeamUpdate => {
            event.team_action()?;
            vec![RoomKey::team(event.require("team_id")?)]
        }
        DomainEventKind::LeaderboardUpdate => vec![RoomKey::leaderboard()],
        DomainEventKind::ActivityUpdate => vec![RoomKey::activity()],
    };
    Ok(rooms)
}
