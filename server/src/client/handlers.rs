//! Callback registry shared by both transport variants.
//!
//! Everything a transport receives goes through [`ClientShared::deliver`],
//! which drops broadcasts already seen and count updates that repeat the last
//! known value. That filtering is what makes a socket client and a polling
//! client observe the same callback sequence.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::dedup::DedupTracker;
use crate::presence::RoomKey;
use crate::proto::ServerMessage;

/// Callback invoked with every delivered message of one event name.
pub type Handler = Arc<dyn Fn(&ServerMessage) + Send + Sync>;

/// Token returned by `on`, used to remove the handler again.
pub type HandlerId = u64;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ClientShared {
    handlers: DashMap<String, Vec<(HandlerId, Handler)>>,
    next_id: AtomicU64,
    rooms: Mutex<Vec<RoomKey>>,
    connection_id: Mutex<Option<String>>,
    seen: DedupTracker,
    /// Last delivered value per count key ("presence" or "<family>:<id>").
    counts: DashMap<String, usize>,
}

impl ClientShared {
    pub fn new(dedup_window: Duration) -> Self {
        Self {
            handlers: DashMap::new(),
            next_id: AtomicU64::new(1),
            rooms: Mutex::new(Vec::new()),
            connection_id: Mutex::new(None),
            seen: DedupTracker::new(dedup_window),
            counts: DashMap::new(),
        }
    }

    /// Expire remembered broadcast ids until `cancel` fires.
    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        self.seen.spawn_sweeper(cancel)
    }

    pub fn on(&self, event: &str, handler: Handler) -> HandlerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .entry(event.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    pub fn off(&self, event: &str, id: HandlerId) -> bool {
        let Some(mut handlers) = self.handlers.get_mut(event) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(h, _)| *h != id);
        handlers.len() != before
    }

    /// Remember a joined room so it is re-joined after a reconnect.
    pub fn add_room(&self, room: RoomKey) -> bool {
        let mut rooms = lock(&self.rooms);
        if rooms.contains(&room) {
            return false;
        }
        rooms.push(room);
        true
    }

    pub fn remove_room(&self, room: &RoomKey) -> bool {
        let mut rooms = lock(&self.rooms);
        let before = rooms.len();
        rooms.retain(|r| r != room);
        rooms.len() != before
    }

    pub fn rooms(&self) -> Vec<RoomKey> {
        lock(&self.rooms).clone()
    }

    pub fn connection_id(&self) -> Option<String> {
        lock(&self.connection_id).clone()
    }

    pub fn set_connection_id(&self, connection_id: Option<String>) {
        *lock(&self.connection_id) = connection_id;
    }

    /// Filter a received message and run the handlers registered for it.
    /// Returns whether any handler saw it.
    pub fn deliver(&self, message: ServerMessage) -> bool {
        let Some(message) = self.filter(message) else {
            return false;
        };
        if let ServerMessage::Connected { connection_id } = &message {
            self.set_connection_id(Some(connection_id.clone()));
        }

        // Clone the handler list so callbacks may call on/off.
        let handlers: Vec<Handler> = match self.handlers.get(message.event_name()) {
            Some(entry) => entry.iter().map(|(_, h)| h.clone()).collect(),
            None => return false,
        };
        for handler in &handlers {
            handler(&message);
        }
        !handlers.is_empty()
    }

    fn filter(&self, message: ServerMessage) -> Option<ServerMessage> {
        if let Some(broadcast) = message.broadcast() {
            return self
                .seen
                .first_sighting(&broadcast.broadcast_id)
                .then_some(message);
        }
        match message {
            ServerMessage::PresenceCount { count } => {
                self.count_changed("presence".to_string(), count).then_some(message)
            }
            ServerMessage::RoomMemberCount {
                family,
                ref room_id,
                count,
            } => {
                let key = format!("{}:{}", family.as_str(), room_id);
                self.count_changed(key, count).then_some(message)
            }
            ServerMessage::RecentTeamUpdates {
                family,
                room_id,
                events,
            } => {
                let events = events
                    .into_iter()
                    .filter(|b| self.seen.first_sighting(&b.broadcast_id))
                    .collect();
                Some(ServerMessage::RecentTeamUpdates {
                    family,
                    room_id,
                    events,
                })
            }
            other => Some(other),
        }
    }

    fn count_changed(&self, key: String, count: usize) -> bool {
        self.counts.insert(key, count) != Some(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::RoomFamily;
    use crate::proto::Broadcast;
    use chrono::Utc;
    use serde_json::Map;

    fn shared() -> Arc<ClientShared> {
        Arc::new(ClientShared::new(Duration::from_secs(600)))
    }

    fn recorder(shared: &ClientShared, event: &str) -> Arc<Mutex<Vec<ServerMessage>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        shared.on(
            event,
            Arc::new(move |m: &ServerMessage| sink.lock().unwrap().push(m.clone())),
        );
        log
    }

    fn team_update(id: &str) -> ServerMessage {
        ServerMessage::TeamUpdate(Broadcast {
            broadcast_id: id.to_string(),
            timestamp: Utc::now(),
            payload: Map::new(),
        })
    }

    #[tokio::test]
    async fn test_sweeper_forgets_expired_broadcast_ids() {
        let shared = Arc::new(ClientShared::new(Duration::from_millis(1)));
        let cancel = CancellationToken::new();
        let sweeper = shared.spawn_sweeper(cancel.clone());

        for n in 0..1000 {
            shared.deliver(team_update(&format!("b{n}")));
        }
        assert_eq!(shared.seen.len(), 1000);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(shared.seen.is_empty());

        cancel.cancel();
        sweeper.await.unwrap();
    }

    #[test]
    fn test_duplicate_broadcasts_are_suppressed() {
        let shared = shared();
        let log = recorder(&shared, "team_update");

        assert!(shared.deliver(team_update("b1")));
        assert!(!shared.deliver(team_update("b1")));
        assert!(shared.deliver(team_update("b2")));
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_repeated_counts_are_suppressed() {
        let shared = shared();
        let log = recorder(&shared, "presence_count");

        shared.deliver(ServerMessage::PresenceCount { count: 2 });
        shared.deliver(ServerMessage::PresenceCount { count: 2 });
        shared.deliver(ServerMessage::PresenceCount { count: 3 });
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_room_counts_are_tracked_per_room() {
        let shared = shared();
        let log = recorder(&shared, "room_member_count");
        let count = |id: &str, count| ServerMessage::RoomMemberCount {
            family: RoomFamily::Team,
            room_id: id.to_string(),
            count,
        };

        shared.deliver(count("T1", 1));
        shared.deliver(count("T2", 1));
        shared.deliver(count("T1", 1));
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_replay_skips_events_already_delivered_live() {
        let shared = shared();
        let log = recorder(&shared, "recent_team_updates");
        shared.deliver(team_update("b1"));

        let replay = |ids: &[&str]| ServerMessage::RecentTeamUpdates {
            family: RoomFamily::Team,
            room_id: "T1".to_string(),
            events: ids
                .iter()
                .filter_map(|id| team_update(id).broadcast().cloned())
                .collect(),
        };
        shared.deliver(replay(&["b1", "b2"]));

        let log = log.lock().unwrap();
        match &log[0] {
            ServerMessage::RecentTeamUpdates { events, .. } => {
                assert_eq!(events.len(), 1);
                assert_eq!(events[0].broadcast_id, "b2");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_off_removes_handler() {
        let shared = shared();
        let id = shared.on("presence_count", Arc::new(|_: &ServerMessage| {}));
        assert!(shared.off("presence_count", id));
        assert!(!shared.off("presence_count", id));
        assert!(!shared.deliver(ServerMessage::PresenceCount { count: 1 }));
    }

    #[test]
    fn test_connected_records_connection_id() {
        let shared = shared();
        shared.deliver(ServerMessage::Connected {
            connection_id: "abc".to_string(),
        });
        assert_eq!(shared.connection_id().as_deref(), Some("abc"));
    }

    #[test]
    fn test_rooms_are_remembered_once() {
        let shared = shared();
        assert!(shared.add_room(RoomKey::team("T1")));
        assert!(!shared.add_room(RoomKey::team("T1")));
        assert!(shared.remove_room(&RoomKey::team("T1")));
        assert!(shared.rooms().is_empty());
    }
}
