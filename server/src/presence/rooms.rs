use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use super::registry::ConnectionId;

/// The four kinds of room a client can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomFamily {
    Challenge,
    Team,
    Leaderboard,
    Activity,
}

impl RoomFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Challenge => "challenge",
            Self::Team => "team",
            Self::Leaderboard => "leaderboard",
            Self::Activity => "activity",
        }
    }

    /// Leaderboard and activity rooms exist once per process.
    pub fn is_singleton(&self) -> bool {
        matches!(self, Self::Leaderboard | Self::Activity)
    }

    /// Whether joining this family replays recent events to the joiner.
    pub fn keeps_history(&self) -> bool {
        matches!(self, Self::Team | Self::Activity)
    }
}

impl FromStr for RoomFamily {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "challenge" => Ok(Self::Challenge),
            "team" => Ok(Self::Team),
            "leaderboard" => Ok(Self::Leaderboard),
            "activity" => Ok(Self::Activity),
            _ => Err(()),
        }
    }
}

/// Fully qualified room name. Singleton families always carry their family
/// name as id so that `leaderboard` and `activity` never fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomKey {
    pub family: RoomFamily,
    pub id: String,
}

impl RoomKey {
    pub fn new(family: RoomFamily, id: impl Into<String>) -> Self {
        if family.is_singleton() {
            return Self {
                family,
                id: family.as_str().to_string(),
            };
        }
        Self {
            family,
            id: id.into(),
        }
    }

    pub fn challenge(id: impl Into<String>) -> Self {
        Self::new(RoomFamily::Challenge, id)
    }

    pub fn team(id: impl Into<String>) -> Self {
        Self::new(RoomFamily::Team, id)
    }

    pub fn leaderboard() -> Self {
        Self::new(RoomFamily::Leaderboard, "")
    }

    pub fn activity() -> Self {
        Self::new(RoomFamily::Activity, "")
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.family.is_singleton() {
            write!(f, "{}", self.family.as_str())
        } else {
            write!(f, "{}:{}", self.family.as_str(), self.id)
        }
    }
}

#[derive(Debug, Default)]
struct Room {
    members: HashSet<ConnectionId>,
    /// Competition the room belongs to, learned from join requests.
    competition_id: Option<String>,
}

/// Tracks which connections are subscribed to which rooms.
///
/// Keeps a reverse index from connection to rooms so that purging a
/// connection touches only the rooms it actually joined. Rooms exist only
/// while they have members.
#[derive(Debug, Default)]
pub struct RoomManager {
    rooms: HashMap<RoomKey, Room>,
    memberships: HashMap<ConnectionId, HashSet<RoomKey>>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a room, creating the room if needed.
    ///
    /// Returns false when the connection was already a member.
    pub fn join(&mut self, key: &RoomKey, connection_id: &str, competition_id: Option<&str>) -> bool {
        let room = self.rooms.entry(key.clone()).or_default();
        if let Some(competition) = competition_id.filter(|c| !c.is_empty()) {
            room.competition_id = Some(competition.to_string());
        }
        if !room.members.insert(connection_id.to_string()) {
            return false;
        }
        self.memberships
            .entry(connection_id.to_string())
            .or_default()
            .insert(key.clone());
        true
    }

    /// Remove a connection from a room. Leaving a room the connection is not
    /// in is a no-op and returns false.
    pub fn leave(&mut self, key: &RoomKey, connection_id: &str) -> bool {
        let Some(room) = self.rooms.get_mut(key) else {
            return false;
        };
        if !room.members.remove(connection_id) {
            return false;
        }
        if room.members.is_empty() {
            self.rooms.remove(key);
        }
        if let Some(keys) = self.memberships.get_mut(connection_id) {
            keys.remove(key);
            if keys.is_empty() {
                self.memberships.remove(connection_id);
            }
        }
        true
    }

    pub fn members_count(&self, key: &RoomKey) -> usize {
        self.rooms.get(key).map(|r| r.members.len()).unwrap_or(0)
    }

    #[cfg(test)]
    pub fn exists(&self, key: &RoomKey) -> bool {
        self.rooms.contains_key(key)
    }

    /// Members of a room, or an empty iterator when the room does not exist.
    pub fn members<'a>(&'a self, key: &RoomKey) -> impl Iterator<Item = &'a ConnectionId> + 'a {
        self.rooms
            .get(key)
            .into_iter()
            .flat_map(|room| room.members.iter())
    }

    /// Remove a connection from every room it joined.
    ///
    /// Returns the rooms it was removed from.
    pub fn purge_connection(&mut self, connection_id: &str) -> Vec<RoomKey> {
        let Some(keys) = self.memberships.remove(connection_id) else {
            return Vec::new();
        };
        let mut left = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(room) = self.rooms.get_mut(&key) {
                room.members.remove(connection_id);
                if room.members.is_empty() {
                    self.rooms.remove(&key);
                }
            }
            left.push(key);
        }
        left
    }

    /// Drop every member for which `keep` returns false.
    ///
    /// Returns the rooms whose membership changed.
    pub fn retain_members(&mut self, keep: impl Fn(&str) -> bool) -> Vec<RoomKey> {
        let doomed: Vec<ConnectionId> = self
            .memberships
            .keys()
            .filter(|id| !keep(id.as_str()))
            .cloned()
            .collect();

        let mut changed = HashSet::new();
        for connection_id in doomed {
            changed.extend(self.purge_connection(&connection_id));
        }
        changed.into_iter().collect()
    }

    /// Rooms that joiners tagged with the given competition.
    pub fn rooms_for_competition(&self, competition_id: &str) -> Vec<RoomKey> {
        self.rooms
            .iter()
            .filter(|(_, room)| room.competition_id.as_deref() == Some(competition_id))
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_then_leave_restores_count() {
        let mut rooms = RoomManager::new();
        let key = RoomKey::challenge("web-100");
        rooms.join(&key, "c0", None);
        let before = rooms.members_count(&key);

        assert!(rooms.join(&key, "c1", None));
        assert_eq!(rooms.members_count(&key), before + 1);
        assert!(rooms.leave(&key, "c1"));
        assert_eq!(rooms.members_count(&key), before);
    }

    #[test]
    fn test_join_and_leave_are_idempotent() {
        let mut rooms = RoomManager::new();
        let key = RoomKey::team("T1");

        assert!(rooms.join(&key, "c1", None));
        assert!(!rooms.join(&key, "c1", None));
        assert_eq!(rooms.members_count(&key), 1);

        assert!(rooms.leave(&key, "c1"));
        assert!(!rooms.leave(&key, "c1"));
        assert!(!rooms.leave(&RoomKey::team("never"), "c1"));
    }

    #[test]
    fn test_empty_room_is_removed() {
        let mut rooms = RoomManager::new();
        let key = RoomKey::team("T1");
        rooms.join(&key, "c1", None);
        assert!(rooms.exists(&key));

        rooms.leave(&key, "c1");
        assert!(!rooms.exists(&key));
        assert_eq!(rooms.room_count(), 0);
    }

    #[test]
    fn test_purge_connection_leaves_every_room() {
        let mut rooms = RoomManager::new();
        rooms.join(&RoomKey::team("T1"), "c1", None);
        rooms.join(&RoomKey::leaderboard(), "c1", None);
        rooms.join(&RoomKey::leaderboard(), "c2", None);

        let mut left = rooms.purge_connection("c1");
        left.sort_by_key(|k| k.to_string());
        assert_eq!(left, vec![RoomKey::leaderboard(), RoomKey::team("T1")]);
        assert!(!rooms.exists(&RoomKey::team("T1")));
        assert_eq!(rooms.members_count(&RoomKey::leaderboard()), 1);
        assert!(rooms.purge_connection("c1").is_empty());
    }

    #[test]
    fn test_retain_members_drops_unknown_connections() {
        let mut rooms = RoomManager::new();
        rooms.join(&RoomKey::activity(), "live", None);
        rooms.join(&RoomKey::activity(), "dead", None);
        rooms.join(&RoomKey::challenge("x"), "dead", None);

        let changed = rooms.retain_members(|id| id == "live");
        assert_eq!(changed.len(), 2);
        assert_eq!(rooms.members_count(&RoomKey::activity()), 1);
        assert!(!rooms.exists(&RoomKey::challenge("x")));
    }

    #[test]
    fn test_singleton_keys_ignore_id() {
        assert_eq!(
            RoomKey::new(RoomFamily::Leaderboard, "anything"),
            RoomKey::leaderboard()
        );
        assert_eq!(RoomKey::leaderboard().to_string(), "leaderboard");
        assert_eq!(RoomKey::team("T9").to_string(), "team:T9");
    }

    #[test]
    fn test_rooms_for_competition() {
        let mut rooms = RoomManager::new();
        rooms.join(&RoomKey::challenge("a"), "c1", Some("ctf-2026"));
        rooms.join(&RoomKey::challenge("b"), "c1", Some("other"));
        rooms.join(&RoomKey::team("T1"), "c2", None);

        assert_eq!(
            rooms.rooms_for_competition("ctf-2026"),
            vec![RoomKey::challenge("a")]
        );
    }
}
