//! Wire envelopes exchanged between clients and the coordinator.
//!
//! Every frame is JSON of the shape `{"event": "<name>", "data": {...}}`. The
//! same envelope travels over the WebSocket and through the polling endpoints,
//! so both transports speak one protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::presence::{FreezeScope, RoomFamily, RoomKey};

/// A raw envelope before the event name is resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

/// Reasons a client frame is rejected. All of them are logged and the frame
/// is dropped; none are fatal to the connection.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown event `{0}`")]
    UnknownEvent(String),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("unsupported team action `{0}`")]
    UnknownTeamAction(String),
}

/// Domain events relayed by the broadcast dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainEventKind {
    NewSolve,
    FirstBlood,
    TeamUpdate,
    LeaderboardUpdate,
    ActivityUpdate,
}

impl DomainEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewSolve => "new_solve",
            Self::FirstBlood => "first_blood",
            Self::TeamUpdate => "team_update",
            Self::LeaderboardUpdate => "leaderboard_update",
            Self::ActivityUpdate => "activity_update",
        }
    }

    pub fn from_event_name(name: &str) -> Option<Self> {
        match name {
            "new_solve" => Some(Self::NewSolve),
            "first_blood" => Some(Self::FirstBlood),
            "team_update" => Some(Self::TeamUpdate),
            "leaderboard_update" => Some(Self::LeaderboardUpdate),
            "activity_update" => Some(Self::ActivityUpdate),
            _ => None,
        }
    }
}

/// Team update actions understood by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeamAction {
    Create,
    Join,
    Remove,
    PointsUpdate,
}

impl TeamAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Self::Create),
            "join" => Some(Self::Join),
            "remove" => Some(Self::Remove),
            "points_update" => Some(Self::PointsUpdate),
            _ => None,
        }
    }
}

/// A domain event entering the dispatcher, either from a client frame or
/// from an in-process collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainEvent {
    pub kind: DomainEventKind,
    /// Id supplied by the publisher for cross-channel dedup, if any.
    pub broadcast_id: Option<String>,
    pub payload: Map<String, Value>,
}

impl DomainEvent {
    pub fn new(kind: DomainEventKind, payload: Map<String, Value>) -> Self {
        Self {
            kind,
            broadcast_id: None,
            payload,
        }
    }

    /// Build from an event name and a JSON object payload. A `broadcast_id`
    /// inside the payload is lifted out.
    pub fn from_parts(event: &str, data: Value) -> Result<Self, ProtocolError> {
        let kind = DomainEventKind::from_event_name(event)
            .ok_or_else(|| ProtocolError::UnknownEvent(event.to_string()))?;
        let mut payload = object(data)?;
        let broadcast_id = match payload.remove("broadcast_id") {
            Some(Value::String(id)) if !id.is_empty() => Some(id),
            _ => None,
        };
        Ok(Self {
            kind,
            broadcast_id,
            payload,
        })
    }

    /// A string field of the payload, treating empty strings as absent.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.payload
            .get(name)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn require(&self, name: &'static str) -> Result<&str, ProtocolError> {
        self.field(name).ok_or(ProtocolError::MissingField(name))
    }

    pub fn team_action(&self) -> Result<TeamAction, ProtocolError> {
        let action = self.require("action")?;
        TeamAction::parse(action).ok_or_else(|| ProtocolError::UnknownTeamAction(action.to_string()))
    }
}

/// Room subscription request carried by the join/leave events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomRequest {
    pub room: RoomKey,
    pub competition_id: Option<String>,
}

/// Privileged freeze toggle sent over the persistent channel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FreezeControl {
    #[serde(default)]
    pub token: String,
    pub frozen: bool,
    #[serde(default = "global_scope")]
    pub scope: FreezeScope,
}

fn global_scope() -> FreezeScope {
    FreezeScope::Global
}

/// Everything a client may send to the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Register {
        display_name: Option<String>,
        tab_id: Option<String>,
    },
    Rename {
        display_name: String,
    },
    Heartbeat,
    Join(RoomRequest),
    Leave(RoomRequest),
    Publish(DomainEvent),
    GetSystemState {
        scope: FreezeScope,
    },
    AdminFreezeControl(FreezeControl),
}

#[derive(Debug, Default, Deserialize)]
struct RegisterData {
    display_name: Option<String>,
    tab_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RenameData {
    #[serde(default)]
    display_name: String,
}

#[derive(Debug, Default, Deserialize)]
struct RoomData {
    challenge_id: Option<String>,
    team_id: Option<String>,
    competition_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StateQuery {
    competition_id: Option<String>,
}

impl ClientMessage {
    /// Decode a text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        Self::from_envelope(envelope)
    }

    pub fn from_envelope(envelope: Envelope) -> Result<Self, ProtocolError> {
        let Envelope { event, data } = envelope;
        let data = if data.is_null() {
            Value::Object(Map::new())
        } else {
            data
        };

        let message = match event.as_str() {
            "register" | "connect" => {
                let d: RegisterData = serde_json::from_value(data)?;
                Self::Register {
                    display_name: d.display_name,
                    tab_id: d.tab_id,
                }
            }
            "rename" => {
                let d: RenameData = serde_json::from_value(data)?;
                if d.display_name.trim().is_empty() {
                    return Err(ProtocolError::MissingField("display_name"));
                }
                Self::Rename {
                    display_name: d.display_name,
                }
            }
            "heartbeat" => Self::Heartbeat,
            "join_challenge_room" => Self::Join(room_request(RoomFamily::Challenge, data)?),
            "leave_challenge_room" => Self::Leave(room_request(RoomFamily::Challenge, data)?),
            "join_team_room" => Self::Join(room_request(RoomFamily::Team, data)?),
            "leave_team_room" => Self::Leave(room_request(RoomFamily::Team, data)?),
            "join_leaderboard_room" => Self::Join(room_request(RoomFamily::Leaderboard, data)?),
            "leave_leaderboard_room" => Self::Leave(room_request(RoomFamily::Leaderboard, data)?),
            "join_activity_room" => Self::Join(room_request(RoomFamily::Activity, data)?),
            "leave_activity_room" => Self::Leave(room_request(RoomFamily::Activity, data)?),
            "flag_submitted" => Self::Publish(DomainEvent::from_parts("new_solve", data)?),
            "flag_first_blood" => Self::Publish(DomainEvent::from_parts("first_blood", data)?),
            "team_update" => {
                let event = DomainEvent::from_parts("team_update", data)?;
                event.team_action()?;
                Self::Publish(event)
            }
            "get_system_state" => {
                let q: StateQuery = serde_json::from_value(data)?;
                Self::GetSystemState {
                    scope: FreezeScope::from(q.competition_id),
                }
            }
            "admin_freeze_control" => Self::AdminFreezeControl(serde_json::from_value(data)?),
            other => return Err(ProtocolError::UnknownEvent(other.to_string())),
        };
        Ok(message)
    }
}

fn object(data: Value) -> Result<Map<String, Value>, ProtocolError> {
    match data {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(ProtocolError::Malformed(serde::de::Error::custom(format!(
            "expected object payload, got {}",
            other
        )))),
    }
}

fn room_request(family: RoomFamily, data: Value) -> Result<RoomRequest, ProtocolError> {
    let d: RoomData = serde_json::from_value(data)?;
    let competition_id = d.competition_id.filter(|c| !c.is_empty());
    let id = match family {
        RoomFamily::Challenge => d
            .challenge_id
            .filter(|c| !c.is_empty())
            .ok_or(ProtocolError::MissingField("challenge_id"))?,
        RoomFamily::Team => d
            .team_id
            .filter(|t| !t.is_empty())
            .ok_or(ProtocolError::MissingField("team_id"))?,
        RoomFamily::Leaderboard | RoomFamily::Activity => String::new(),
    };
    Ok(RoomRequest {
        room: RoomKey::new(family, id),
        competition_id,
    })
}

/// Event names a client sends to join or leave a room.
pub fn room_event_name(family: RoomFamily, join: bool) -> &'static str {
    match (family, join) {
        (RoomFamily::Challenge, true) => "join_challenge_room",
        (RoomFamily::Challenge, false) => "leave_challenge_room",
        (RoomFamily::Team, true) => "join_team_room",
        (RoomFamily::Team, false) => "leave_team_room",
        (RoomFamily::Leaderboard, true) => "join_leaderboard_room",
        (RoomFamily::Leaderboard, false) => "leave_leaderboard_room",
        (RoomFamily::Activity, true) => "join_activity_room",
        (RoomFamily::Activity, false) => "leave_activity_room",
    }
}

/// Payload that identifies a room in join/leave events.
pub fn room_payload(room: &RoomKey) -> Value {
    match room.family {
        RoomFamily::Challenge => serde_json::json!({ "challenge_id": room.id }),
        RoomFamily::Team => serde_json::json!({ "team_id": room.id }),
        RoomFamily::Leaderboard | RoomFamily::Activity => serde_json::json!({}),
    }
}

/// A relayed domain event as delivered to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Broadcast {
    pub broadcast_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

/// Reply to `get_system_state` and body of `GET /status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemState {
    pub frozen: bool,
    pub global_frozen: bool,
    pub enabled: bool,
    pub scope: FreezeScope,
    pub presence_count: usize,
    pub timestamp: DateTime<Utc>,
}

/// Everything the coordinator sends to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        connection_id: String,
    },
    PresenceCount {
        count: usize,
    },
    RoomMemberCount {
        family: RoomFamily,
        room_id: String,
        count: usize,
    },
    NewSolve(Broadcast),
    FirstBlood(Broadcast),
    TeamUpdate(Broadcast),
    LeaderboardUpdate(Broadcast),
    ActivityUpdate(Broadcast),
    RecentTeamUpdates {
        family: RoomFamily,
        room_id: String,
        events: Vec<Broadcast>,
    },
    SystemFreeze {
        frozen: bool,
        scope: FreezeScope,
        timestamp: DateTime<Utc>,
    },
    SystemState(SystemState),
    ServiceMaintenance {
        timestamp: DateTime<Utc>,
    },
    ServiceRestored {
        timestamp: DateTime<Utc>,
    },
}

impl ServerMessage {
    pub fn domain(kind: DomainEventKind, broadcast: Broadcast) -> Self {
        match kind {
            DomainEventKind::NewSolve => Self::NewSolve(broadcast),
            DomainEventKind::FirstBlood => Self::FirstBlood(broadcast),
            DomainEventKind::TeamUpdate => Self::TeamUpdate(broadcast),
            DomainEventKind::LeaderboardUpdate => Self::LeaderboardUpdate(broadcast),
            DomainEventKind::ActivityUpdate => Self::ActivityUpdate(broadcast),
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::PresenceCount { .. } => "presence_count",
            Self::RoomMemberCount { .. } => "room_member_count",
            Self::NewSolve(_) => "new_solve",
            Self::FirstBlood(_) => "first_blood",
            Self::TeamUpdate(_) => "team_update",
            Self::LeaderboardUpdate(_) => "leaderboard_update",
            Self::ActivityUpdate(_) => "activity_update",
            Self::RecentTeamUpdates { .. } => "recent_team_updates",
            Self::SystemFreeze { .. } => "system_freeze",
            Self::SystemState(_) => "system_state",
            Self::ServiceMaintenance { .. } => "service_maintenance",
            Self::ServiceRestored { .. } => "service_restored",
        }
    }

    /// The relayed broadcast, for the domain event variants.
    pub fn broadcast(&self) -> Option<&Broadcast> {
        match self {
            Self::NewSolve(b)
            | Self::FirstBlood(b)
            | Self::TeamUpdate(b)
            | Self::LeaderboardUpdate(b)
            | Self::ActivityUpdate(b) => Some(b),
            _ => None,
        }
    }

    pub fn to_json(&self) -> String {
        // Serializing these types cannot fail: every map key is a string.
        serde_json::to_string(self).unwrap_or_default()
    }
}
