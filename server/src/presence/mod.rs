//! In-memory presence model owned by the coordinator actor.
//!
//! Nothing in here is shared or locked: every structure is a plain map that
//! the coordinator mutates from its single sequential command loop.

pub mod freeze;
pub mod recent;
pub mod registry;
pub mod rooms;

pub use freeze::{FreezeScope, FreezeState};
pub use recent::RecentEvents;
pub use registry::{ConnectionId, ConnectionRegistry, Identity, SessionRef};
pub use rooms::{RoomFamily, RoomKey, RoomManager};
