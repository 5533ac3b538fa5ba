//! Persistent transport: one WebSocket per connection.

pub mod actor;
pub mod handler;
pub mod protocol;
