//! Arena presence coordinator library.
//! Exposes the coordinator, the server surfaces and the client transports
//! for embedding and integration testing. The binary entry point is in main.rs.

pub mod client;
pub mod config;
pub mod control;
pub mod coordinator;
pub mod dedup;
pub mod http;
pub mod presence;
pub mod proto;
pub mod routes;
pub mod state;
pub mod ws;
