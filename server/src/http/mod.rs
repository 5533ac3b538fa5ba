//! HTTP surface: fallback queries, the control endpoint, the polling
//! transport and the maintenance gate.

pub mod control;
pub mod maintenance;
pub mod poll;
pub mod presence;
