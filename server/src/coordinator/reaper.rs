//! Periodic stale-connection eviction.
//!
//! The timer only enqueues [`Command::Reap`]; the pass itself runs inside the
//! coordinator so it never races a register or join.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{Command, CoordinatorHandle};

/// Spawn the reaper. The first pass runs one full `interval` after start.
pub fn spawn_reaper(
    handle: CoordinatorHandle,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if handle.send(Command::Reap).is_err() {
                        tracing::warn!("Coordinator stopped, reaper exiting");
                        break;
                    }
                }
            }
        }
        tracing::debug!("Reaper stopped");
    })
}
