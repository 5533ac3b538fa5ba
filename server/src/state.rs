use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::PresenceConfig;
use crate::control::ControlAuth;
use crate::coordinator::{self, CoordinatorHandle, CoordinatorSettings};
use crate::dedup::DedupTracker;
use crate::http::poll::{self, Mailboxes};

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// Entry point to the presence coordinator actor
    pub coordinator: CoordinatorHandle,
    /// Shared token guarding freeze/maintenance control
    pub control: ControlAuth,
    /// Outbound queues of polling-transport connections
    pub mailboxes: Mailboxes,
    /// Fires at shutdown; stops every background timer
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Start the coordinator and its background timers, all stopped by
    /// `cancel`.
    pub fn spawn(
        presence: &PresenceConfig,
        control_token: Option<String>,
        cancel: CancellationToken,
    ) -> Self {
        let dedup = DedupTracker::new(Duration::from_secs(presence.dedup_window_secs));
        dedup.spawn_sweeper(cancel.clone());

        let (coordinator, _actor) =
            coordinator::spawn(CoordinatorSettings::from(presence), dedup, cancel.clone());
        coordinator::spawn_reaper(
            coordinator.clone(),
            Duration::from_secs(presence.reap_interval_secs),
            cancel.clone(),
        );

        let mailboxes = Mailboxes::new();
        poll::spawn_mailbox_sweeper(
            mailboxes.clone(),
            coordinator.clone(),
            Duration::from_secs(presence.stale_after_secs),
            cancel.clone(),
        );

        Self {
            coordinator,
            control: ControlAuth::new(control_token),
            mailboxes,
            shutdown: cancel,
        }
    }
}
