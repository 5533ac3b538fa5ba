use axum::{middleware, routing::{get, post}, Router};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_governor::key_extractor::PeerIpKeyExtractor;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};

use crate::http::{control, maintenance, poll, presence};
use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// Build the full axum Router with all routes and middleware.
///
/// Serve it with `into_make_service_with_connect_info::<SocketAddr>()`: the
/// control rate limiter keys on the peer address.
pub fn build_router(state: AppState) -> Router {
    // Rate limiting on the control endpoint: 10 requests per minute per IP
    let control_governor_config = Arc::new(
        GovernorConfigBuilder::default()
            .key_extractor(PeerIpKeyExtractor)
            .per_second(6) // 1 token every 6 seconds = 10 per minute
            .burst_size(10)
            .finish()
            .unwrap_or_default(),
    );
    let control_limiter = control_governor_config.limiter().clone();

    // Clean up rate limiter state until shutdown
    spawn_periodic(Duration::from_secs(60), state.shutdown.clone(), move || {
        control_limiter.retain_recent();
    });

    let control_routes = Router::new()
        .route("/control", post(control::control))
        .layer(GovernorLayer {
            config: control_governor_config,
        });

    // Read-only fallback queries for clients without a persistent channel
    let query_routes = Router::new()
        .route("/presence/count", get(presence::presence_count))
        .route("/freeze-state", get(presence::freeze_state))
        .route("/room/{family}/{id}/count", get(presence::room_count));

    // Polling transport
    let poll_routes = Router::new()
        .route("/poll/connect", post(poll::connect))
        .route("/poll/{id}", get(poll::poll))
        .route("/poll/{id}/emit", post(poll::emit))
        .route("/poll/{id}/heartbeat", post(poll::heartbeat))
        .route("/poll/{id}/disconnect", post(poll::disconnect));

    let ws_routes = Router::new().route("/ws", get(ws_handler::ws_upgrade));

    // Monitoring, reachable during maintenance
    let monitor_routes = Router::new()
        .route("/health", get(presence::health_check))
        .route("/status", get(presence::status));

    Router::new()
        .merge(control_routes)
        .merge(query_routes)
        .merge(poll_routes)
        .merge(ws_routes)
        .merge(monitor_routes)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            maintenance::maintenance_gate,
        ))
        .with_state(state)
}

/// Run `task` every `period` until `cancel` fires. The first run happens one
/// period after spawning.
fn spawn_periodic(
    period: Duration,
    cancel: CancellationToken,
    mut task: impl FnMut() + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => task(),
            }
        }
    })
}
