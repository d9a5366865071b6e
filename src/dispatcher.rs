//! Top-level orchestrator: wires the channel adapter, router, election,
//! liveness, and reconciler tasks together. Grounded on
//! `rsky-ingester::bin::ingester`'s `tokio::select!`-over-task-handles
//! pattern, so a fatal task exit is visible and brings the whole process
//! down rather than limping along half-alive.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::election;
use crate::liveness;
use crate::reconciler;
use crate::redis_adapter::channel::RedisChannelAdapter;
use crate::router;
use crate::state::DispatcherState;

/// Run the dispatcher until `shutdown` is cancelled.
pub async fn run(state: Arc<DispatcherState>, channel_adapter: Arc<RedisChannelAdapter>, shutdown: CancellationToken) {
    let rx = channel_adapter.clone().spawn();
    let router_handle = tokio::spawn(router::run(state.clone(), rx));

    election::run(state.clone(), shutdown.clone()).await;
    if shutdown.is_cancelled() {
        router_handle.abort();
        channel_adapter.cancel_token().cancel();
        return;
    }

    info!("Entering active dispatcher steady state");

    let ping_handle = tokio::spawn(liveness::run_ping_loop(state.clone(), shutdown.clone()));
    let activity_handle = tokio::spawn(liveness::run_activity_check_loop(state.clone(), shutdown.clone()));
    let reconciler_handle = tokio::spawn(reconciler::run_loop(state.clone(), shutdown.clone()));

    tokio::select! {
        () = shutdown.cancelled() => {
            info!("Shutdown requested, stopping dispatcher tasks");
        }
        result = router_handle => {
            if let Err(e) = result {
                error!(error = %e, "Router task exited unexpectedly");
            }
            shutdown.cancel();
        }
    }

    state.set_active(false);
    channel_adapter.cancel_token().cancel();
    ping_handle.abort();
    activity_handle.abort();
    reconciler_handle.abort();
}
