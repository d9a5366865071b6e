//! Ping / liveness: periodic ping fan-out and stale-incomer detection, per
//! spec.md §4.4. Grounded on the `tokio::time::interval` periodic-task shape
//! used throughout `rsky-ingester` (its firehose ping task) and
//! `rsky-indexer::stream_indexer`'s shutdown-aware loop.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::eviction;
use crate::model::{now_millis, reserved_events, EventEnvelope, RedisMetadata, Transaction};
use crate::state::DispatcherState;

/// Run the ping task until cancelled: every `pingInterval`, ping every
/// registered incomer (except the dispatcher's own record, which is bumped
/// directly).
pub async fn run_ping_loop(state: Arc<DispatcherState>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => return,
            () = tokio::time::sleep(Duration::from_millis(state.config.ping_interval_ms)) => {}
        }
        if !state.is_active() {
            continue;
        }
        run_ping_round(&state).await;
    }
}

/// Run the activity-check task until cancelled: every
/// `checkLastActivityInterval`, sweep stale incomers and evict survivors of
/// the recent-ping check.
pub async fn run_activity_check_loop(state: Arc<DispatcherState>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => return,
            () = tokio::time::sleep(Duration::from_millis(state.config.check_last_activity_interval_ms)) => {}
        }
        if !state.is_active() {
            continue;
        }
        run_activity_check_round(&state).await;
    }
}

/// One ping round: publish `ping` to every incomer but the dispatcher's own
/// record, writing a dispatcher-side main transaction per target.
pub async fn run_ping_round(state: &Arc<DispatcherState>) {
    let incomers = match state.registry.get_incomers().await {
        Ok(i) => i,
        Err(e) => {
            warn!(error = %e, "Failed to list incomers for ping round");
            return;
        }
    };

    for incomer in incomers.values() {
        if incomer.base_uuid == state.self_provided_uuid {
            if let Err(e) = state.registry.update_incomer_state(&incomer.provided_uuid).await {
                warn!(error = %e, incomer = %incomer.provided_uuid, "Failed to bump self incomer activity");
            }
            continue;
        }

        let metadata = RedisMetadata {
            origin: state.private_uuid.clone(),
            to: Some(incomer.provided_uuid.clone()),
            incomer_name: Some(incomer.name.clone()),
            ..Default::default()
        };
        let envelope = EventEnvelope {
            name: reserved_events::PING.to_string(),
            data: serde_json::Value::Null,
            redis_metadata: metadata.clone(),
        };

        if let Err(e) = state
            .channel
            .publish(&state.config.incomer_channel(&incomer.provided_uuid), &envelope)
            .await
        {
            warn!(error = %e, incomer = %incomer.provided_uuid, "Failed to publish ping");
            continue;
        }

        let transaction = Transaction::new_main(reserved_events::PING.to_string(), serde_json::Value::Null, metadata);
        if let Err(e) = state.dispatcher_store.set(transaction).await {
            warn!(error = %e, incomer = %incomer.provided_uuid, "Failed to record ping transaction");
            continue;
        }

        crate::metrics::PINGS_SENT_TOTAL.inc();
    }
}

/// One activity-check round: evict incomers whose `lastActivity` has lapsed
/// past `idleTime`, unless a recent `ping` response proves otherwise.
pub async fn run_activity_check_round(state: &Arc<DispatcherState>) {
    let incomers = match state.registry.get_incomers().await {
        Ok(i) => i,
        Err(e) => {
            warn!(error = %e, "Failed to list incomers for activity check");
            return;
        }
    };

    crate::metrics::KNOWN_INCOMERS.set(incomers.len() as i64);

    let now = now_millis();
    let idle_time = state.config.idle_time_ms as i64;

    for incomer in incomers.values() {
        if incomer.base_uuid == state.self_provided_uuid {
            continue;
        }
        if now - incomer.last_activity < idle_time {
            continue;
        }

        if recent_ping_proves_alive(state, &incomer.provided_uuid, now, idle_time).await {
            if let Err(e) = state.registry.update_incomer_state(&incomer.provided_uuid).await {
                warn!(error = %e, incomer = %incomer.provided_uuid, "Failed to bump activity after recent ping");
            }
            continue;
        }

        eviction::evict(state, &incomer.provided_uuid).await;
    }
}

/// Look for a `ping` transaction in the incomer's own store whose
/// `aliveSince + idleTime > now`; if found, it proves recent activity and is
/// consumed (deleted) here rather than left for the reconciler.
async fn recent_ping_proves_alive(state: &Arc<DispatcherState>, provided_uuid: &str, now: i64, idle_time: i64) -> bool {
    let store = state.incomer_store(provided_uuid);
    let all = match store.get_all().await {
        Ok(a) => a,
        Err(e) => {
            warn!(error = %e, incomer = %provided_uuid, "Failed to read incomer store during activity check");
            return false;
        }
    };

    let stale_ping = all
        .iter()
        .find(|(_, t)| t.name == reserved_events::PING && t.alive_since + idle_time > now)
        .map(|(id, _)| id.clone());

    match stale_ping {
        Some(id) => {
            if let Err(e) = store.delete(&id).await {
                warn!(error = %e, incomer = %provided_uuid, "Failed to delete stale ping transaction");
            }
            true
        }
        None => false,
    }
}
