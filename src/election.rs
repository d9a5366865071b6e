//! Leader election & relay. Detects a live peer dispatcher, negotiates the
//! active role, and takes relay on failure, per spec.md §4.3. The two
//! mutually-cancelling signals spec.md §5 describes (a "timeout" signal
//! firing on a foreign `OK`, a "task" signal firing when the jittered
//! announcement commits) are modeled with `tokio::select!` racing a
//! `tokio::time::sleep` against a `broadcast::Receiver`, the same shape as
//! the jittered reconnect race in `other_examples`' synctv Redis pub/sub
//! service.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::model::{now_millis, reserved_events, EventEnvelope, Incomer, RedisMetadata};
use crate::reconciler;
use crate::state::DispatcherState;
use crate::store::incomer_registry::IncomerMap;

/// Find a peer dispatcher record of the same `instanceName` group that
/// isn't this process and is currently marked active.
fn find_active_peer(registry: &IncomerMap, instance_name: &str, self_base_uuid: &str) -> Option<Incomer> {
    registry
        .values()
        .find(|i| {
            i.name == instance_name
                && i.base_uuid != self_base_uuid
                && i.is_dispatcher_active_instance
        })
        .cloned()
}

fn is_fresh(incomer: &Incomer, idle_time_ms: u64) -> bool {
    now_millis() - incomer.last_activity < idle_time_ms as i64
}

/// Run leader election to completion: blocks until this process becomes the
/// active dispatcher (by winning an initial race or a relay takeover), or
/// returns early if `shutdown` is cancelled first.
pub async fn run(state: Arc<DispatcherState>, shutdown: CancellationToken) {
    let _ = state
        .channel
        .ensure_subscribed(&state.config.dispatcher_channel())
        .await;

    loop {
        if shutdown.is_cancelled() {
            return;
        }

        let registry = match state.registry.get_incomers().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "Failed to read incomer registry during election, retrying");
                tokio::time::sleep(Duration::from_millis(state.config.ping_interval_ms)).await;
                continue;
            }
        };

        let peer = find_active_peer(&registry, &state.config.instance_name, &state.self_provided_uuid);

        let stale_peer = match &peer {
            Some(p) if is_fresh(p, state.config.idle_time_ms) => {
                // A live peer holds the role; stay standby.
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    () = tokio::time::sleep(Duration::from_millis(state.config.ping_interval_ms)) => {}
                }
                continue;
            }
            Some(p) => Some(p.clone()),
            None => None,
        };

        if attempt_become_active(&state, &shutdown).await {
            if let Some(stale) = stale_peer {
                info!(peer = %stale.provided_uuid, "Won relay takeover, evicting stale peer dispatcher record");
                let _ = state.registry.delete_incomer(&stale.provided_uuid).await;
            } else {
                info!("Won initial leader election");
            }

            subscribe_all_incomers(&state).await;
            crate::liveness::run_ping_round(&state).await;

            tokio::select! {
                () = shutdown.cancelled() => return,
                () = tokio::time::sleep(Duration::from_millis(state.config.check_transaction_interval_ms)) => {}
            }
            reconciler::run_once(&state).await;
            return;
        }

        // Lost the race; stay standby and re-check on the next tick.
        tokio::select! {
            () = shutdown.cancelled() => return,
            () = tokio::time::sleep(Duration::from_millis(state.config.ping_interval_ms)) => {}
        }
    }
}

/// Race a jittered self-announcement against listening for a foreign `OK`.
/// Returns `true` if this process becomes active.
async fn attempt_become_active(state: &Arc<DispatcherState>, shutdown: &CancellationToken) -> bool {
    let min = state.config.min_timeout_ms;
    let max = state.config.max_timeout_ms.max(min);
    let jitter_ms = if max > min {
        rand::thread_rng().gen_range(min..=max)
    } else {
        min
    };

    let mut ok_rx = state.ok_announcements.subscribe();

    tokio::select! {
        () = shutdown.cancelled() => false,
        _ = wait_foreign_ok(&mut ok_rx, &state.private_uuid) => {
            info!("Foreign OK observed first, aborting election attempt");
            false
        }
        () = tokio::time::sleep(Duration::from_millis(jitter_ms)) => {
            mark_self_active(state).await;
            publish_ok(state).await;
            state.set_active(true);
            true
        }
    }
}

async fn wait_foreign_ok(rx: &mut broadcast::Receiver<String>, self_origin: &str) {
    loop {
        match rx.recv().await {
            Ok(origin) if origin != self_origin => return,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => {
                std::future::pending::<()>().await;
            }
        }
    }
}

async fn mark_self_active(state: &Arc<DispatcherState>) {
    if let Ok(all) = state.registry.get_incomers().await {
        if let Some(mut incomer) = all
            .values()
            .find(|i| i.base_uuid == state.self_provided_uuid)
            .cloned()
        {
            incomer.is_dispatcher_active_instance = true;
            let _ = state.registry.update_incomer(incomer).await;
        }
    }
}

async fn publish_ok(state: &Arc<DispatcherState>) {
    let envelope = EventEnvelope {
        name: reserved_events::OK.to_string(),
        data: serde_json::Value::Null,
        redis_metadata: RedisMetadata {
            origin: state.private_uuid.clone(),
            ..Default::default()
        },
    };
    if let Err(e) = state
        .channel
        .publish(&state.config.dispatcher_channel(), &envelope)
        .await
    {
        warn!(error = %e, "Failed to publish OK announcement");
    }
}

async fn subscribe_all_incomers(state: &Arc<DispatcherState>) {
    let incomers = match state.registry.get_incomers().await {
        Ok(i) => i,
        Err(e) => {
            warn!(error = %e, "Failed to list incomers while subscribing to their channels");
            return;
        }
    };
    for incomer in incomers.values() {
        let _ = state
            .channel
            .ensure_subscribed(&state.config.incomer_channel(&incomer.provided_uuid))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_peer_detection() {
        let fresh = Incomer {
            provided_uuid: "p".into(),
            base_uuid: "other".into(),
            name: "dispatcher".into(),
            events_cast: Default::default(),
            events_subscribe: vec![],
            prefix: String::new(),
            alive_since: now_millis(),
            last_activity: now_millis(),
            is_dispatcher_active_instance: true,
        };
        assert!(is_fresh(&fresh, 600_000));

        let mut stale = fresh.clone();
        stale.last_activity = now_millis() - 700_000;
        assert!(!is_fresh(&stale, 600_000));
    }

    #[test]
    fn find_active_peer_ignores_self_and_other_groups() {
        let mut registry = IncomerMap::new();
        registry.insert(
            "self".into(),
            Incomer {
                provided_uuid: "self".into(),
                base_uuid: "self-base".into(),
                name: "dispatcher".into(),
                events_cast: Default::default(),
                events_subscribe: vec![],
                prefix: String::new(),
                alive_since: now_millis(),
                last_activity: now_millis(),
                is_dispatcher_active_instance: true,
            },
        );
        assert!(find_active_peer(&registry, "dispatcher", "self-base").is_none());

        registry.insert(
            "peer".into(),
            Incomer {
                provided_uuid: "peer".into(),
                base_uuid: "peer-base".into(),
                name: "other-group".into(),
                events_cast: Default::default(),
                events_subscribe: vec![],
                prefix: String::new(),
                alive_since: now_millis(),
                last_activity: now_millis(),
                is_dispatcher_active_instance: true,
            },
        );
        assert!(find_active_peer(&registry, "dispatcher", "self-base").is_none());
    }
}
