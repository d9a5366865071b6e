//! Transaction reconciler, per spec.md §4.7. Grounded on
//! `rsky-indexer::stream_indexer::StreamIndexer::run`'s non-overlapping,
//! shutdown-aware poll loop: reconciliation passes never overlap with
//! themselves on one process, enforced here with a `tokio::sync::Mutex`
//! guard rather than relying on single-threaded scheduling.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::model::{reserved_events, Incomer, RedisMetadata, Transaction};
use crate::state::DispatcherState;

/// Run the reconciliation task until cancelled, once per
/// `checkTransactionInterval`, guarded against re-entrancy.
pub async fn run_loop(state: Arc<DispatcherState>, shutdown: CancellationToken) {
    let guard = Arc::new(Mutex::new(()));
    loop {
        tokio::select! {
            () = shutdown.cancelled() => return,
            () = tokio::time::sleep(Duration::from_millis(state.config.check_transaction_interval_ms)) => {}
        }
        if !state.is_active() {
            continue;
        }
        let _permit = guard.clone().lock_owned().await;
        run_once(&state).await;
    }
}

/// One full reconciliation pass: redistribute backups, resolve pairs,
/// resolve mains.
pub async fn run_once(state: &Arc<DispatcherState>) {
    crate::metrics::RECONCILIATION_PASSES_TOTAL.inc();
    redistribute_backups(state).await;
    resolve_pairs(state).await;
    resolve_mains(state).await;
}

async fn find_subscriber_for(state: &Arc<DispatcherState>, event_name: &str) -> Option<Incomer> {
    let all = state.registry.get_incomers().await.ok()?;
    all.values().find(|i| i.subscribes(event_name)).cloned()
}

async fn find_caster_for(state: &Arc<DispatcherState>, name: &str, event_name: &str) -> Option<Incomer> {
    let all = state.registry.get_incomers().await.ok()?;
    all.values()
        .find(|i| i.name == name && i.casts(event_name))
        .cloned()
}

/// §4.7(a): redistribute backup incomer and backup dispatcher transactions.
async fn redistribute_backups(state: &Arc<DispatcherState>) {
    let backups = match state.backup_incomer_store.get_all().await {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, "Failed to read backup incomer store");
            return;
        }
    };

    for (id, transaction) in backups {
        if transaction.main_transaction {
            let owner_name = transaction.redis_metadata.incomer_name.clone().unwrap_or_default();
            if let Some(target) = find_caster_for(state, &owner_name, &transaction.name).await {
                let target_store = state.incomer_store(&target.provided_uuid);
                if target_store.set(transaction.clone()).await.is_ok() {
                    let _ = state.backup_incomer_store.delete(&id).await;
                }
            }
            continue;
        }

        if let Some(related) = transaction.related_transaction.clone() {
            if let Some(target) = find_subscriber_for(state, &transaction.name).await {
                if !transaction.resolved {
                    let metadata = RedisMetadata {
                        origin: state.private_uuid.clone(),
                        to: Some(target.provided_uuid.clone()),
                        incomer_name: Some(target.name.clone()),
                        ..Default::default()
                    };
                    let envelope = crate::model::EventEnvelope {
                        name: transaction.name.clone(),
                        data: transaction.data.clone(),
                        redis_metadata: metadata.clone(),
                    };
                    if state
                        .channel
                        .publish(&state.config.incomer_channel(&target.provided_uuid), &envelope)
                        .await
                        .is_ok()
                    {
                        let child = Transaction::new_child(
                            transaction.name.clone(),
                            transaction.data.clone(),
                            metadata,
                            related.clone(),
                            transaction.iteration + 1,
                        );
                        if state.dispatcher_store.set(child).await.is_ok() {
                            let _ = state.backup_incomer_store.delete(&id).await;
                            let _ = state.backup_dispatcher_store.delete(&related).await;
                        }
                    }
                } else {
                    let target_store = state.incomer_store(&target.provided_uuid);
                    if target_store.set(transaction.clone()).await.is_ok() {
                        let _ = state.backup_incomer_store.delete(&id).await;
                    }
                }
            }
        }
    }

    let dispatcher_backups = match state.backup_dispatcher_store.get_all().await {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, "Failed to read backup dispatcher store");
            return;
        }
    };
    for (id, transaction) in dispatcher_backups {
        if let Some(target) = find_subscriber_for(state, &transaction.name).await {
            let metadata = RedisMetadata {
                origin: state.private_uuid.clone(),
                to: Some(target.provided_uuid.clone()),
                incomer_name: Some(target.name.clone()),
                ..transaction.redis_metadata.clone()
            };
            let envelope = crate::model::EventEnvelope {
                name: transaction.name.clone(),
                data: transaction.data.clone(),
                redis_metadata: metadata.clone(),
            };
            if state
                .channel
                .publish(&state.config.incomer_channel(&target.provided_uuid), &envelope)
                .await
                .is_ok()
            {
                let mut republished = transaction.clone();
                republished.redis_metadata = metadata;
                republished.iteration += 1;
                if state.dispatcher_store.set(republished).await.is_ok() {
                    let _ = state.backup_dispatcher_store.delete(&id).await;
                }
            }
        }
    }
}

/// §4.7(b): match each dispatcher transaction against the recipient's
/// resolved response and clear both sides.
async fn resolve_pairs(state: &Arc<DispatcherState>) {
    let dispatcher_all = match state.dispatcher_store.get_all().await {
        Ok(a) => a,
        Err(e) => {
            warn!(error = %e, "Failed to read dispatcher store during pair resolution");
            return;
        }
    };

    for (dispatcher_id, mut transaction) in dispatcher_all {
        let Some(recipient_uuid) = transaction.redis_metadata.to.clone() else { continue };
        let Ok(Some(recipient)) = state.registry.get_incomer(&recipient_uuid).await else { continue };

        let recipient_store = state.incomer_store(&recipient_uuid);
        let recipient_all = match recipient_store.get_all().await {
            Ok(a) => a,
            Err(_) => continue,
        };
        let matched = recipient_all
            .iter()
            .find(|(_, i)| i.related_transaction.as_deref() == Some(&dispatcher_id) && i.resolved)
            .map(|(id, _)| id.clone());

        let Some(incomer_txn_id) = matched else { continue };

        if transaction.main_transaction {
            // Self-originated ping, answered.
            let _ = state.dispatcher_store.delete(&dispatcher_id).await;
            let _ = recipient_store.delete(&incomer_txn_id).await;
            let _ = state.registry.update_incomer_state(&recipient_uuid).await;
            continue;
        }

        if transaction.name == reserved_events::APPROVEMENT {
            let _ = state.dispatcher_store.delete(&dispatcher_id).await;
            let _ = recipient_store.delete(&incomer_txn_id).await;
            continue;
        }

        transaction.resolved = true;
        let _ = state.dispatcher_store.update(&dispatcher_id, transaction).await;
        let _ = recipient_store.delete(&incomer_txn_id).await;
        let _ = state.registry.update_incomer_state(&recipient_uuid).await;
        crate::metrics::RECONCILIATION_RESOLVED_TOTAL.inc();
    }
}

/// §4.7(c): for every live incomer's main transactions, check whether all
/// dispatcher children are resolved and, if so, clear the whole group.
async fn resolve_mains(state: &Arc<DispatcherState>) {
    let incomers = match state.registry.get_incomers().await {
        Ok(i) => i,
        Err(e) => {
            warn!(error = %e, "Failed to read registry during main resolution");
            return;
        }
    };

    for incomer in incomers.values() {
        let store = state.incomer_store(&incomer.provided_uuid);
        let all = match store.get_all().await {
            Ok(a) => a,
            Err(_) => continue,
        };

        for (main_id, main_txn) in all {
            if !main_txn.main_transaction {
                continue;
            }

            let dispatcher_all = match state.dispatcher_store.get_all().await {
                Ok(a) => a,
                Err(_) => continue,
            };
            let mut children: Vec<(String, Transaction)> = dispatcher_all
                .into_iter()
                .filter(|(_, t)| t.related_transaction.as_deref() == Some(&main_id))
                .collect();

            let backup_all = state.backup_dispatcher_store.get_all().await.unwrap_or_default();
            let backup_children: Vec<(String, Transaction)> = backup_all
                .into_iter()
                .filter(|(_, t)| t.related_transaction.as_deref() == Some(&main_id))
                .collect();

            let mut backups_remain = backup_children.len();
            for (backup_id, backup_txn) in backup_children {
                if let Some(target) = find_subscriber_for(state, &backup_txn.name).await {
                    let metadata = RedisMetadata {
                        origin: state.private_uuid.clone(),
                        to: Some(target.provided_uuid.clone()),
                        incomer_name: Some(target.name.clone()),
                        ..Default::default()
                    };
                    let envelope = crate::model::EventEnvelope {
                        name: backup_txn.name.clone(),
                        data: backup_txn.data.clone(),
                        redis_metadata: metadata.clone(),
                    };
                    if state
                        .channel
                        .publish(&state.config.incomer_channel(&target.provided_uuid), &envelope)
                        .await
                        .is_ok()
                    {
                        let republished = Transaction::new_child(
                            backup_txn.name.clone(),
                            backup_txn.data.clone(),
                            metadata,
                            main_id.clone(),
                            backup_txn.iteration + 1,
                        );
                        if state.dispatcher_store.set(republished).await.is_ok() {
                            let _ = state.backup_dispatcher_store.delete(&backup_id).await;
                            backups_remain -= 1;
                        }
                    }
                }
            }

            let any_unresolved = children.iter().any(|(_, t)| !t.resolved);
            if any_unresolved || backups_remain > 0 {
                continue;
            }

            for (child_id, _) in children.drain(..) {
                let _ = state.dispatcher_store.delete(&child_id).await;
            }
            let _ = store.delete(&main_id).await;
            let _ = state.registry.update_incomer_state(&incomer.provided_uuid).await;
        }
    }
}
