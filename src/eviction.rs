//! Eviction / orphan resolution, per spec.md §4.6. Invoked by the liveness
//! activity-check pass and by relay takeover when a peer dispatcher is found
//! dead.

use std::sync::Arc;

use tracing::{info, warn};

use crate::model::{reserved_events, Incomer, RedisMetadata, Transaction};
use crate::state::DispatcherState;

/// Evict incomer `provided_uuid`: remove it from the registry and migrate,
/// re-home, or back up everything it was holding.
pub async fn evict(state: &Arc<DispatcherState>, provided_uuid: &str) {
    let incomer = match state.registry.get_incomer(provided_uuid).await {
        Ok(Some(i)) => i,
        Ok(None) => return,
        Err(e) => {
            warn!(error = %e, incomer = %provided_uuid, "Failed to load incomer for eviction");
            return;
        }
    };

    if let Err(e) = state.registry.delete_incomer(provided_uuid).await {
        warn!(error = %e, incomer = %provided_uuid, "Failed to delete evicted incomer from registry");
    }

    walk_incomer_store(state, &incomer).await;
    walk_dispatcher_store_for_target(state, provided_uuid).await;

    info!(incomer = %provided_uuid, name = %incomer.name, "Evicted incomer");
    crate::metrics::EVICTIONS_TOTAL.inc();
}

async fn walk_incomer_store(state: &Arc<DispatcherState>, incomer: &Incomer) {
    let store = state.incomer_store(&incomer.provided_uuid);
    let all = match store.get_all().await {
        Ok(a) => a,
        Err(e) => {
            warn!(error = %e, incomer = %incomer.provided_uuid, "Failed to read incomer store during eviction");
            return;
        }
    };

    let survivor = find_surviving_sibling(state, incomer).await;

    for (id, transaction) in all {
        if transaction.name == reserved_events::PING {
            let _ = store.delete(&id).await;
            if let Some(related) = transaction.related_transaction.as_deref() {
                let _ = state.dispatcher_store.delete(related).await;
            }
            continue;
        }

        if transaction.name == reserved_events::REGISTER && transaction.main_transaction {
            let _ = store.delete(&id).await;
            if let Some(approval_id) = find_dispatcher_transaction_related_to(state, &id).await {
                let _ = state.dispatcher_store.delete(&approval_id).await;
            }
            continue;
        }

        if transaction.main_transaction {
            match &survivor {
                Some(target) if target.casts(&transaction.name) => {
                    migrate_main_to(state, &store, &id, &transaction, target).await;
                }
                _ => {
                    let _ = store.delete(&id).await;
                    let mut backed_up = transaction.clone();
                    backed_up.redis_metadata.incomer_name = Some(incomer.name.clone());
                    let _ = state.backup_incomer_store.set(backed_up).await;
                }
            }
            continue;
        }

        // Related (non-main) transaction: the incomer's own response to a
        // dispatcher-originated event. Re-home if someone else subscribes.
        if let Some(target) = find_subscriber_for(state, &transaction.name, Some(&incomer.provided_uuid)).await {
            if let Some(related) = transaction.related_transaction.clone() {
                let _ = republish_to(state, &target, &transaction, &related).await;
            }
            let _ = store.delete(&id).await;
        } else if !transaction.resolved {
            let _ = store.delete(&id).await;
            let _ = state.backup_incomer_store.set(transaction.clone()).await;
        } else {
            let _ = store.delete(&id).await;
        }
    }
}

async fn find_dispatcher_transaction_related_to(state: &Arc<DispatcherState>, related_id: &str) -> Option<String> {
    let all = state.dispatcher_store.get_all().await.ok()?;
    all.iter()
        .find(|(_, t)| t.related_transaction.as_deref() == Some(related_id))
        .map(|(id, _)| id.clone())
}

/// Find the first live incomer (other than `exclude`) sharing `incomer`'s
/// `name` group — a candidate to inherit an evicted sibling's work.
async fn find_surviving_sibling(state: &Arc<DispatcherState>, incomer: &Incomer) -> Option<Incomer> {
    let all = state.registry.get_incomers().await.ok()?;
    all.values()
        .find(|i| i.provided_uuid != incomer.provided_uuid && i.name == incomer.name)
        .cloned()
}

/// First-match subscriber to `event_name`, per spec.md §4.7's documented
/// tie-break ("first-match in registry iteration order").
async fn find_subscriber_for(
    state: &Arc<DispatcherState>,
    event_name: &str,
    exclude: Option<&str>,
) -> Option<Incomer> {
    let all = state.registry.get_incomers().await.ok()?;
    all.values()
        .find(|i| Some(i.provided_uuid.as_str()) != exclude && i.subscribes(event_name))
        .cloned()
}

/// Move a main transaction to `target`'s store, rewriting `origin`, then
/// rewrite every dispatcher child that pointed at the old main to point at
/// the new one.
async fn migrate_main_to(
    state: &Arc<DispatcherState>,
    old_store: &crate::store::transaction_store::TransactionStore,
    old_id: &str,
    transaction: &Transaction,
    target: &Incomer,
) {
    let mut migrated = transaction.clone();
    migrated.redis_metadata.origin = target.base_uuid.clone();
    let target_store = state.incomer_store(&target.provided_uuid);
    let (new_id, _) = match target_store.set(migrated).await {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "Failed to migrate main transaction to surviving sibling");
            return;
        }
    };

    let _ = old_store.delete(old_id).await;

    let dispatcher_all = match state.dispatcher_store.get_all().await {
        Ok(a) => a,
        Err(_) => return,
    };
    for (dispatcher_id, mut child) in dispatcher_all {
        if child.related_transaction.as_deref() == Some(old_id) {
            child.related_transaction = Some(new_id.clone());
            child.main_transaction = false;
            child.redis_metadata.to = Some(target.provided_uuid.clone());
            let _ = state.dispatcher_store.update(&dispatcher_id, child).await;
        }
    }
}

async fn republish_to(
    state: &Arc<DispatcherState>,
    target: &Incomer,
    original: &Transaction,
    related_transaction: &str,
) -> Option<()> {
    let metadata = RedisMetadata {
        origin: state.private_uuid.clone(),
        to: Some(target.provided_uuid.clone()),
        incomer_name: Some(target.name.clone()),
        ..Default::default()
    };
    let envelope = crate::model::EventEnvelope {
        name: original.name.clone(),
        data: original.data.clone(),
        redis_metadata: metadata.clone(),
    };
    state
        .channel
        .publish(&state.config.incomer_channel(&target.provided_uuid), &envelope)
        .await
        .ok()?;

    let child = Transaction::new_child(
        original.name.clone(),
        original.data.clone(),
        metadata,
        related_transaction.to_string(),
        original.iteration + 1,
    );
    state.dispatcher_store.set(child).await.ok()?;
    Some(())
}

async fn walk_dispatcher_store_for_target(state: &Arc<DispatcherState>, provided_uuid: &str) {
    let all = match state.dispatcher_store.get_all().await {
        Ok(a) => a,
        Err(e) => {
            warn!(error = %e, "Failed to read dispatcher store during eviction");
            return;
        }
    };

    for (id, transaction) in all {
        if transaction.redis_metadata.to.as_deref() != Some(provided_uuid) {
            continue;
        }

        if transaction.name == reserved_events::PING || transaction.name == reserved_events::APPROVEMENT {
            let _ = state.dispatcher_store.delete(&id).await;
            continue;
        }

        if let Some(target) = find_subscriber_for(state, &transaction.name, None).await {
            let envelope = crate::model::EventEnvelope {
                name: transaction.name.clone(),
                data: transaction.data.clone(),
                redis_metadata: RedisMetadata {
                    origin: state.private_uuid.clone(),
                    to: Some(target.provided_uuid.clone()),
                    incomer_name: Some(target.name.clone()),
                    ..Default::default()
                },
            };
            if state
                .channel
                .publish(&state.config.incomer_channel(&target.provided_uuid), &envelope)
                .await
                .is_ok()
            {
                let mut rehomed = transaction.clone();
                rehomed.redis_metadata.to = Some(target.provided_uuid.clone());
                rehomed.redis_metadata.incomer_name = Some(target.name.clone());
                rehomed.iteration += 1;
                let _ = state.dispatcher_store.update(&id, rehomed).await;
                continue;
            }
        }

        let _ = state.dispatcher_store.delete(&id).await;
        let _ = state.backup_dispatcher_store.set(transaction.clone()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::now_millis;
    use crate::redis_adapter::channel::FakeChannelAdapter;
    use crate::redis_adapter::kv::FakeKvStore;
    use crate::validation::Validators;
    use std::collections::{HashMap, HashSet};

    fn state() -> Arc<DispatcherState> {
        let channel = Arc::new(FakeChannelAdapter::new());
        let kv = Arc::new(FakeKvStore::new());
        let validators = Validators::new(HashMap::new(), None).unwrap();
        DispatcherState::new(crate::config::DispatcherConfig::default(), channel, kv, validators)
    }

    fn incomer(provided_uuid: &str, name: &str, casts: &[&str]) -> Incomer {
        Incomer {
            provided_uuid: provided_uuid.to_string(),
            base_uuid: format!("base-{provided_uuid}"),
            name: name.to_string(),
            events_cast: casts.iter().map(|s| s.to_string()).collect::<HashSet<_>>(),
            events_subscribe: vec![],
            prefix: String::new(),
            alive_since: now_millis(),
            last_activity: now_millis(),
            is_dispatcher_active_instance: false,
        }
    }

    #[tokio::test]
    async fn evicting_unknown_incomer_is_a_no_op() {
        let state = state();
        evict(&state, "nonexistent").await;
    }

    #[tokio::test]
    async fn main_transaction_migrates_to_surviving_sibling() {
        let state = state();
        let dying = incomer("dying", "foo", &["accountingFolder"]);
        let survivor = incomer("alive", "foo", &["accountingFolder"]);
        let dying_uuid = state.registry.set_incomer(dying).await.unwrap();
        let survivor_uuid = state.registry.set_incomer(survivor).await.unwrap();

        let dying_store = state.incomer_store(&dying_uuid);
        let main = Transaction::new_main(
            "accountingFolder".to_string(),
            serde_json::json!({"id": "1"}),
            RedisMetadata { origin: format!("base-{dying_uuid}"), ..Default::default() },
        );
        let (main_id, _) = dying_store.set(main).await.unwrap();

        evict(&state, &dying_uuid).await;

        assert!(state.registry.get_incomer(&dying_uuid).await.unwrap().is_none());
        let survivor_store = state.incomer_store(&survivor_uuid);
        let migrated = survivor_store.get_all().await.unwrap();
        assert_eq!(migrated.len(), 1);
        assert!(dying_store.get(&main_id).await.unwrap().is_none());
    }
}
