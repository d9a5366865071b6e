//! Registration handler: approves new incomers and allocates their private
//! channel, per spec.md §4.5.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::DispatcherError;
use crate::model::{reserved_events, EventEnvelope, EventSubscription, Incomer, RedisMetadata, Transaction};
use crate::state::DispatcherState;

/// Handle a `register` message received on the dispatcher channel.
pub async fn handle_register(
    state: &Arc<DispatcherState>,
    envelope: &EventEnvelope,
) -> Result<(), DispatcherError> {
    let metadata = &envelope.redis_metadata;
    let origin = metadata.origin.clone();

    let transaction_id = metadata.transaction_id.clone().ok_or_else(|| {
        DispatcherError::MalformedMessage("register message missing transactionId".to_string())
    })?;

    let incomer_store = state.incomer_store(&origin);
    let sender_transaction = incomer_store
        .get(&transaction_id)
        .await?
        .ok_or_else(|| DispatcherError::MissingRelatedTransaction(transaction_id.clone()))?;

    let existing = state.registry.get_incomers().await?;
    if existing.values().any(|i| i.base_uuid == origin) {
        warn!(origin = %origin, "Rejecting duplicate registration");
        crate::metrics::REGISTRATIONS_REJECTED_TOTAL.inc();

        if let Some(pending_id) = find_pending_approval(state, &origin, &transaction_id).await? {
            let _ = state.dispatcher_store.delete(&pending_id).await;
        }
        return Err(DispatcherError::DuplicateRegistration(origin));
    }

    let name = envelope
        .data
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let events_cast = parse_events_cast(&envelope.data);
    let events_subscribe = parse_events_subscribe(&envelope.data);

    let incomer = Incomer {
        provided_uuid: String::new(),
        base_uuid: origin.clone(),
        name,
        events_cast,
        events_subscribe,
        prefix: state.config.prefix.clone(),
        alive_since: crate::model::now_millis(),
        last_activity: crate::model::now_millis(),
        is_dispatcher_active_instance: origin == state.self_provided_uuid,
    };

    let provided_uuid = state.registry.set_incomer(incomer).await?;

    state
        .channel
        .ensure_subscribed(&state.config.incomer_channel(&provided_uuid))
        .await?;

    let approvement_metadata = RedisMetadata {
        origin: state.private_uuid.clone(),
        to: Some(provided_uuid.clone()),
        related_transaction: Some(transaction_id.clone()),
        resolved: Some(false),
        ..Default::default()
    };
    let approvement = EventEnvelope {
        name: reserved_events::APPROVEMENT.to_string(),
        data: serde_json::json!({ "uuid": provided_uuid }),
        redis_metadata: approvement_metadata.clone(),
    };

    state
        .channel
        .publish(&state.config.dispatcher_channel(), &approvement)
        .await?;

    let transaction = Transaction::new_child(
        reserved_events::APPROVEMENT.to_string(),
        approvement.data.clone(),
        approvement_metadata,
        transaction_id,
        sender_transaction.iteration,
    );
    state.dispatcher_store.set(transaction).await?;

    info!(provided_uuid = %provided_uuid, origin = %origin, "Incomer registered");
    crate::metrics::REGISTRATIONS_TOTAL.inc();
    Ok(())
}

/// Parse `eventsCast` out of a register envelope's `data`, as the original's
/// `approveIncomer` does.
fn parse_events_cast(data: &serde_json::Value) -> HashSet<String> {
    data.get("eventsCast")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default()
}

/// Parse `eventsSubscribe` out of a register envelope's `data`.
fn parse_events_subscribe(data: &serde_json::Value) -> Vec<EventSubscription> {
    data.get("eventsSubscribe")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

/// Find a still-pending dispatcher-side `approvement` transaction keyed to
/// this registration attempt, so it can be deleted on a rejected duplicate.
async fn find_pending_approval(
    state: &Arc<DispatcherState>,
    origin: &str,
    transaction_id: &str,
) -> Result<Option<String>, DispatcherError> {
    let all = state.dispatcher_store.get_all().await?;
    Ok(all
        .iter()
        .find(|(_, t)| {
            t.name == reserved_events::APPROVEMENT
                && t.related_transaction.as_deref() == Some(transaction_id)
                && t.redis_metadata.origin == origin
        })
        .map(|(id, _)| id.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redis_adapter::channel::FakeChannelAdapter;
    use crate::redis_adapter::kv::FakeKvStore;
    use crate::validation::Validators;
    use std::collections::HashMap;

    async fn new_state() -> Arc<DispatcherState> {
        let channel = Arc::new(FakeChannelAdapter::new());
        let kv = Arc::new(FakeKvStore::new());
        let validators = Validators::new(HashMap::new(), None).unwrap();
        DispatcherState::new(crate::config::DispatcherConfig::default(), channel, kv, validators)
    }

    #[tokio::test]
    async fn register_allocates_provided_uuid_and_publishes_approvement() {
        let state = new_state().await;
        let origin = "base-1".to_string();
        let incomer_store = state.incomer_store(&origin);
        let (txn_id, _) = incomer_store
            .set(Transaction::new_main(
                reserved_events::REGISTER.to_string(),
                serde_json::json!({"name": "foo"}),
                RedisMetadata { origin: origin.clone(), ..Default::default() },
            ))
            .await
            .unwrap();

        let envelope = EventEnvelope {
            name: reserved_events::REGISTER.to_string(),
            data: serde_json::json!({"name": "foo"}),
            redis_metadata: RedisMetadata {
                origin: origin.clone(),
                transaction_id: Some(txn_id),
                ..Default::default()
            },
        };

        handle_register(&state, &envelope).await.unwrap();

        let incomers = state.registry.get_incomers().await.unwrap();
        assert_eq!(incomers.len(), 1);
        assert_eq!(incomers.values().next().unwrap().base_uuid, origin);
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let state = new_state().await;
        let origin = "base-1".to_string();
        let incomer_store = state.incomer_store(&origin);
        let (txn_id, _) = incomer_store
            .set(Transaction::new_main(
                reserved_events::REGISTER.to_string(),
                serde_json::json!({"name": "foo"}),
                RedisMetadata { origin: origin.clone(), ..Default::default() },
            ))
            .await
            .unwrap();
        let envelope = EventEnvelope {
            name: reserved_events::REGISTER.to_string(),
            data: serde_json::json!({"name": "foo"}),
            redis_metadata: RedisMetadata {
                origin: origin.clone(),
                transaction_id: Some(txn_id.clone()),
                ..Default::default()
            },
        };
        handle_register(&state, &envelope).await.unwrap();

        let (txn_id_2, _) = incomer_store
            .set(Transaction::new_main(
                reserved_events::REGISTER.to_string(),
                serde_json::json!({"name": "foo"}),
                RedisMetadata { origin: origin.clone(), ..Default::default() },
            ))
            .await
            .unwrap();
        let envelope_2 = EventEnvelope {
            name: reserved_events::REGISTER.to_string(),
            data: serde_json::json!({"name": "foo"}),
            redis_metadata: RedisMetadata {
                origin,
                transaction_id: Some(txn_id_2),
                ..Default::default()
            },
        };
        let err = handle_register(&state, &envelope_2).await.unwrap_err();
        assert!(matches!(err, DispatcherError::DuplicateRegistration(_)));
        assert_eq!(state.registry.get_incomers().await.unwrap().len(), 1);
    }
}
