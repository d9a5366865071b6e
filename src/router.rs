//! Event router, per spec.md §4.8. Receives messages from the dispatcher
//! channel and per-incomer channels, validates them, and fans out to
//! subscribers. Dispatch is a single match on `(channel, name)`, collapsing
//! the source's type predicates per spec.md §9's "polymorphism over message
//! shape" note.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::DispatcherError;
use crate::model::{reserved_events, EventEnvelope, Incomer, RedisMetadata, Transaction};
use crate::redis_adapter::channel::IncomingMessage;
use crate::registration;
use crate::state::DispatcherState;

/// Drain the channel adapter's receiver until the sender side closes
/// (shutdown), validating and routing every message.
pub async fn run(state: Arc<DispatcherState>, mut rx: mpsc::Receiver<IncomingMessage>) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = handle_message(&state, &message).await {
            warn!(channel = %message.channel, event = %message.envelope.name, error = %e, "Failed to route message");
        }
    }
}

async fn handle_message(state: &Arc<DispatcherState>, message: &IncomingMessage) -> Result<(), DispatcherError> {
    let envelope = &message.envelope;
    let origin = envelope.redis_metadata.origin.clone();

    if envelope.name == reserved_events::OK {
        if origin != state.private_uuid {
            let _ = state.ok_announcements.send(origin);
        }
        return Ok(());
    }

    if !state.is_active() {
        return Ok(());
    }

    if origin == state.private_uuid {
        return Ok(());
    }

    if let Err(e) = validate(state, envelope) {
        crate::metrics::VALIDATION_REJECTIONS_TOTAL.inc();
        return Err(e);
    }

    if message.channel == state.config.dispatcher_channel() {
        if envelope.name == reserved_events::REGISTER {
            return registration::handle_register(state, envelope).await;
        }
        debug!(event = %envelope.name, "Ignoring non-register message on dispatcher channel");
        return Ok(());
    }

    fan_out(state, envelope).await
}

fn validate(state: &Arc<DispatcherState>, envelope: &EventEnvelope) -> Result<(), DispatcherError> {
    state.validators.validate_metadata(&serde_json::to_value(&envelope.redis_metadata)?)?;
    state.validators.validate_event(&envelope.name, &envelope.data)?;
    Ok(())
}

/// §4.8 "Fan-out": validate the sender's main transaction exists, select and
/// filter subscribers, then publish a dispatcher-side child per target (or
/// park a backup if nobody subscribes).
async fn fan_out(state: &Arc<DispatcherState>, envelope: &EventEnvelope) -> Result<(), DispatcherError> {
    let metadata = &envelope.redis_metadata;
    let origin = metadata.origin.clone();
    let transaction_id = metadata
        .transaction_id
        .clone()
        .ok_or_else(|| DispatcherError::MalformedMessage("missing transactionId".to_string()))?;

    let sender_store = state.incomer_store(&origin);
    let mut sender_main = sender_store
        .get(&transaction_id)
        .await?
        .ok_or_else(|| DispatcherError::MissingRelatedTransaction(transaction_id.clone()))?;

    let incomers = state.registry.get_incomers().await?;
    let targets = select_targets(&incomers, &envelope.name);

    if targets.is_empty() {
        if envelope.name == reserved_events::PING {
            debug!(event = %envelope.name, "Dropping ping with no subscribers");
            return Ok(());
        }
        sender_main.published = true;
        sender_store.update(&transaction_id, sender_main).await?;
        let backup = Transaction::new_child(
            envelope.name.clone(),
            envelope.data.clone(),
            RedisMetadata {
                origin: state.private_uuid.clone(),
                to: Some(String::new()),
                ..Default::default()
            },
            transaction_id,
            0,
        );
        state.backup_dispatcher_store.set(backup).await?;
        crate::metrics::EVENTS_BACKED_UP_TOTAL.inc();
        return Ok(());
    }

    for target in &targets {
        state
            .channel
            .ensure_subscribed(&state.config.incomer_channel(&target.provided_uuid))
            .await?;

        let child_metadata = RedisMetadata {
            origin: state.private_uuid.clone(),
            to: Some(target.provided_uuid.clone()),
            incomer_name: Some(target.name.clone()),
            event_transaction_id: Some(transaction_id.clone()),
            ..Default::default()
        };
        let child_envelope = EventEnvelope {
            name: envelope.name.clone(),
            data: envelope.data.clone(),
            redis_metadata: child_metadata.clone(),
        };
        state
            .channel
            .publish(&state.config.incomer_channel(&target.provided_uuid), &child_envelope)
            .await?;

        let child = Transaction::new_child(
            envelope.name.clone(),
            envelope.data.clone(),
            child_metadata,
            transaction_id.clone(),
            0,
        );
        state.dispatcher_store.set(child).await?;
        crate::metrics::FANOUT_TARGETS_TOTAL.inc();
    }

    state.registry.update_incomer_state(&origin).await.ok();
    sender_main.published = true;
    sender_store.update(&transaction_id, sender_main).await?;
    crate::metrics::EVENTS_PUBLISHED_TOTAL.inc();
    Ok(())
}

/// Select subscribers for `event_name`, applying the horizontal-scale
/// filter: group candidates by `name`; keep only one per group for
/// `horizontalScale=false` subscriptions, keep all for `horizontalScale=true`.
fn select_targets(incomers: &HashMap<String, Incomer>, event_name: &str) -> Vec<Incomer> {
    let mut by_name: HashMap<&str, Vec<&Incomer>> = HashMap::new();
    for incomer in incomers.values() {
        if incomer.subscription_for(event_name).is_some() {
            by_name.entry(incomer.name.as_str()).or_default().push(incomer);
        }
    }

    let mut targets = Vec::new();
    for (_, candidates) in by_name {
        let horizontal_scale = candidates
            .first()
            .and_then(|i| i.subscription_for(event_name))
            .map(|s| s.horizontal_scale)
            .unwrap_or(false);

        if horizontal_scale {
            targets.extend(candidates.into_iter().cloned());
        } else if let Some(first) = candidates.into_iter().next() {
            targets.push(first.clone());
        }
    }
    targets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::now_millis;
    use std::collections::HashSet;

    fn incomer(uuid: &str, name: &str, event: &str, horizontal_scale: bool) -> Incomer {
        Incomer {
            provided_uuid: uuid.to_string(),
            base_uuid: format!("base-{uuid}"),
            name: name.to_string(),
            events_cast: HashSet::new(),
            events_subscribe: vec![crate::model::EventSubscription {
                name: event.to_string(),
                horizontal_scale,
            }],
            prefix: String::new(),
            alive_since: now_millis(),
            last_activity: now_millis(),
            is_dispatcher_active_instance: false,
        }
    }

    #[test]
    fn horizontal_scale_false_keeps_one_per_name_group() {
        let mut incomers = HashMap::new();
        for i in 0..3 {
            let uuid = format!("svc-{i}");
            incomers.insert(uuid.clone(), incomer(&uuid, "svc", "e", false));
        }
        for i in 0..2 {
            let uuid = format!("other-{i}");
            incomers.insert(uuid.clone(), incomer(&uuid, "other", "e", true));
        }
        let targets = select_targets(&incomers, "e");
        assert_eq!(targets.len(), 3);
    }

    #[test]
    fn no_subscribers_yields_empty_targets() {
        let incomers = HashMap::new();
        assert!(select_targets(&incomers, "e").is_empty());
    }
}
