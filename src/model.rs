//! Wire and storage data model: incomer records, transactions, and the
//! event envelope exchanged over Redis pub/sub channels.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Milliseconds since the Unix epoch, matching the spec's "monotonic-clockish
/// milliseconds" timestamps.
pub type Millis = i64;

pub fn now_millis() -> Millis {
    chrono::Utc::now().timestamp_millis()
}

/// Reserved event names with dispatcher-specific handling.
pub mod reserved_events {
    pub const REGISTER: &str = "register";
    pub const APPROVEMENT: &str = "approvement";
    pub const PING: &str = "ping";
    pub const OK: &str = "OK";
}

/// A single subscription entry: an event name plus whether all same-named
/// replicas should receive it (`true`) or only one should (`false`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventSubscription {
    pub name: String,
    #[serde(default, rename = "horizontalScale")]
    pub horizontal_scale: bool,
}

/// Persistent directory entry for an approved incomer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incomer {
    #[serde(rename = "providedUUID")]
    pub provided_uuid: String,
    #[serde(rename = "baseUUID")]
    pub base_uuid: String,
    pub name: String,
    #[serde(rename = "eventsCast")]
    pub events_cast: HashSet<String>,
    #[serde(rename = "eventsSubscribe")]
    pub events_subscribe: Vec<EventSubscription>,
    #[serde(default)]
    pub prefix: String,
    #[serde(rename = "aliveSince")]
    pub alive_since: Millis,
    #[serde(rename = "lastActivity")]
    pub last_activity: Millis,
    #[serde(rename = "isDispatcherActiveInstance", default)]
    pub is_dispatcher_active_instance: bool,
}

impl Incomer {
    pub fn casts(&self, event_name: &str) -> bool {
        self.events_cast.contains(event_name)
    }

    pub fn subscription_for(&self, event_name: &str) -> Option<&EventSubscription> {
        self.events_subscribe.iter().find(|s| s.name == event_name)
    }

    pub fn subscribes(&self, event_name: &str) -> bool {
        self.subscription_for(event_name).is_some()
    }
}

/// Metadata carried alongside every event on the wire. Fields are optional
/// because they are progressively filled in as a message moves from
/// publisher to dispatcher to recipient.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RedisMetadata {
    pub origin: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(rename = "incomerName", skip_serializing_if = "Option::is_none")]
    pub incomer_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(rename = "transactionId", skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(
        rename = "eventTransactionId",
        skip_serializing_if = "Option::is_none"
    )]
    pub event_transaction_id: Option<String>,
    #[serde(rename = "mainTransaction", skip_serializing_if = "Option::is_none")]
    pub main_transaction: Option<bool>,
    #[serde(
        rename = "relatedTransaction",
        skip_serializing_if = "Option::is_none"
    )]
    pub related_transaction: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
}

/// The envelope published on a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub name: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(rename = "redisMetadata")]
    pub redis_metadata: RedisMetadata,
}

/// A transaction record, as stored in a dispatcher-side or incomer-side
/// transaction store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub name: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(rename = "redisMetadata")]
    pub redis_metadata: RedisMetadata,
    #[serde(rename = "mainTransaction")]
    pub main_transaction: bool,
    #[serde(rename = "relatedTransaction")]
    pub related_transaction: Option<String>,
    pub resolved: bool,
    #[serde(default)]
    pub published: bool,
    #[serde(rename = "aliveSince")]
    pub alive_since: Millis,
    #[serde(default)]
    pub iteration: u32,
}

impl Transaction {
    /// Build a fresh main transaction for an incoming publish.
    pub fn new_main(name: String, data: serde_json::Value, redis_metadata: RedisMetadata) -> Self {
        Self {
            name,
            data,
            redis_metadata,
            main_transaction: true,
            related_transaction: None,
            resolved: false,
            published: false,
            alive_since: now_millis(),
            iteration: 0,
        }
    }

    /// Build a fresh dispatcher-side child transaction fanned out to one
    /// recipient.
    pub fn new_child(
        name: String,
        data: serde_json::Value,
        redis_metadata: RedisMetadata,
        related_transaction: String,
        iteration: u32,
    ) -> Self {
        Self {
            name,
            data,
            redis_metadata,
            main_transaction: false,
            related_transaction: Some(related_transaction),
            resolved: false,
            published: false,
            alive_since: now_millis(),
            iteration,
        }
    }
}

/// A map of transactionId -> Transaction, as persisted under one Redis key.
pub type TransactionMap = HashMap<String, Transaction>;

/// Allocate a fresh transaction id (UUID v4), matching the spec's
/// "assigns a fresh UUID" contract for `TransactionStore::set`.
pub fn new_transaction_id() -> String {
    Uuid::new_v4().to_string()
}

/// Allocate a fresh providedUUID for a newly-approved incomer.
pub fn new_provided_uuid() -> String {
    Uuid::new_v4().to_string()
}
