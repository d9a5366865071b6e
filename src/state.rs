//! Shared dispatcher state: the handful of long-lived, in-process objects
//! every task needs a handle to. Per spec.md §5, the coupled mutable state
//! lives entirely in Redis; what's here is the set of subscribed channel
//! names (owned by the channel adapter) and the stores/config wiring.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use crate::config::DispatcherConfig;
use crate::redis_adapter::channel::ChannelAdapter;
use crate::redis_adapter::kv::KvStore;
use crate::store::incomer_registry::IncomerRegistry;
use crate::store::transaction_store::TransactionStore;
use crate::validation::Validators;

pub struct DispatcherState {
    pub config: DispatcherConfig,
    pub channel: Arc<dyn ChannelAdapter>,
    pub kv: Arc<dyn KvStore>,
    pub registry: IncomerRegistry,
    pub dispatcher_store: TransactionStore,
    pub backup_dispatcher_store: TransactionStore,
    pub backup_incomer_store: TransactionStore,
    pub validators: Validators,

    /// This process's lifetime identity on the bus, used as `origin` for
    /// self-originated messages (election announcements, self pings).
    pub private_uuid: String,

    /// The `baseUUID` this dispatcher process registers into the incomer
    /// registry for itself. Defaults to a fresh UUID if not configured.
    pub self_provided_uuid: String,

    /// True iff this process currently holds the active dispatcher role.
    active: AtomicBool,

    /// Fan-out of `OK` leader-election announcements observed on the
    /// dispatcher channel, keyed by origin. The router publishes into this
    /// whenever it sees an `OK` from another origin; `election` subscribes
    /// while racing its own announcement.
    pub ok_announcements: tokio::sync::broadcast::Sender<String>,
}

impl DispatcherState {
    pub fn new(
        config: DispatcherConfig,
        channel: Arc<dyn ChannelAdapter>,
        kv: Arc<dyn KvStore>,
        validators: Validators,
    ) -> Arc<Self> {
        let registry = IncomerRegistry::new(kv.clone(), config.incomer_registry_key());
        let dispatcher_store = TransactionStore::new(kv.clone(), config.dispatcher_transaction_key());
        let backup_dispatcher_store =
            TransactionStore::new(kv.clone(), config.backup_dispatcher_transaction_key());
        let backup_incomer_store =
            TransactionStore::new(kv.clone(), config.backup_incomer_transaction_key());
        let self_provided_uuid = config
            .incomer_uuid
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Arc::new(Self {
            private_uuid: Uuid::new_v4().to_string(),
            self_provided_uuid,
            config,
            channel,
            kv,
            registry,
            dispatcher_store,
            backup_dispatcher_store,
            backup_incomer_store,
            validators,
            active: AtomicBool::new(false),
            ok_announcements: tokio::sync::broadcast::channel(64).0,
        })
    }

    pub fn incomer_store(&self, incomer_uuid: &str) -> TransactionStore {
        TransactionStore::new(self.kv.clone(), self.config.incomer_transaction_key(incomer_uuid))
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
        crate::metrics::ACTIVE_INSTANCE.set(if active { 1 } else { 0 });
    }
}
