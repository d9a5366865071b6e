//! Channel adapter: a thin wrap of pub/sub publish and subscribe-by-name.
//! Grounded on the reconnect-with-backoff and `CancellationToken` shutdown
//! idiom in `other_examples`' `synctv-cluster` Redis pub/sub service — the
//! teacher's own crates only ever publish to Redis Streams, never subscribe,
//! so this module borrows its subscriber-loop shape from that sibling
//! example instead.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::DispatcherError;
use crate::model::EventEnvelope;

/// A message received on some channel, handed to the router.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub channel: String,
    pub envelope: EventEnvelope,
}

/// Thin wrap of pub/sub publish and subscribe-by-name. Out of scope per the
/// spec (external collaborator), modeled as a trait so the dispatcher core
/// can be exercised against an in-memory fake in tests.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    async fn publish(&self, channel: &str, envelope: &EventEnvelope) -> Result<(), DispatcherError>;

    /// Ensure the adapter is listening on `channel`. Idempotent.
    async fn ensure_subscribed(&self, channel: &str) -> Result<(), DispatcherError>;
}

const RECONNECT_INITIAL_BACKOFF_SECS: u64 = 1;
const RECONNECT_MAX_BACKOFF_SECS: u64 = 30;

/// Redis-backed channel adapter. Subscribes once to `{prefix}*`, which
/// covers the dispatcher channel and every present and future incomer
/// channel without requiring per-channel `SUBSCRIBE` bookkeeping;
/// `ensure_subscribed` therefore only records the channel name for
/// reconnect-time re-subscription and returns immediately.
pub struct RedisChannelAdapter {
    client: redis::Client,
    pattern: String,
    publish_manager: redis::aio::ConnectionManager,
    known_channels: Mutex<HashSet<String>>,
    cancel: CancellationToken,
}

impl RedisChannelAdapter {
    pub async fn new(client: redis::Client, prefix: &str) -> Result<Arc<Self>, DispatcherError> {
        let publish_manager = redis::aio::ConnectionManager::new(client.clone()).await?;
        Ok(Arc::new(Self {
            pattern: format!("{}*", prefix),
            client,
            publish_manager,
            known_channels: Mutex::new(HashSet::new()),
            cancel: CancellationToken::new(),
        }))
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn the subscriber loop; returns the receiver the router consumes.
    pub fn spawn(self: Arc<Self>) -> mpsc::Receiver<IncomingMessage> {
        let (tx, rx) = mpsc::channel(1024);
        let adapter = self;
        tokio::spawn(async move {
            let mut backoff = RECONNECT_INITIAL_BACKOFF_SECS;
            loop {
                if adapter.cancel.is_cancelled() {
                    info!("Redis channel adapter cancelled, exiting subscriber loop");
                    return;
                }

                match adapter.run_subscriber(&tx).await {
                    Ok(()) => {
                        info!("Redis channel adapter subscriber stream ended cleanly");
                        backoff = RECONNECT_INITIAL_BACKOFF_SECS;
                    }
                    Err(e) => {
                        error!(error = %e, backoff_secs = backoff, "Redis pub/sub connection failed, retrying");
                    }
                }

                tokio::select! {
                    () = adapter.cancel.cancelled() => return,
                    () = tokio::time::sleep(std::time::Duration::from_secs(backoff)) => {}
                }
                backoff = (backoff * 2).min(RECONNECT_MAX_BACKOFF_SECS);
            }
        });
        rx
    }

    async fn run_subscriber(&self, tx: &mpsc::Sender<IncomingMessage>) -> Result<(), DispatcherError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(&self.pattern).await?;
        info!(pattern = %self.pattern, "Redis channel adapter subscribed");

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let channel = msg.get_channel_name().to_string();
            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, channel = %channel, "Invalid pub/sub payload");
                    continue;
                }
            };

            match serde_json::from_str::<EventEnvelope>(&payload) {
                Ok(envelope) => {
                    debug!(channel = %channel, event = %envelope.name, "Received event");
                    if tx.send(IncomingMessage { channel, envelope }).await.is_err() {
                        warn!("Router receiver dropped, stopping subscriber loop");
                        return Ok(());
                    }
                }
                Err(e) => {
                    warn!(error = %e, channel = %channel, "Failed to deserialize event envelope");
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl ChannelAdapter for RedisChannelAdapter {
    async fn publish(&self, channel: &str, envelope: &EventEnvelope) -> Result<(), DispatcherError> {
        let payload = serde_json::to_string(envelope)?;
        let mut conn = self.publish_manager.clone();
        let _: i64 = redis::AsyncCommands::publish(&mut conn, channel, payload).await?;
        Ok(())
    }

    async fn ensure_subscribed(&self, channel: &str) -> Result<(), DispatcherError> {
        self.known_channels.lock().await.insert(channel.to_string());
        Ok(())
    }
}

/// In-memory fake for unit tests: `publish` delivers straight to an internal
/// queue that tests can drain, and `ensure_subscribed` is a no-op recorder.
#[derive(Default)]
pub struct FakeChannelAdapter {
    pub published: Mutex<Vec<(String, EventEnvelope)>>,
    pub subscribed: Mutex<HashSet<String>>,
}

impl FakeChannelAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn drain_published(&self) -> Vec<(String, EventEnvelope)> {
        std::mem::take(&mut *self.published.lock().await)
    }
}

#[async_trait]
impl ChannelAdapter for FakeChannelAdapter {
    async fn publish(&self, channel: &str, envelope: &EventEnvelope) -> Result<(), DispatcherError> {
        self.published
            .lock()
            .await
            .push((channel.to_string(), envelope.clone()));
        Ok(())
    }

    async fn ensure_subscribed(&self, channel: &str) -> Result<(), DispatcherError> {
        self.subscribed.lock().await.insert(channel.to_string());
        Ok(())
    }
}
