//! Key-value store: JSON-object get/set/delete by key with a namespace
//! prefix, backed by a `redis::aio::ConnectionManager`. Grounded on the
//! typed Redis wrapper struct in `rsky-indexer::consumer::RedisConsumer`,
//! which holds a cloneable `ConnectionManager` rather than opening a fresh
//! connection per call.

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::error::DispatcherError;

/// JSON-object get/set/delete by key. Out of scope per the spec (external
/// collaborator), but the core depends on it directly, so it's modeled as
/// a small trait with a Redis-backed production implementation and an
/// in-memory fake for tests.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get_json(&self, key: &str) -> Result<Option<serde_json::Value>, DispatcherError>;
    async fn set_json(&self, key: &str, value: &serde_json::Value) -> Result<(), DispatcherError>;
    async fn delete(&self, key: &str) -> Result<(), DispatcherError>;
}

#[derive(Clone)]
pub struct RedisKvStore {
    manager: redis::aio::ConnectionManager,
}

impl RedisKvStore {
    pub async fn new(client: &redis::Client) -> Result<Self, DispatcherError> {
        let manager = redis::aio::ConnectionManager::new(client.clone()).await?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn get_json(&self, key: &str) -> Result<Option<serde_json::Value>, DispatcherError> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn.get(key).await?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn set_json(&self, key: &str, value: &serde_json::Value) -> Result<(), DispatcherError> {
        let mut conn = self.manager.clone();
        let raw = serde_json::to_string(value)?;
        let _: () = conn.set(key, raw).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), DispatcherError> {
        let mut conn = self.manager.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }
}

/// In-memory fake for unit tests, avoiding a live Redis dependency.
#[derive(Default)]
pub struct FakeKvStore {
    data: tokio::sync::Mutex<std::collections::HashMap<String, serde_json::Value>>,
}

impl FakeKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for FakeKvStore {
    async fn get_json(&self, key: &str) -> Result<Option<serde_json::Value>, DispatcherError> {
        Ok(self.data.lock().await.get(key).cloned())
    }

    async fn set_json(&self, key: &str, value: &serde_json::Value) -> Result<(), DispatcherError> {
        self.data.lock().await.insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), DispatcherError> {
        self.data.lock().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_kv_roundtrip() {
        let kv = FakeKvStore::new();
        assert!(kv.get_json("a").await.unwrap().is_none());
        kv.set_json("a", &serde_json::json!({"x": 1})).await.unwrap();
        assert_eq!(
            kv.get_json("a").await.unwrap(),
            Some(serde_json::json!({"x": 1}))
        );
        kv.delete("a").await.unwrap();
        assert!(kv.get_json("a").await.unwrap().is_none());
    }
}
