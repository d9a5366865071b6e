//! Keyed collection of transactions (dispatcher-side or incomer-side),
//! scoped by a single Redis key. CRUD and bulk read, implemented as a
//! coarse-grained read-modify-write over one JSON map, per spec.md §4.1:
//! "reads and writes are coarse-grained replacements of the map."

use std::sync::Arc;

use crate::error::DispatcherError;
use crate::model::{new_transaction_id, now_millis, Transaction, TransactionMap};
use crate::redis_adapter::kv::KvStore;

#[derive(Clone)]
pub struct TransactionStore {
    kv: Arc<dyn KvStore>,
    key: String,
}

impl TransactionStore {
    pub fn new(kv: Arc<dyn KvStore>, key: String) -> Self {
        Self { kv, key }
    }

    pub async fn get_all(&self) -> Result<TransactionMap, DispatcherError> {
        match self.kv.get_json(&self.key).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(TransactionMap::new()),
        }
    }

    pub async fn get(&self, id: &str) -> Result<Option<Transaction>, DispatcherError> {
        Ok(self.get_all().await?.remove(id))
    }

    /// Insert `transaction`, assigning it a fresh id and stamping
    /// `aliveSince`. Returns the assigned id alongside the stored record.
    pub async fn set(&self, mut transaction: Transaction) -> Result<(String, Transaction), DispatcherError> {
        let id = new_transaction_id();
        transaction.alive_since = now_millis();
        let mut all = self.get_all().await?;
        all.insert(id.clone(), transaction.clone());
        self.write_all(&all).await?;
        Ok((id, transaction))
    }

    /// Replace a transaction in place.
    pub async fn update(&self, id: &str, transaction: Transaction) -> Result<(), DispatcherError> {
        let mut all = self.get_all().await?;
        all.insert(id.to_string(), transaction);
        self.write_all(&all).await
    }

    /// Remove a transaction; if the map becomes empty, delete the key
    /// itself rather than writing back an empty object.
    pub async fn delete(&self, id: &str) -> Result<(), DispatcherError> {
        let mut all = self.get_all().await?;
        all.remove(id);
        if all.is_empty() {
            self.kv.delete(&self.key).await
        } else {
            self.write_all(&all).await
        }
    }

    async fn write_all(&self, all: &TransactionMap) -> Result<(), DispatcherError> {
        self.kv.set_json(&self.key, &serde_json::to_value(all)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RedisMetadata;
    use crate::redis_adapter::kv::FakeKvStore;

    fn sample_main() -> Transaction {
        Transaction::new_main(
            "accountingFolder".to_string(),
            serde_json::json!({"id": "1"}),
            RedisMetadata {
                origin: "pub-1".to_string(),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn set_assigns_id_and_alive_since() {
        let store = TransactionStore::new(Arc::new(FakeKvStore::new()), "t".to_string());
        let (id, stored) = store.set(sample_main()).await.unwrap();
        assert!(!id.is_empty());
        assert!(stored.alive_since > 0);
        assert_eq!(store.get(&id).await.unwrap().unwrap().name, "accountingFolder");
    }

    #[tokio::test]
    async fn delete_last_entry_removes_key() {
        let kv = Arc::new(FakeKvStore::new());
        let store = TransactionStore::new(kv.clone(), "t".to_string());
        let (id, _) = store.set(sample_main()).await.unwrap();
        store.delete(&id).await.unwrap();
        assert!(kv.get_json("t").await.unwrap().is_none());
        assert!(store.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_replaces_in_place() {
        let store = TransactionStore::new(Arc::new(FakeKvStore::new()), "t".to_string());
        let (id, mut stored) = store.set(sample_main()).await.unwrap();
        stored.resolved = true;
        store.update(&id, stored).await.unwrap();
        assert!(store.get(&id).await.unwrap().unwrap().resolved);
    }
}
