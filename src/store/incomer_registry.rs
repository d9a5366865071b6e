//! Persistent directory of approved incomers: identity, capabilities,
//! last-activity, role flags. Stored as a single JSON map keyed by
//! `providedUUID` under one Redis key, same coarse-grained read-modify-write
//! contract as the transaction stores.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::DispatcherError;
use crate::model::{new_provided_uuid, now_millis, Incomer};
use crate::redis_adapter::kv::KvStore;

pub type IncomerMap = HashMap<String, Incomer>;

#[derive(Clone)]
pub struct IncomerRegistry {
    kv: Arc<dyn KvStore>,
    key: String,
}

impl IncomerRegistry {
    pub fn new(kv: Arc<dyn KvStore>, key: String) -> Self {
        Self { kv, key }
    }

    pub async fn get_incomers(&self) -> Result<IncomerMap, DispatcherError> {
        match self.kv.get_json(&self.key).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(IncomerMap::new()),
        }
    }

    pub async fn get_incomer(&self, provided_uuid: &str) -> Result<Option<Incomer>, DispatcherError> {
        Ok(self.get_incomers().await?.remove(provided_uuid))
    }

    /// Insert a new incomer, allocating its `providedUUID`. The caller
    /// supplies every other field already populated.
    pub async fn set_incomer(&self, mut incomer: Incomer) -> Result<String, DispatcherError> {
        let provided_uuid = new_provided_uuid();
        incomer.provided_uuid = provided_uuid.clone();
        let mut all = self.get_incomers().await?;
        all.insert(provided_uuid.clone(), incomer);
        self.write_all(&all).await?;
        Ok(provided_uuid)
    }

    pub async fn update_incomer(&self, incomer: Incomer) -> Result<(), DispatcherError> {
        let mut all = self.get_incomers().await?;
        all.insert(incomer.provided_uuid.clone(), incomer);
        self.write_all(&all).await
    }

    /// Bump `lastActivity` to now for a single incomer, leaving everything
    /// else untouched.
    pub async fn update_incomer_state(&self, provided_uuid: &str) -> Result<(), DispatcherError> {
        let mut all = self.get_incomers().await?;
        if let Some(incomer) = all.get_mut(provided_uuid) {
            incomer.last_activity = now_millis();
            self.write_all(&all).await?;
        }
        Ok(())
    }

    pub async fn delete_incomer(&self, provided_uuid: &str) -> Result<(), DispatcherError> {
        let mut all = self.get_incomers().await?;
        all.remove(provided_uuid);
        if all.is_empty() {
            self.kv.delete(&self.key).await
        } else {
            self.write_all(&all).await
        }
    }

    async fn write_all(&self, all: &IncomerMap) -> Result<(), DispatcherError> {
        self.kv.set_json(&self.key, &serde_json::to_value(all)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redis_adapter::kv::FakeKvStore;
    use std::collections::HashSet;

    fn sample() -> Incomer {
        Incomer {
            provided_uuid: String::new(),
            base_uuid: "base-1".to_string(),
            name: "foo".to_string(),
            events_cast: HashSet::from(["accountingFolder".to_string()]),
            events_subscribe: vec![],
            prefix: String::new(),
            alive_since: now_millis(),
            last_activity: now_millis(),
            is_dispatcher_active_instance: false,
        }
    }

    #[tokio::test]
    async fn set_incomer_allocates_unique_uuid() {
        let registry = IncomerRegistry::new(Arc::new(FakeKvStore::new()), "incomer".to_string());
        let a = registry.set_incomer(sample()).await.unwrap();
        let b = registry.set_incomer(sample()).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(registry.get_incomers().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn update_incomer_state_bumps_last_activity_only() {
        let registry = IncomerRegistry::new(Arc::new(FakeKvStore::new()), "incomer".to_string());
        let uuid = registry.set_incomer(sample()).await.unwrap();
        let before = registry.get_incomer(&uuid).await.unwrap().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        registry.update_incomer_state(&uuid).await.unwrap();
        let after = registry.get_incomer(&uuid).await.unwrap().unwrap();
        assert!(after.last_activity >= before.last_activity);
        assert_eq!(after.base_uuid, before.base_uuid);
    }

    #[tokio::test]
    async fn delete_last_incomer_removes_key() {
        let kv = Arc::new(FakeKvStore::new());
        let registry = IncomerRegistry::new(kv.clone(), "incomer".to_string());
        let uuid = registry.set_incomer(sample()).await.unwrap();
        registry.delete_incomer(&uuid).await.unwrap();
        assert!(kv.get_json("incomer").await.unwrap().is_none());
    }
}
