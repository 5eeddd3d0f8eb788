use super::{in_namespace, Memory, MemoryQuery, MemoryValue};
use crate::error::SynodResult;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Process-local [`Memory`] backend over an ordered map
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    entries: RwLock<BTreeMap<String, MemoryValue>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Memory for InMemoryStorage {
    async fn set(&self, key: &str, value: MemoryValue) -> SynodResult<()> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> SynodResult<Option<MemoryValue>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> SynodResult<bool> {
        Ok(self.entries.write().remove(key).is_some())
    }

    async fn keys(&self, query: &MemoryQuery) -> SynodResult<Vec<String>> {
        let entries = self.entries.read();
        let keys = entries
            .keys()
            .filter(|k| match &query.namespace {
                Some(ns) => in_namespace(k, ns),
                None => true,
            })
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(keys)
    }

    async fn count(&self, namespace: Option<&str>) -> SynodResult<usize> {
        let entries = self.entries.read();
        Ok(match namespace {
            Some(ns) => entries.keys().filter(|k| in_namespace(k, ns)).count(),
            None => entries.len(),
        })
    }

    async fn clear(&self, namespace: Option<&str>) -> SynodResult<()> {
        let mut entries = self.entries.write();
        match namespace {
            Some(ns) => entries.retain(|k, _| !in_namespace(k, ns)),
            None => entries.clear(),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_namespaced_clear_leaves_siblings() {
        let storage = InMemoryStorage::new();
        storage.set("agent::a::x", MemoryValue::from("1")).await.unwrap();
        storage.set("agent::a::y", MemoryValue::from("2")).await.unwrap();
        storage.set("agent::b::x", MemoryValue::from("3")).await.unwrap();

        assert_eq!(storage.count(Some("agent::a")).await.unwrap(), 2);

        storage.clear(Some("agent::a")).await.unwrap();

        assert_eq!(storage.count(Some("agent::a")).await.unwrap(), 0);
        assert_eq!(storage.count(None).await.unwrap(), 1);
        assert!(storage.get("agent::b::x").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_keys_are_ordered_and_limited() {
        let storage = InMemoryStorage::new();
        for key in ["ns::c", "ns::a", "ns::b", "other::z"] {
            storage.set(key, MemoryValue::from(1i64)).await.unwrap();
        }

        let query = MemoryQuery::new().with_namespace("ns").with_limit(2);
        let keys = storage.keys(&query).await.unwrap();
        assert_eq!(keys, vec!["ns::a".to_string(), "ns::b".to_string()]);
    }
}
