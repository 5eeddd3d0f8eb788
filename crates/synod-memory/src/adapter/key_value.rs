//! Key/value adapter
//!
//! Stores each record as JSON under `agent::{agent_id}::memory::{id}` in a
//! [`Memory`] backend. Updates overwrite the key in place, and a namespace
//! reset is a single prefix clear.

use super::{score_records, AdapterCapabilities, AdapterScope, MemoryAdapter};
use crate::embedding::Embedding;
use crate::error::{SynodError, SynodResult};
use crate::record::{filter_matches, MemoryRecord, MetadataFilter, ScoredRecord};
use crate::storage::{Memory, MemoryQuery, MemoryValue};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct KeyValueAdapter {
    /// Storage backend
    storage: Arc<dyn Memory>,

    /// Serializes read-modify-write sequences
    write_lock: Mutex<()>,
}

impl KeyValueAdapter {
    pub fn new(storage: Arc<dyn Memory>) -> Self {
        Self {
            storage,
            write_lock: Mutex::new(()),
        }
    }

    fn namespace(agent_id: &str) -> String {
        format!("agent::{}::memory", agent_id)
    }

    fn record_key(agent_id: &str, id: &str) -> String {
        format!("{}::{}", Self::namespace(agent_id), id)
    }

    fn encode(record: &MemoryRecord) -> SynodResult<MemoryValue> {
        let value = serde_json::to_value(record)
            .map_err(|e| SynodError::storage("serialize_record", e))?;
        Ok(MemoryValue::Json(value))
    }

    fn decode(value: &MemoryValue) -> SynodResult<MemoryRecord> {
        let json = value.as_json().ok_or_else(|| SynodError::Storage {
            operation: "deserialize_record".to_string(),
            message: "expected a JSON value".to_string(),
        })?;
        serde_json::from_value(json.clone()).map_err(|e| SynodError::storage("deserialize_record", e))
    }

    async fn load_all(&self, agent_id: &str) -> SynodResult<Vec<MemoryRecord>> {
        let query = MemoryQuery::new().with_namespace(Self::namespace(agent_id));
        let keys = self.storage.keys(&query).await?;

        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.storage.get(&key).await? {
                records.push(Self::decode(&value)?);
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl MemoryAdapter for KeyValueAdapter {
    fn name(&self) -> &'static str {
        "key_value"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            atomic_update: true,
            namespace_reset: true,
            requires_workspace: false,
        }
    }

    async fn insert(&self, scope: &AdapterScope, record: MemoryRecord) -> SynodResult<()> {
        let key = Self::record_key(&scope.agent_id, &record.id);
        self.storage.set(&key, Self::encode(&record)?).await
    }

    async fn get(&self, scope: &AdapterScope, id: &str) -> SynodResult<Option<MemoryRecord>> {
        let key = Self::record_key(&scope.agent_id, id);
        match self.storage.get(&key).await? {
            Some(value) => Ok(Some(Self::decode(&value)?)),
            None => Ok(None),
        }
    }

    async fn search(
        &self,
        scope: &AdapterScope,
        query: &Embedding,
        filter: Option<&MetadataFilter>,
    ) -> SynodResult<Vec<ScoredRecord>> {
        let records = self.load_all(&scope.agent_id).await?;
        Ok(score_records(&records, query, filter))
    }

    async fn list(
        &self,
        scope: &AdapterScope,
        filter: Option<&MetadataFilter>,
    ) -> SynodResult<Vec<MemoryRecord>> {
        let mut records = self.load_all(&scope.agent_id).await?;
        records.retain(|r| filter_matches(filter, &r.metadata));
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.revision.cmp(&b.revision)));
        Ok(records)
    }

    async fn remove(&self, scope: &AdapterScope, id: &str) -> SynodResult<bool> {
        let _guard = self.write_lock.lock().await;
        self.storage
            .delete(&Self::record_key(&scope.agent_id, id))
            .await
    }

    async fn update(&self, scope: &AdapterScope, record: MemoryRecord) -> SynodResult<bool> {
        let _guard = self.write_lock.lock().await;
        let key = Self::record_key(&scope.agent_id, &record.id);
        if self.storage.get(&key).await?.is_none() {
            return Ok(false);
        }
        self.storage.set(&key, Self::encode(&record)?).await?;
        Ok(true)
    }

    async fn reset(&self, scope: &AdapterScope) -> SynodResult<()> {
        let _guard = self.write_lock.lock().await;
        self.storage
            .clear(Some(&Self::namespace(&scope.agent_id)))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::MemoryMetadata;
    use crate::storage::InMemoryStorage;

    fn record(agent: &str, content: &str) -> MemoryRecord {
        MemoryRecord::new(agent, content, MemoryMetadata::new("reflection"), 0)
            .with_embedding(Embedding::new(vec![1.0, 0.0], "test"))
    }

    #[tokio::test]
    async fn test_update_keeps_identifier() {
        let adapter = KeyValueAdapter::new(Arc::new(InMemoryStorage::new()));
        let scope = AdapterScope::new("a1");

        let mut rec = record("a1", "before");
        let id = rec.id.clone();
        adapter.insert(&scope, rec.clone()).await.unwrap();

        rec.content = "after".to_string();
        assert!(adapter.update(&scope, rec).await.unwrap());

        let stored = adapter.get(&scope, &id).await.unwrap().unwrap();
        assert_eq!(stored.content, "after");
    }

    #[tokio::test]
    async fn test_update_missing_record_reports_false() {
        let adapter = KeyValueAdapter::new(Arc::new(InMemoryStorage::new()));
        let scope = AdapterScope::new("a1");
        assert!(!adapter.update(&scope, record("a1", "ghost")).await.unwrap());
    }

    #[tokio::test]
    async fn test_reset_is_scoped_to_agent() {
        let storage = Arc::new(InMemoryStorage::new());
        let adapter = KeyValueAdapter::new(storage);
        let a1 = AdapterScope::new("a1");
        let a2 = AdapterScope::new("a2");

        adapter.insert(&a1, record("a1", "one")).await.unwrap();
        adapter.insert(&a2, record("a2", "two")).await.unwrap();

        adapter.reset(&a1).await.unwrap();

        assert!(adapter.list(&a1, None).await.unwrap().is_empty());
        assert_eq!(adapter.list(&a2, None).await.unwrap().len(), 1);
    }
}
