//! Test adapters wrapping the built-in ones

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use synod_memory::{
    AdapterCapabilities, AdapterScope, BackendKind, Embedding, EmbeddingProvider, KeyValueAdapter,
    MemoryAdapter, MemoryRecord, MemorySystem, MetadataFilter, ScoredRecord, SynodConfig, SynodError,
    SynodResult, InMemoryStorage, TokenEmbeddingProvider,
};

pub const BACKENDS: [BackendKind; 2] = [BackendKind::KeyValue, BackendKind::Workspace];

pub async fn initialized(config: SynodConfig) -> MemorySystem {
    let system = MemorySystem::new(config).unwrap();
    system.initialize("integration").await.unwrap();
    system
}

pub async fn with_adapter(config: SynodConfig, adapter: Arc<dyn MemoryAdapter>) -> MemorySystem {
    let system = MemorySystem::builder(config).adapter(adapter).build().unwrap();
    system.initialize("integration").await.unwrap();
    system
}

pub async fn with_embedder(
    config: SynodConfig,
    embedder: Arc<dyn EmbeddingProvider>,
) -> MemorySystem {
    let system = MemorySystem::builder(config).embedder(embedder).build().unwrap();
    system.initialize("integration").await.unwrap();
    system
}

pub fn key_value() -> Arc<dyn MemoryAdapter> {
    Arc::new(KeyValueAdapter::new(Arc::new(InMemoryStorage::new())))
}

/// Searches for `from` read the namespace of `to`
pub struct LeakyAdapter {
    pub inner: Arc<dyn MemoryAdapter>,
    pub from: String,
    pub to: String,
}

#[async_trait]
impl MemoryAdapter for LeakyAdapter {
    fn name(&self) -> &'static str {
        "leaky"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        self.inner.capabilities()
    }

    async fn insert(&self, scope: &AdapterScope, record: MemoryRecord) -> SynodResult<()> {
        self.inner.insert(scope, record).await
    }

    async fn get(&self, scope: &AdapterScope, id: &str) -> SynodResult<Option<MemoryRecord>> {
        self.inner.get(scope, id).await
    }

    async fn search(
        &self,
        scope: &AdapterScope,
        query: &Embedding,
        filter: Option<&MetadataFilter>,
    ) -> SynodResult<Vec<ScoredRecord>> {
        if scope.agent_id == self.from {
            let leaked = AdapterScope::new(self.to.clone());
            return self.inner.search(&leaked, query, filter).await;
        }
        self.inner.search(scope, query, filter).await
    }

    async fn list(
        &self,
        scope: &AdapterScope,
        filter: Option<&MetadataFilter>,
    ) -> SynodResult<Vec<MemoryRecord>> {
        self.inner.list(scope, filter).await
    }

    async fn remove(&self, scope: &AdapterScope, id: &str) -> SynodResult<bool> {
        self.inner.remove(scope, id).await
    }

    async fn update(&self, scope: &AdapterScope, record: MemoryRecord) -> SynodResult<bool> {
        self.inner.update(scope, record).await
    }

    async fn reset(&self, scope: &AdapterScope) -> SynodResult<()> {
        self.inner.reset(scope).await
    }
}

/// Fails the first `failures` searches, and stalls inserts by `insert_delay`
pub struct UnreliableAdapter {
    pub inner: Arc<dyn MemoryAdapter>,
    pub failures: u32,
    pub insert_delay: Option<Duration>,
    pub search_calls: AtomicU32,
}

impl UnreliableAdapter {
    pub fn failing_searches(failures: u32) -> Self {
        Self {
            inner: key_value(),
            failures,
            insert_delay: None,
            search_calls: AtomicU32::new(0),
        }
    }

    pub fn slow_inserts(delay: Duration) -> Self {
        Self {
            inner: key_value(),
            failures: 0,
            insert_delay: Some(delay),
            search_calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl MemoryAdapter for UnreliableAdapter {
    fn name(&self) -> &'static str {
        "unreliable"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        self.inner.capabilities()
    }

    async fn insert(&self, scope: &AdapterScope, record: MemoryRecord) -> SynodResult<()> {
        if let Some(delay) = self.insert_delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.insert(scope, record).await
    }

    async fn get(&self, scope: &AdapterScope, id: &str) -> SynodResult<Option<MemoryRecord>> {
        self.inner.get(scope, id).await
    }

    async fn search(
        &self,
        scope: &AdapterScope,
        query: &Embedding,
        filter: Option<&MetadataFilter>,
    ) -> SynodResult<Vec<ScoredRecord>> {
        let call = self.search_calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(SynodError::backend_unavailable("search", "connection reset"));
        }
        self.inner.search(scope, query, filter).await
    }

    async fn list(
        &self,
        scope: &AdapterScope,
        filter: Option<&MetadataFilter>,
    ) -> SynodResult<Vec<MemoryRecord>> {
        self.inner.list(scope, filter).await
    }

    async fn remove(&self, scope: &AdapterScope, id: &str) -> SynodResult<bool> {
        self.inner.remove(scope, id).await
    }

    async fn update(&self, scope: &AdapterScope, record: MemoryRecord) -> SynodResult<bool> {
        self.inner.update(scope, record).await
    }

    async fn reset(&self, scope: &AdapterScope) -> SynodResult<()> {
        self.inner.reset(scope).await
    }
}

/// Returns a NaN vector for any text containing "poison"
pub struct PoisonedEmbedder {
    inner: TokenEmbeddingProvider,
}

impl PoisonedEmbedder {
    pub fn new() -> Self {
        Self {
            inner: TokenEmbeddingProvider::default(),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for PoisonedEmbedder {
    async fn embed(&self, text: &str) -> SynodResult<Embedding> {
        if text.contains("poison") {
            return Ok(Embedding::new(vec![f32::NAN; self.inner.dimensions()], "poisoned"));
        }
        self.inner.embed(text).await
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }
}
