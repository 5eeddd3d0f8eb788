//! Per-agent memory store
//!
//! Every operation is scoped to an owning agent id. One agent's records are
//! never returned to, updated by or deleted by another agent.
//!
//! # Identifier stability
//!
//! [`MemoryStore::update`] returns the record as it exists after the update.
//! On adapters without atomic update the old record is deleted and a new one
//! is inserted, so **the returned id may differ from the one passed in**.
//! Do not cache ids across calls; re-resolve by content or metadata.

use crate::adapter::{rank, AdapterScope};
use crate::embedding::Embedding;
use crate::error::{SynodError, SynodResult};
use crate::record::{MemoryMetadata, MemoryRecord, MetadataFilter, ScoredRecord};
use crate::storage::validate_key_segment;
use crate::system::{ActiveRun, SystemHandle};
use chrono::Utc;
use std::sync::Arc;

/// Memory operations over the active adapter
#[derive(Clone)]
pub struct MemoryStore {
    handle: SystemHandle,
}

impl MemoryStore {
    pub(crate) fn new(handle: SystemHandle) -> Self {
        Self { handle }
    }

    /// Scope all operations to one agent
    pub fn for_agent(&self, agent_id: impl Into<String>) -> AgentMemory {
        AgentMemory {
            store: self.clone(),
            agent_id: agent_id.into(),
        }
    }

    /// Fail with `Uninitialized` unless a run is live
    pub fn ensure_ready(&self) -> SynodResult<()> {
        self.handle.active().map(|_| ())
    }

    pub(crate) fn default_top_k(&self) -> usize {
        self.handle.config().default_top_k
    }

    pub(crate) fn resolve_settings(&self) -> (f32, usize, crate::retry::RetryPolicy) {
        let config = self.handle.config();
        (
            config.min_confidence,
            config.resolve_top_k,
            crate::retry::RetryPolicy::new(&config.retry),
        )
    }

    /// Store a new memory and return its id; duplicates are allowed
    pub async fn add(
        &self,
        agent_id: &str,
        content: &str,
        metadata: MemoryMetadata,
    ) -> SynodResult<String> {
        let run = self.handle.active()?;
        validate_agent(agent_id)?;
        validate_text("content", content)?;

        let embedding = self.embed("add", content).await?;
        let record = MemoryRecord::new(agent_id, content, metadata, run.next_revision())
            .with_embedding(embedding);
        let id = record.id.clone();
        let scope = self.scope(&run, agent_id);

        self.handle
            .call("add", run.adapter.insert(&scope, record))
            .await?;

        tracing::debug!(agent_id = agent_id, memory_id = %id, "Added memory");
        Ok(id)
    }

    /// Most similar memories first, ties broken by most recent write
    pub async fn search(
        &self,
        agent_id: &str,
        query: &str,
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> SynodResult<Vec<ScoredRecord>> {
        let run = self.handle.active()?;
        validate_agent(agent_id)?;
        validate_text("query", query)?;
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let embedding = self.embed("search", query).await?;
        let scope = self.scope(&run, agent_id);
        let candidates = self
            .handle
            .call("search", run.adapter.search(&scope, &embedding, filter))
            .await?;

        let results = rank(candidates, top_k);
        tracing::debug!(
            agent_id = agent_id,
            results = results.len(),
            top_score = ?results.first().map(|r| r.score),
            "Searched memories"
        );
        Ok(results)
    }

    /// [`search`](Self::search) with the configured default `top_k`
    pub async fn search_default(
        &self,
        agent_id: &str,
        query: &str,
        filter: Option<&MetadataFilter>,
    ) -> SynodResult<Vec<ScoredRecord>> {
        self.search(agent_id, query, self.default_top_k(), filter)
            .await
    }

    /// Fetch one memory by id
    pub async fn get(&self, agent_id: &str, id: &str) -> SynodResult<MemoryRecord> {
        let run = self.handle.active()?;
        validate_agent(agent_id)?;
        self.fetch_owned(&run, agent_id, id, "read").await
    }

    /// Replace the content of a memory
    ///
    /// Returns the record after the update. Its id equals `id` when the
    /// adapter supports atomic update and is fresh otherwise.
    pub async fn update(
        &self,
        agent_id: &str,
        id: &str,
        new_content: &str,
    ) -> SynodResult<MemoryRecord> {
        let run = self.handle.active()?;
        validate_agent(agent_id)?;
        validate_text("new_content", new_content)?;

        let existing = self.fetch_owned(&run, agent_id, id, "update").await?;
        let embedding = self.embed("update", new_content).await?;
        let scope = self.scope(&run, agent_id);

        if run.adapter.capabilities().atomic_update {
            let mut record = existing;
            record.content = new_content.to_string();
            record.embedding = Some(embedding);
            record.updated_at = Utc::now();
            record.revision = run.next_revision();

            let updated = self
                .handle
                .call("update", run.adapter.update(&scope, record.clone()))
                .await?;
            if !updated {
                return Err(SynodError::not_found("memory", id));
            }

            tracing::debug!(agent_id = agent_id, memory_id = id, "Updated memory in place");
            return Ok(record);
        }

        self.replace(&run, &scope, existing, new_content, embedding)
            .await
    }

    /// Delete + insert for adapters without atomic update
    async fn replace(
        &self,
        run: &ActiveRun,
        scope: &AdapterScope,
        existing: MemoryRecord,
        new_content: &str,
        embedding: Embedding,
    ) -> SynodResult<MemoryRecord> {
        let removed = self
            .handle
            .call("update", run.adapter.remove(scope, &existing.id))
            .await?;
        if !removed {
            return Err(SynodError::not_found("memory", existing.id));
        }

        let mut record = MemoryRecord::new(
            existing.agent_id.clone(),
            new_content,
            existing.metadata.clone(),
            run.next_revision(),
        )
        .with_embedding(embedding);
        record.created_at = existing.created_at;

        if let Err(err) = self
            .handle
            .call("update", run.adapter.insert(scope, record.clone()))
            .await
        {
            tracing::error!(
                agent_id = %existing.agent_id,
                memory_id = %existing.id,
                error = %err,
                "Insert after delete failed, restoring previous memory"
            );
            if let Err(restore_err) = self
                .handle
                .call("update", run.adapter.insert(scope, existing.clone()))
                .await
            {
                tracing::error!(
                    memory_id = %existing.id,
                    error = %restore_err,
                    "Could not restore memory"
                );
            }
            return Err(err);
        }

        tracing::debug!(
            agent_id = %record.agent_id,
            old_memory_id = %existing.id,
            new_memory_id = %record.id,
            "Replaced memory"
        );
        Ok(record)
    }

    /// Delete a memory by id
    pub async fn delete(&self, agent_id: &str, id: &str) -> SynodResult<()> {
        let run = self.handle.active()?;
        validate_agent(agent_id)?;

        self.fetch_owned(&run, agent_id, id, "delete").await?;
        let scope = self.scope(&run, agent_id);
        let removed = self
            .handle
            .call("delete", run.adapter.remove(&scope, id))
            .await?;
        if !removed {
            return Err(SynodError::not_found("memory", id));
        }

        tracing::debug!(agent_id = agent_id, memory_id = id, "Deleted memory");
        Ok(())
    }

    /// All memories of an agent, oldest first
    pub async fn get_all(
        &self,
        agent_id: &str,
        filter: Option<&MetadataFilter>,
    ) -> SynodResult<Vec<MemoryRecord>> {
        let run = self.handle.active()?;
        validate_agent(agent_id)?;

        let scope = self.scope(&run, agent_id);
        let mut records = self
            .handle
            .call("get_all", run.adapter.list(&scope, filter))
            .await?;
        records.retain(|r| r.agent_id == agent_id);
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.revision.cmp(&b.revision))
        });
        Ok(records)
    }

    /// Drop every memory of an agent
    pub async fn reset(&self, agent_id: &str) -> SynodResult<()> {
        let run = self.handle.active()?;
        validate_agent(agent_id)?;
        let scope = self.scope(&run, agent_id);

        if run.adapter.capabilities().namespace_reset {
            self.handle
                .call("reset", run.adapter.reset(&scope))
                .await?;
        } else {
            let records = self
                .handle
                .call("reset", run.adapter.list(&scope, None))
                .await?;
            for record in records.iter().filter(|r| r.agent_id == agent_id) {
                self.handle
                    .call("reset", run.adapter.remove(&scope, &record.id))
                    .await?;
            }
        }

        tracing::info!(agent_id = agent_id, "Reset agent memory");
        Ok(())
    }

    fn scope(&self, run: &ActiveRun, agent_id: &str) -> AdapterScope {
        let scope = AdapterScope::new(agent_id);
        if run.adapter.capabilities().requires_workspace {
            let template = &self.handle.config().workspace_template;
            scope.with_workspace(run.workspace_for(template, agent_id))
        } else {
            scope
        }
    }

    async fn embed(&self, operation: &str, text: &str) -> SynodResult<Embedding> {
        let embedder = self.handle.embedder().clone();
        let embedding = self
            .handle
            .call(operation, async move { embedder.embed(text).await })
            .await
            .map_err(|err| match err {
                SynodError::Uninitialized | SynodError::BackendUnavailable { .. } => err,
                other => SynodError::backend_unavailable(operation, other),
            })?;

        if !embedding.is_finite() {
            tracing::warn!(
                model = %embedding.model,
                operation = operation,
                "Embedder returned non-finite components"
            );
            return Err(SynodError::backend_unavailable(
                operation,
                "embedding has non-finite components",
            ));
        }
        Ok(embedding)
    }

    /// Load a record and check it belongs to `agent_id`
    async fn fetch_owned(
        &self,
        run: &Arc<ActiveRun>,
        agent_id: &str,
        id: &str,
        action: &str,
    ) -> SynodResult<MemoryRecord> {
        if id.trim().is_empty() {
            return Err(SynodError::invalid_input("memory_id", "must not be empty"));
        }
        let scope = self.scope(run, agent_id);
        let record = self
            .handle
            .call(action, run.adapter.get(&scope, id))
            .await?
            .ok_or_else(|| SynodError::not_found("memory", id))?;

        if record.agent_id != agent_id {
            tracing::warn!(
                agent_id = agent_id,
                owner_id = %record.agent_id,
                memory_id = id,
                "Rejected cross-agent memory access"
            );
            return Err(SynodError::unauthorized(agent_id, &record.agent_id, action, "memory"));
        }
        Ok(record)
    }
}

fn validate_agent(agent_id: &str) -> SynodResult<()> {
    validate_key_segment("agent_id", agent_id)
}

fn validate_text(field: &str, value: &str) -> SynodResult<()> {
    if value.trim().is_empty() {
        return Err(SynodError::invalid_input(field, "must not be empty"));
    }
    Ok(())
}

/// [`MemoryStore`] bound to one agent namespace
#[derive(Clone)]
pub struct AgentMemory {
    store: MemoryStore,
    agent_id: String,
}

impl AgentMemory {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub async fn add(&self, content: &str, metadata: MemoryMetadata) -> SynodResult<String> {
        self.store.add(&self.agent_id, content, metadata).await
    }

    pub async fn search(
        &self,
        query: &str,
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> SynodResult<Vec<ScoredRecord>> {
        self.store.search(&self.agent_id, query, top_k, filter).await
    }

    pub async fn get(&self, id: &str) -> SynodResult<MemoryRecord> {
        self.store.get(&self.agent_id, id).await
    }

    pub async fn update(&self, id: &str, new_content: &str) -> SynodResult<MemoryRecord> {
        self.store.update(&self.agent_id, id, new_content).await
    }

    pub async fn delete(&self, id: &str) -> SynodResult<()> {
        self.store.delete(&self.agent_id, id).await
    }

    pub async fn get_all(&self, filter: Option<&MetadataFilter>) -> SynodResult<Vec<MemoryRecord>> {
        self.store.get_all(&self.agent_id, filter).await
    }

    pub async fn reset(&self) -> SynodResult<()> {
        self.store.reset(&self.agent_id).await
    }
}
