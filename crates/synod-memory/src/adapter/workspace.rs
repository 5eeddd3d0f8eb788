//! Workspace adapter
//!
//! Mirrors vector stores that group records into named collections
//! ("workspaces"). Every call is addressed by workspace id, records are
//! immutable once inserted, and there is no per-agent reset.

use super::{score_records, AdapterCapabilities, AdapterScope, MemoryAdapter};
use crate::embedding::Embedding;
use crate::error::SynodResult;
use crate::record::{filter_matches, MemoryRecord, MetadataFilter, ScoredRecord};
use async_trait::async_trait;
use dashmap::DashMap;

#[derive(Default)]
pub struct WorkspaceAdapter {
    /// Workspace id -> records in insertion order
    collections: DashMap<String, Vec<MemoryRecord>>,
}

impl WorkspaceAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live workspaces
    pub fn workspace_count(&self) -> usize {
        self.collections.len()
    }

    fn snapshot(&self, workspace: &str) -> Vec<MemoryRecord> {
        self.collections
            .get(workspace)
            .map(|records| records.value().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MemoryAdapter for WorkspaceAdapter {
    fn name(&self) -> &'static str {
        "workspace"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            atomic_update: false,
            namespace_reset: false,
            requires_workspace: true,
        }
    }

    async fn insert(&self, scope: &AdapterScope, record: MemoryRecord) -> SynodResult<()> {
        let workspace = scope.require_workspace("insert")?;
        self.collections
            .entry(workspace.to_string())
            .or_default()
            .push(record);
        Ok(())
    }

    async fn get(&self, scope: &AdapterScope, id: &str) -> SynodResult<Option<MemoryRecord>> {
        let workspace = scope.require_workspace("get")?;
        Ok(self
            .collections
            .get(workspace)
            .and_then(|records| records.iter().find(|r| r.id == id).cloned()))
    }

    async fn search(
        &self,
        scope: &AdapterScope,
        query: &Embedding,
        filter: Option<&MetadataFilter>,
    ) -> SynodResult<Vec<ScoredRecord>> {
        let workspace = scope.require_workspace("search")?;
        let records = self.snapshot(workspace);
        Ok(score_records(&records, query, filter))
    }

    async fn list(
        &self,
        scope: &AdapterScope,
        filter: Option<&MetadataFilter>,
    ) -> SynodResult<Vec<MemoryRecord>> {
        let workspace = scope.require_workspace("list")?;
        let mut records = self.snapshot(workspace);
        records.retain(|r| filter_matches(filter, &r.metadata));
        Ok(records)
    }

    async fn remove(&self, scope: &AdapterScope, id: &str) -> SynodResult<bool> {
        let workspace = scope.require_workspace("delete")?;
        let Some(mut records) = self.collections.get_mut(workspace) else {
            return Ok(false);
        };
        let before = records.len();
        records.retain(|r| r.id != id);
        Ok(records.len() != before)
    }

    async fn close(&self) -> SynodResult<()> {
        let workspaces = self.collections.len();
        self.collections.clear();
        tracing::debug!(workspaces = workspaces, "Closed workspace adapter");
        Ok(())
    }
}
