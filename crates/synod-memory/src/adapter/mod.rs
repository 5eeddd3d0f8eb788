//! Backend adapters behind the [`MemoryStore`](crate::store::MemoryStore)
//!
//! Two adapters ship with the crate and differ in what they can do natively:
//!
//! | adapter              | atomic update | namespace reset | needs workspace id |
//! |----------------------|---------------|-----------------|--------------------|
//! | [`KeyValueAdapter`]  | yes           | yes             | no                 |
//! | [`WorkspaceAdapter`] | no            | no              | yes                |
//!
//! The store reads [`AdapterCapabilities`] and emulates what is missing, so
//! callers above the store never branch on the backend. The visible cost is
//! that an update on a backend without atomic update produces a record with
//! a **new identifier**; identifiers must not be cached across an update.

mod key_value;
mod workspace;

pub use key_value::KeyValueAdapter;
pub use workspace::WorkspaceAdapter;

use crate::embedding::Embedding;
use crate::error::{SynodError, SynodResult};
use crate::record::{MemoryRecord, MetadataFilter, ScoredRecord};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Which adapter a run uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// [`KeyValueAdapter`]
    #[default]
    KeyValue,
    /// [`WorkspaceAdapter`]
    Workspace,
}

/// What an adapter supports natively
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterCapabilities {
    /// Records can be replaced in place, keeping their id
    pub atomic_update: bool,

    /// All records of one agent can be dropped in one call
    pub namespace_reset: bool,

    /// Calls must carry a workspace id
    pub requires_workspace: bool,
}

/// Addressing information passed with every adapter call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterScope {
    pub agent_id: String,
    pub workspace_id: Option<String>,
}

impl AdapterScope {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            workspace_id: None,
        }
    }

    pub fn with_workspace(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self
    }

    pub(crate) fn require_workspace(&self, operation: &str) -> SynodResult<&str> {
        self.workspace_id.as_deref().ok_or_else(|| {
            SynodError::invalid_input(
                "workspace_id",
                format!("{} requires a workspace id for agent '{}'", operation, self.agent_id),
            )
        })
    }
}

/// Storage backend for memory records
#[async_trait]
pub trait MemoryAdapter: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> AdapterCapabilities;

    /// Persist a new record
    async fn insert(&self, scope: &AdapterScope, record: MemoryRecord) -> SynodResult<()>;

    /// Fetch a record by id
    async fn get(&self, scope: &AdapterScope, id: &str) -> SynodResult<Option<MemoryRecord>>;

    /// Score every record in scope matching `filter` against `query`
    async fn search(
        &self,
        scope: &AdapterScope,
        query: &Embedding,
        filter: Option<&MetadataFilter>,
    ) -> SynodResult<Vec<ScoredRecord>>;

    /// List records in scope matching `filter`
    async fn list(
        &self,
        scope: &AdapterScope,
        filter: Option<&MetadataFilter>,
    ) -> SynodResult<Vec<MemoryRecord>>;

    /// Remove a record, returning whether it existed
    async fn remove(&self, scope: &AdapterScope, id: &str) -> SynodResult<bool>;

    /// Replace a record in place; only called when `atomic_update` is set
    async fn update(&self, _scope: &AdapterScope, _record: MemoryRecord) -> SynodResult<bool> {
        Err(SynodError::invalid_input(
            "operation",
            format!("{} does not support atomic update", self.name()),
        ))
    }

    /// Drop every record in scope; only called when `namespace_reset` is set
    async fn reset(&self, _scope: &AdapterScope) -> SynodResult<()> {
        Err(SynodError::invalid_input(
            "operation",
            format!("{} does not support namespace reset", self.name()),
        ))
    }

    /// Release backend resources
    async fn close(&self) -> SynodResult<()> {
        Ok(())
    }
}

/// Score descending, then most recent write first
pub(crate) fn compare_ranked(a: &ScoredRecord, b: &ScoredRecord) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.record.updated_at.cmp(&a.record.updated_at))
        .then_with(|| b.record.revision.cmp(&a.record.revision))
        .then_with(|| a.record.id.cmp(&b.record.id))
}

pub(crate) fn rank(mut candidates: Vec<ScoredRecord>, top_k: usize) -> Vec<ScoredRecord> {
    candidates.sort_by(compare_ranked);
    candidates.truncate(top_k);
    candidates
}

/// Score records that carry an embedding; others are skipped
pub(crate) fn score_records<'a>(
    records: impl IntoIterator<Item = &'a MemoryRecord>,
    query: &Embedding,
    filter: Option<&MetadataFilter>,
) -> Vec<ScoredRecord> {
    records
        .into_iter()
        .filter(|record| crate::record::filter_matches(filter, &record.metadata))
        .filter_map(|record| {
            let embedding = record.embedding.as_ref()?;
            // Incompatible embeddings cannot be compared
            let score = query.cosine_similarity(embedding).ok()?;
            if !score.is_finite() {
                return None;
            }
            Some(ScoredRecord::new(record.clone(), score))
        })
        .collect()
}
