//! Reflection-driven memory mutation
//!
//! After each cycle an agent reviews its own performance and produces a
//! [`ReflectionVerdict`]. The resolver turns that verdict into at most one
//! update or delete against the agent's own memory:
//!
//! ```text
//! NewVerdict ──needs_mutation=false──────────────▶ Skipped
//!     │
//!     ▼
//! Resolving ──explicit id──▶ apply ──ok──▶ Applied
//!     │                        │
//!     └──auto: search(query)───┤──err──▶ Failed
//!          best score <= min_confidence ──▶ Failed (NotFound)
//!          best candidate owned by another agent ──▶ Failed (Unauthorized)
//! ```
//!
//! Auto-resolution never falls back to creating a record. Given the same
//! store contents and verdict, the decision is the same: candidates are
//! ranked by score, then most recent write.

use crate::error::{ErrorKind, SynodError, SynodResult};
use crate::retry::RetryPolicy;
use crate::store::MemoryStore;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Target value that requests search-based resolution
pub const AUTO_TARGET: &str = "auto";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Update,
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOperation {
    Update { new_content: String },
    Delete,
}

impl MutationOperation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Update { .. } => OperationKind::Update,
            Self::Delete => OperationKind::Delete,
        }
    }
}

/// Which memory a mutation applies to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTarget {
    Id(String),
    /// Resolve by searching the agent's memory
    Auto { query: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryMutation {
    pub operation: MutationOperation,
    pub target: MemoryTarget,
}

impl MemoryMutation {
    pub fn update_by_id(id: impl Into<String>, new_content: impl Into<String>) -> Self {
        Self {
            operation: MutationOperation::Update {
                new_content: new_content.into(),
            },
            target: MemoryTarget::Id(id.into()),
        }
    }

    pub fn update_auto(query: impl Into<String>, new_content: impl Into<String>) -> Self {
        Self {
            operation: MutationOperation::Update {
                new_content: new_content.into(),
            },
            target: MemoryTarget::Auto {
                query: query.into(),
            },
        }
    }

    pub fn delete_by_id(id: impl Into<String>) -> Self {
        Self {
            operation: MutationOperation::Delete,
            target: MemoryTarget::Id(id.into()),
        }
    }

    pub fn delete_auto(query: impl Into<String>) -> Self {
        Self {
            operation: MutationOperation::Delete,
            target: MemoryTarget::Auto {
                query: query.into(),
            },
        }
    }

    fn validate(&self) -> SynodResult<()> {
        match &self.target {
            MemoryTarget::Id(id) if id.trim().is_empty() => {
                return Err(SynodError::invalid_input("memory_id", "must not be empty"));
            }
            MemoryTarget::Auto { query } if query.trim().is_empty() => {
                return Err(SynodError::invalid_input("query", "auto target needs a query"));
            }
            _ => {}
        }
        if let MutationOperation::Update { new_content } = &self.operation {
            if new_content.trim().is_empty() {
                return Err(SynodError::invalid_input("new_content", "update needs content"));
            }
        }
        Ok(())
    }
}

/// An agent's structured self-review for one cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReflectionVerdict {
    pub agent_id: String,
    pub date: Option<NaiveDate>,
    pub summary: String,
    /// `None` when the review asks for no change
    pub mutation: Option<MemoryMutation>,
}

impl ReflectionVerdict {
    /// A verdict that keeps memory as is
    pub fn keep(agent_id: impl Into<String>, date: Option<NaiveDate>, summary: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            date,
            summary: summary.into(),
            mutation: None,
        }
    }

    pub fn mutate(
        agent_id: impl Into<String>,
        date: Option<NaiveDate>,
        summary: impl Into<String>,
        mutation: MemoryMutation,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            date,
            summary: summary.into(),
            mutation: Some(mutation),
        }
    }

    pub fn needs_mutation(&self) -> bool {
        self.mutation.is_some()
    }

    /// Parse the JSON produced by an agent's self-review
    pub fn from_json(json: &str) -> SynodResult<Self> {
        let payload: VerdictPayload = serde_json::from_str(json)
            .map_err(|e| SynodError::invalid_input("verdict", e.to_string()))?;
        payload.try_into()
    }

    pub fn validate(&self) -> SynodResult<()> {
        if self.agent_id.trim().is_empty() {
            return Err(SynodError::invalid_input("agent_id", "must not be empty"));
        }
        match &self.mutation {
            Some(mutation) => mutation.validate(),
            None => Ok(()),
        }
    }
}

/// Flat wire shape of a verdict
///
/// `memory_id` holds either a record id or `"auto"`; with `"auto"` the
/// `query` is required. `new_content` is required for updates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictPayload {
    pub agent_id: String,
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub summary: String,
    pub needs_mutation: bool,
    #[serde(default)]
    pub operation: Option<OperationKind>,
    #[serde(default)]
    pub memory_id: Option<String>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub new_content: Option<String>,
}

impl TryFrom<VerdictPayload> for ReflectionVerdict {
    type Error = SynodError;

    fn try_from(payload: VerdictPayload) -> Result<Self, Self::Error> {
        if !payload.needs_mutation {
            let verdict = ReflectionVerdict::keep(payload.agent_id, payload.date, payload.summary);
            verdict.validate()?;
            return Ok(verdict);
        }

        let operation = match payload.operation {
            Some(OperationKind::Update) => MutationOperation::Update {
                new_content: payload
                    .new_content
                    .ok_or_else(|| SynodError::invalid_input("new_content", "update needs content"))?,
            },
            Some(OperationKind::Delete) => MutationOperation::Delete,
            None => {
                return Err(SynodError::invalid_input(
                    "operation",
                    "required when needs_mutation is true",
                ))
            }
        };

        let memory_id = payload
            .memory_id
            .ok_or_else(|| SynodError::invalid_input("memory_id", "required when needs_mutation is true"))?;
        let target = if memory_id.trim().eq_ignore_ascii_case(AUTO_TARGET) {
            MemoryTarget::Auto {
                query: payload.query.unwrap_or_default(),
            }
        } else {
            MemoryTarget::Id(memory_id)
        };

        let verdict = ReflectionVerdict::mutate(
            payload.agent_id,
            payload.date,
            payload.summary,
            MemoryMutation { operation, target },
        );
        verdict.validate()?;
        Ok(verdict)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionState {
    NewVerdict,
    Resolving,
    Applied,
    Skipped,
    Failed,
}

impl ResolutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Applied | Self::Skipped | Self::Failed)
    }
}

impl fmt::Display for ResolutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NewVerdict => "new_verdict",
            Self::Resolving => "resolving",
            Self::Applied => "applied",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Outcome of resolving one verdict
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub agent_id: String,
    pub date: Option<NaiveDate>,
    pub state: ResolutionState,
    pub operation: Option<OperationKind>,

    /// Record the mutation was aimed at
    pub target_id: Option<String>,

    /// Id of the record after an update; differs from `target_id` when the
    /// backend replaces records instead of updating them
    pub resulting_id: Option<String>,

    /// Score of the best auto-resolution candidate
    pub score: Option<f32>,

    pub error: Option<SynodError>,
}

impl Resolution {
    fn new(verdict: &ReflectionVerdict) -> Self {
        Self {
            agent_id: verdict.agent_id.clone(),
            date: verdict.date,
            state: ResolutionState::NewVerdict,
            operation: verdict.mutation.as_ref().map(|m| m.operation.kind()),
            target_id: None,
            resulting_id: None,
            score: None,
            error: None,
        }
    }

    fn transition(&mut self, state: ResolutionState) {
        tracing::debug!(
            agent_id = %self.agent_id,
            from = %self.state,
            to = %state,
            "Reflection state transition"
        );
        self.state = state;
    }

    fn fail(mut self, error: SynodError) -> Self {
        tracing::warn!(
            agent_id = %self.agent_id,
            target_id = ?self.target_id,
            score = ?self.score,
            error = %error,
            "Reflection resolution failed"
        );
        self.transition(ResolutionState::Failed);
        self.error = Some(error);
        self
    }

    pub fn is_applied(&self) -> bool {
        self.state == ResolutionState::Applied
    }

    pub fn is_failed(&self) -> bool {
        self.state == ResolutionState::Failed
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(SynodError::kind)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.date {
            Some(date) => write!(f, "[{}] ", date)?,
            None => write!(f, "[-] ")?,
        }
        write!(f, "{}: {}", self.agent_id, self.state)?;
        if let Some(operation) = self.operation {
            write!(f, " {}", operation)?;
        }
        if let Some(target) = &self.target_id {
            write!(f, " memory {}", target)?;
            if let Some(resulting) = self.resulting_id.as_ref().filter(|r| *r != target) {
                write!(f, " -> {}", resulting)?;
            }
        }
        if let Some(score) = self.score {
            write!(f, " (score {:.3})", score)?;
        }
        if let Some(error) = &self.error {
            write!(f, ": {}", error)?;
        }
        Ok(())
    }
}

/// Outcome of one reflection cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReviewSummary {
    pub resolutions: Vec<Resolution>,
}

impl ReviewSummary {
    pub fn applied(&self) -> usize {
        self.count(ResolutionState::Applied)
    }

    pub fn skipped(&self) -> usize {
        self.count(ResolutionState::Skipped)
    }

    pub fn failed(&self) -> usize {
        self.count(ResolutionState::Failed)
    }

    fn count(&self, state: ResolutionState) -> usize {
        self.resolutions.iter().filter(|r| r.state == state).count()
    }

    /// Human-readable review, one line per verdict
    pub fn render(&self) -> String {
        let mut out = format!(
            "Reflection review: {} applied, {} skipped, {} failed\n",
            self.applied(),
            self.skipped(),
            self.failed()
        );
        for resolution in &self.resolutions {
            out.push_str(&format!("- {}\n", resolution));
        }
        out
    }
}

/// Records touched earlier in the same cycle
#[derive(Debug, Default)]
struct CycleLedger {
    touched: HashSet<String>,
}

impl CycleLedger {
    fn contains(&self, id: &str) -> bool {
        self.touched.contains(id)
    }

    fn record(&mut self, resolution: &Resolution) {
        if !resolution.is_applied() {
            return;
        }
        self.touched.extend(resolution.target_id.iter().cloned());
        self.touched.extend(resolution.resulting_id.iter().cloned());
    }
}

/// Applies reflection verdicts to the owning agent's memory
#[derive(Clone)]
pub struct ReflectionResolver {
    store: MemoryStore,
    min_confidence: f32,
    top_k: usize,
    retry: RetryPolicy,
}

impl ReflectionResolver {
    pub fn new(store: MemoryStore) -> Self {
        let (min_confidence, top_k, retry) = store.resolve_settings();
        Self {
            store,
            min_confidence,
            top_k,
            retry,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn min_confidence(&self) -> f32 {
        self.min_confidence
    }

    /// Resolve one verdict
    ///
    /// Returns `Err` only when the system is not initialized or the verdict
    /// is malformed. Every other failure, including a retrieval miss and a
    /// cross-agent target, is a [`ResolutionState::Failed`] resolution.
    pub async fn resolve(&self, verdict: &ReflectionVerdict) -> SynodResult<Resolution> {
        self.resolve_in(verdict, None).await
    }

    /// Resolve a cycle's verdicts in order
    ///
    /// A verdict whose target was already updated or deleted earlier in the
    /// same batch fails with `NotFound` instead of acting on stale state.
    /// Malformed verdicts are reported as failed entries.
    pub async fn resolve_cycle(&self, verdicts: &[ReflectionVerdict]) -> SynodResult<ReviewSummary> {
        self.store.ensure_ready()?;

        let mut ledger = CycleLedger::default();
        let mut summary = ReviewSummary::default();
        for verdict in verdicts {
            let resolution = match self.resolve_in(verdict, Some(&mut ledger)).await {
                Ok(resolution) => resolution,
                Err(SynodError::Uninitialized) => return Err(SynodError::Uninitialized),
                Err(err) => Resolution::new(verdict).fail(err),
            };
            ledger.record(&resolution);
            summary.resolutions.push(resolution);
        }

        tracing::info!(
            verdicts = verdicts.len(),
            applied = summary.applied(),
            skipped = summary.skipped(),
            failed = summary.failed(),
            "Reflection cycle resolved"
        );
        Ok(summary)
    }

    async fn resolve_in(
        &self,
        verdict: &ReflectionVerdict,
        ledger: Option<&mut CycleLedger>,
    ) -> SynodResult<Resolution> {
        self.store.ensure_ready()?;
        verdict.validate()?;

        let mut resolution = Resolution::new(verdict);
        let Some(mutation) = &verdict.mutation else {
            resolution.transition(ResolutionState::Skipped);
            return Ok(resolution);
        };
        resolution.transition(ResolutionState::Resolving);

        let target_id = match &mutation.target {
            MemoryTarget::Id(id) => id.clone(),
            MemoryTarget::Auto { query } => {
                match self.auto_target(&verdict.agent_id, query, &mut resolution).await {
                    Ok(id) => id,
                    Err(SynodError::Uninitialized) => return Err(SynodError::Uninitialized),
                    Err(err) => return Ok(resolution.fail(err)),
                }
            }
        };
        resolution.target_id = Some(target_id.clone());

        if ledger.is_some_and(|l| l.contains(&target_id)) {
            return Ok(resolution.fail(SynodError::not_found("memory", target_id)));
        }

        match self.apply(&verdict.agent_id, &target_id, &mutation.operation).await {
            Ok(resulting_id) => {
                resolution.resulting_id = resulting_id;
                resolution.transition(ResolutionState::Applied);
                tracing::info!(
                    agent_id = %verdict.agent_id,
                    operation = ?resolution.operation,
                    target_id = %target_id,
                    resulting_id = ?resolution.resulting_id,
                    score = ?resolution.score,
                    "Reflection applied"
                );
                Ok(resolution)
            }
            Err(SynodError::Uninitialized) => Err(SynodError::Uninitialized),
            Err(err) => Ok(resolution.fail(err)),
        }
    }

    /// Best candidate for `query`, if it clears the threshold and belongs to `agent_id`
    async fn auto_target(
        &self,
        agent_id: &str,
        query: &str,
        resolution: &mut Resolution,
    ) -> SynodResult<String> {
        let candidates = self
            .retry
            .run("search", || self.store.search(agent_id, query, self.top_k, None))
            .await?;

        let Some(best) = candidates.into_iter().next() else {
            return Err(SynodError::not_found("memory", format!("auto:{}", query)));
        };
        resolution.score = Some(best.score);

        if best.score.is_nan() || best.score <= self.min_confidence {
            tracing::debug!(
                agent_id = agent_id,
                score = best.score,
                min_confidence = self.min_confidence,
                "Best candidate below confidence threshold"
            );
            return Err(SynodError::not_found("memory", format!("auto:{}", query)));
        }

        if best.record.agent_id != agent_id {
            resolution.target_id = Some(best.record.id.clone());
            return Err(SynodError::unauthorized(
                agent_id,
                &best.record.agent_id,
                resolution.operation.map_or("mutate".to_string(), |op| op.to_string()),
                "memory",
            ));
        }

        Ok(best.record.id)
    }

    /// Returns the id of the record after the operation, if one remains
    async fn apply(
        &self,
        agent_id: &str,
        id: &str,
        operation: &MutationOperation,
    ) -> SynodResult<Option<String>> {
        match operation {
            MutationOperation::Update { new_content } => {
                let record = self
                    .retry
                    .run("update", || self.store.update(agent_id, id, new_content))
                    .await?;
                Ok(Some(record.id))
            }
            MutationOperation::Delete => {
                self.retry
                    .run("delete", || self.store.delete(agent_id, id))
                    .await?;
                Ok(None)
            }
        }
    }
}
