//! Configuration for the memory system

use crate::adapter::BackendKind;
use crate::error::{SynodError, SynodResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// What a second `initialize` does while a run is live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReinitPolicy {
    /// Keep the live run and return Ok
    #[default]
    Idempotent,
    /// Fail with `AlreadyInitialized`
    Strict,
}

/// Bounded exponential backoff for retryable backend failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 1_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Configuration for the memory system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynodConfig {
    /// Which adapter backs the memory store
    pub backend: BackendKind,

    /// Auto-resolution picks a candidate only if it scores strictly above this
    pub min_confidence: f32,

    /// `top_k` used by `search_default`
    pub default_top_k: usize,

    /// Candidates fetched during auto-resolution
    pub resolve_top_k: usize,

    /// Workspace naming for the workspace adapter; `{run}` and `{agent}` are substituted
    pub workspace_template: String,

    /// Per backend call timeout
    pub backend_timeout_ms: u64,

    pub reinit: ReinitPolicy,

    /// Dimensions of the built-in token embedding provider
    pub embedding_dimensions: usize,

    pub retry: RetryConfig,
}

impl Default for SynodConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::KeyValue,
            min_confidence: 0.3,
            default_top_k: 5,
            resolve_top_k: 5,
            workspace_template: "{run}__{agent}".to_string(),
            backend_timeout_ms: 5_000,
            reinit: ReinitPolicy::Idempotent,
            embedding_dimensions: 512,
            retry: RetryConfig::default(),
        }
    }
}

impl SynodConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml_str(source: &str) -> SynodResult<Self> {
        let config: SynodConfig =
            toml::from_str(source).map_err(|e| SynodError::invalid_input("config", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file
    pub fn from_path(path: impl AsRef<Path>) -> SynodResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            SynodError::invalid_input("config", format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_min_confidence(mut self, min_confidence: f32) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    pub fn with_default_top_k(mut self, top_k: usize) -> Self {
        self.default_top_k = top_k;
        self
    }

    pub fn with_resolve_top_k(mut self, top_k: usize) -> Self {
        self.resolve_top_k = top_k;
        self
    }

    pub fn with_workspace_template(mut self, template: impl Into<String>) -> Self {
        self.workspace_template = template.into();
        self
    }

    pub fn with_backend_timeout(mut self, timeout: Duration) -> Self {
        self.backend_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_reinit(mut self, reinit: ReinitPolicy) -> Self {
        self.reinit = reinit;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    /// Check value ranges
    pub fn validate(&self) -> SynodResult<()> {
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(SynodError::invalid_input(
                "min_confidence",
                format!("must be within [0, 1], got {}", self.min_confidence),
            ));
        }
        if self.default_top_k == 0 {
            return Err(SynodError::invalid_input("default_top_k", "must be greater than 0"));
        }
        if self.resolve_top_k == 0 {
            return Err(SynodError::invalid_input("resolve_top_k", "must be greater than 0"));
        }
        if !self.workspace_template.contains("{agent}") {
            return Err(SynodError::invalid_input(
                "workspace_template",
                "must contain {agent} so agents never share a workspace",
            ));
        }
        if self.backend_timeout_ms == 0 {
            return Err(SynodError::invalid_input("backend_timeout_ms", "must be greater than 0"));
        }
        if self.embedding_dimensions == 0 {
            return Err(SynodError::invalid_input("embedding_dimensions", "must be greater than 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(SynodError::invalid_input("retry.max_attempts", "must be at least 1"));
        }
        if self.retry.backoff_multiplier <= 0.0 {
            return Err(SynodError::invalid_input(
                "retry.backoff_multiplier",
                "must be positive",
            ));
        }
        Ok(())
    }
}
