//! Key/value storage primitive
//!
//! Keys are `::`-separated paths (`run::r1::notification::0`). A namespace is
//! any key prefix; `count`, `clear` and `keys` operate on everything below it.

mod in_memory;

pub use in_memory::InMemoryStorage;

use crate::error::{SynodError, SynodResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A value held by a [`Memory`] backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MemoryValue {
    String(String),
    Integer(i64),
    Json(serde_json::Value),
}

impl MemoryValue {
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(j) => Some(j),
            _ => None,
        }
    }
}

impl From<&str> for MemoryValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for MemoryValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for MemoryValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<serde_json::Value> for MemoryValue {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

/// Selects keys from a [`Memory`] backend
#[derive(Debug, Clone, Default)]
pub struct MemoryQuery {
    /// Only keys below this namespace
    pub namespace: Option<String>,

    /// Maximum number of keys returned
    pub limit: Option<usize>,
}

impl MemoryQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Async key/value storage backend
#[async_trait]
pub trait Memory: Send + Sync {
    /// Store a value, replacing any previous one
    async fn set(&self, key: &str, value: MemoryValue) -> SynodResult<()>;

    /// Fetch a value
    async fn get(&self, key: &str) -> SynodResult<Option<MemoryValue>>;

    /// Remove a value, returning whether it existed
    async fn delete(&self, key: &str) -> SynodResult<bool>;

    /// List keys in ascending order
    async fn keys(&self, query: &MemoryQuery) -> SynodResult<Vec<String>>;

    /// Count keys, optionally below a namespace
    async fn count(&self, namespace: Option<&str>) -> SynodResult<usize>;

    /// Remove keys, optionally only below a namespace
    async fn clear(&self, namespace: Option<&str>) -> SynodResult<()>;
}

/// Separator between key segments
pub(crate) const KEY_SEPARATOR: &str = "::";

/// Reject ids that would split into extra key segments
pub(crate) fn validate_key_segment(field: &str, value: &str) -> SynodResult<()> {
    if value.trim().is_empty() {
        return Err(SynodError::invalid_input(field, "must not be empty"));
    }
    if value.contains(KEY_SEPARATOR) {
        return Err(SynodError::invalid_input(
            field,
            format!("must not contain '{}'", KEY_SEPARATOR),
        ));
    }
    Ok(())
}

/// Whether `key` lives below `namespace`
pub(crate) fn in_namespace(key: &str, namespace: &str) -> bool {
    key.strip_prefix(namespace)
        .map(|rest| rest.starts_with(KEY_SEPARATOR))
        .unwrap_or(false)
}
