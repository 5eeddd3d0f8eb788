//! Memory records and metadata

use crate::embedding::Embedding;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Structured metadata attached to a memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryMetadata {
    /// Type tag (`reflection`, `observation`, ...)
    pub memory_type: String,

    /// Simulation date the memory refers to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,

    /// Ticker symbol the memory refers to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticker: Option<String>,

    /// Free-form extra fields
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl MemoryMetadata {
    pub fn new(memory_type: impl Into<String>) -> Self {
        Self {
            memory_type: memory_type.into(),
            date: None,
            ticker: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_date(mut self, date: NaiveDate) -> Self {
        self.date = Some(date);
        self
    }

    pub fn with_ticker(mut self, ticker: impl Into<String>) -> Self {
        self.ticker = Some(ticker.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

impl Default for MemoryMetadata {
    fn default() -> Self {
        Self::new("general")
    }
}

/// One persisted recollection of one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Unique identifier; may change across an update on some backends
    pub id: String,

    /// Owning agent; never changes
    pub agent_id: String,

    /// Textual content
    pub content: String,

    pub metadata: MemoryMetadata,

    /// Backend-owned embedding of `content`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Embedding>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Monotonic write counter, breaks timestamp ties
    pub revision: u64,
}

impl MemoryRecord {
    pub fn new(
        agent_id: impl Into<String>,
        content: impl Into<String>,
        metadata: MemoryMetadata,
        revision: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            content: content.into(),
            metadata,
            embedding: None,
            created_at: now,
            updated_at: now,
            revision,
        }
    }

    pub fn with_embedding(mut self, embedding: Embedding) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

/// A record paired with its similarity to a query
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredRecord {
    pub record: MemoryRecord,

    /// Similarity score, higher is more similar
    pub score: f32,
}

impl ScoredRecord {
    pub fn new(record: MemoryRecord, score: f32) -> Self {
        Self { record, score }
    }
}

/// Restricts searches and listings by metadata; unset fields match anything
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataFilter {
    #[serde(default)]
    pub memory_type: Option<String>,

    #[serde(default)]
    pub date: Option<NaiveDate>,

    #[serde(default)]
    pub ticker: Option<String>,

    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_memory_type(mut self, memory_type: impl Into<String>) -> Self {
        self.memory_type = Some(memory_type.into());
        self
    }

    pub fn with_date(mut self, date: NaiveDate) -> Self {
        self.date = Some(date);
        self
    }

    pub fn with_ticker(mut self, ticker: impl Into<String>) -> Self {
        self.ticker = Some(ticker.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, metadata: &MemoryMetadata) -> bool {
        if let Some(memory_type) = &self.memory_type {
            if &metadata.memory_type != memory_type {
                return false;
            }
        }
        if self.date.is_some() && self.date != metadata.date {
            return false;
        }
        if self.ticker.is_some() && self.ticker != metadata.ticker {
            return false;
        }
        self.extra
            .iter()
            .all(|(key, value)| metadata.extra.get(key) == Some(value))
    }
}

/// Apply an optional filter
pub(crate) fn filter_matches(filter: Option<&MetadataFilter>, metadata: &MemoryMetadata) -> bool {
    filter.map_or(true, |f| f.matches(metadata))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_matches_set_fields_only() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let metadata = MemoryMetadata::new("reflection")
            .with_date(date)
            .with_ticker("AAPL")
            .with_extra("confidence", "high");

        assert!(MetadataFilter::new().matches(&metadata));
        assert!(MetadataFilter::new().with_ticker("AAPL").matches(&metadata));
        assert!(MetadataFilter::new()
            .with_memory_type("reflection")
            .with_date(date)
            .with_extra("confidence", "high")
            .matches(&metadata));
        assert!(!MetadataFilter::new().with_ticker("MSFT").matches(&metadata));
        assert!(!MetadataFilter::new().with_extra("confidence", "low").matches(&metadata));
    }

    #[test]
    fn test_record_roundtrips_through_json() {
        let record = MemoryRecord::new("a1", "note", MemoryMetadata::new("observation"), 3);
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("embedding").is_none());
        let back: MemoryRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
