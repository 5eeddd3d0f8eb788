//! Append-only notification log shared by every agent of a run
//!
//! Records are stored under `run::{run_id}::notification::{sequence}` in the
//! system's key/value storage. The sequence is assigned under a single append
//! lock, so creation order is one total order seen identically by all
//! readers. Reads have no side effects: there is no acknowledgment and no
//! "mark as read". Agents re-derive what is new with
//! [`NotificationBus::list_since`].

use crate::error::{SynodError, SynodResult};
use crate::storage::{Memory, MemoryQuery, MemoryValue};
use crate::system::SystemHandle;
use chrono::{DateTime, NaiveDate, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Recipient value that addresses every agent
pub const BROADCAST: &str = "all";

const NAMESPACE: &str = "notification";

/// Who a notification is addressed to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipients {
    Broadcast,
    Agents(BTreeSet<String>),
}

impl Recipients {
    /// Build from agent ids; an empty set or [`BROADCAST`] means everyone
    pub fn agents<I, S>(agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let agents: BTreeSet<String> = agents
            .into_iter()
            .map(|a| Into::<String>::into(a).trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();

        if agents.is_empty() || agents.contains(BROADCAST) {
            Self::Broadcast
        } else {
            Self::Agents(agents)
        }
    }

    pub fn agent(agent_id: impl Into<String>) -> Self {
        Self::agents([agent_id.into()])
    }

    /// Collapse an empty or sentinel agent set into [`Recipients::Broadcast`]
    pub fn normalized(self) -> Self {
        match self {
            Self::Agents(agents) => Self::agents(agents),
            broadcast => broadcast,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self, Self::Broadcast)
    }

    pub fn includes(&self, agent_id: &str) -> bool {
        match self {
            Self::Broadcast => true,
            Self::Agents(agents) => agents.contains(agent_id),
        }
    }
}

/// One immutable message on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: String,

    /// Position in the run's total order, starting at 0
    pub sequence: u64,

    pub sender: String,

    pub recipients: Recipients,

    pub content: String,

    /// Non-decreasing along `sequence`
    pub created_at: DateTime<Utc>,

    /// Simulation date tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
}

impl NotificationRecord {
    pub fn is_visible_to(&self, agent_id: &str) -> bool {
        self.recipients.includes(agent_id)
    }

    fn matches(&self, agent_id: &str, date: Option<NaiveDate>) -> bool {
        self.is_visible_to(agent_id) && date.map_or(true, |d| self.date == Some(d))
    }
}

/// Append position of a run's notification log
#[derive(Debug, Clone, Default)]
pub(crate) struct NotificationCursor {
    pub(crate) next_sequence: u64,
    last_created_at: Option<DateTime<Utc>>,
}

impl NotificationCursor {
    /// Pick up after whatever a previous process left in storage for this run
    pub(crate) async fn recover(storage: &Arc<dyn Memory>, run_id: &str) -> SynodResult<Self> {
        let namespace = log_namespace(run_id);
        let keys = storage
            .keys(&MemoryQuery::new().with_namespace(namespace))
            .await?;

        let mut cursor = Self::default();
        for key in keys {
            let Some(value) = storage.get(&key).await? else {
                continue;
            };
            let record = decode(&value)?;
            if record.sequence >= cursor.next_sequence {
                cursor.next_sequence = record.sequence + 1;
            }
            if cursor.last_created_at.map_or(true, |t| record.created_at > t) {
                cursor.last_created_at = Some(record.created_at);
            }
        }
        Ok(cursor)
    }

    fn next_timestamp(&self) -> DateTime<Utc> {
        let now = Utc::now();
        match self.last_created_at {
            Some(last) if last > now => last,
            _ => now,
        }
    }
}

fn log_namespace(run_id: &str) -> String {
    format!("run::{}::{}", run_id, NAMESPACE)
}

fn record_key(namespace: &str, sequence: u64) -> String {
    format!("{}::{:012}", namespace, sequence)
}

fn decode(value: &MemoryValue) -> SynodResult<NotificationRecord> {
    let json = value.as_json().ok_or_else(|| SynodError::Storage {
        operation: "deserialize_notification".to_string(),
        message: "expected a JSON value".to_string(),
    })?;
    serde_json::from_value(json.clone())
        .map_err(|e| SynodError::storage("deserialize_notification", e))
}

/// Publish and read notifications of the live run
#[derive(Clone)]
pub struct NotificationBus {
    handle: SystemHandle,
}

impl NotificationBus {
    pub(crate) fn new(handle: SystemHandle) -> Self {
        Self { handle }
    }

    /// Append a notification and return its id
    pub async fn publish(
        &self,
        sender: &str,
        recipients: Recipients,
        content: &str,
        date: Option<NaiveDate>,
    ) -> SynodResult<String> {
        let run = self.handle.active()?;
        if sender.trim().is_empty() {
            return Err(SynodError::invalid_input("sender", "must not be empty"));
        }
        if content.trim().is_empty() {
            return Err(SynodError::invalid_input("content", "must not be empty"));
        }

        let mut cursor = run.notifications.lock().await;
        let record = NotificationRecord {
            id: uuid::Uuid::new_v4().to_string(),
            sequence: cursor.next_sequence,
            sender: sender.to_string(),
            recipients: recipients.normalized(),
            content: content.to_string(),
            created_at: cursor.next_timestamp(),
            date,
        };

        let key = record_key(&run.namespace(NAMESPACE), record.sequence);
        let value = MemoryValue::Json(
            serde_json::to_value(&record)
                .map_err(|e| SynodError::storage("serialize_notification", e))?,
        );
        self.handle
            .call("publish", self.handle.storage().set(&key, value))
            .await?;

        cursor.next_sequence = record.sequence + 1;
        cursor.last_created_at = Some(record.created_at);
        drop(cursor);

        tracing::info!(
            sender = sender,
            sequence = record.sequence,
            broadcast = record.recipients.is_broadcast(),
            date = ?date,
            "Published notification"
        );
        Ok(record.id)
    }

    /// Everything addressed to `agent_id` or broadcast, oldest first
    ///
    /// With a date filter, only records tagged with exactly that date are
    /// returned.
    pub async fn list_for(
        &self,
        agent_id: &str,
        date: Option<NaiveDate>,
    ) -> SynodResult<Vec<NotificationRecord>> {
        let records = self.load("list_for").await?;
        Ok(records
            .into_iter()
            .filter(|r| r.matches(agent_id, date))
            .collect())
    }

    /// Records visible to `agent_id` with a sequence greater than `after_sequence`
    pub async fn list_since(
        &self,
        agent_id: &str,
        after_sequence: Option<u64>,
    ) -> SynodResult<Vec<NotificationRecord>> {
        let records = self.load("list_since").await?;
        Ok(records
            .into_iter()
            .filter(|r| after_sequence.map_or(true, |after| r.sequence > after))
            .filter(|r| r.is_visible_to(agent_id))
            .collect())
    }

    /// Lazy variant of [`list_for`](Self::list_for)
    ///
    /// Each record is read from storage as the stream is polled. The stream
    /// covers the log as it was when polling started; a fresh call restarts it.
    pub fn stream_for(
        &self,
        agent_id: impl Into<String>,
        date: Option<NaiveDate>,
    ) -> impl Stream<Item = SynodResult<NotificationRecord>> + Send + 'static {
        let handle = self.handle.clone();
        let agent_id = agent_id.into();

        async_stream::try_stream! {
            let run = handle.active()?;
            let query = MemoryQuery::new().with_namespace(run.namespace(NAMESPACE));
            let mut keys = handle.call("stream_for", handle.storage().keys(&query)).await?;
            keys.sort();

            for key in keys {
                let value = handle.call("stream_for", handle.storage().get(&key)).await?;
                if let Some(value) = value {
                    let record = decode(&value)?;
                    if record.matches(&agent_id, date) {
                        yield record;
                    }
                }
            }
        }
    }

    /// Number of notifications published in the live run
    pub async fn len(&self) -> SynodResult<usize> {
        let run = self.handle.active()?;
        let namespace = run.namespace(NAMESPACE);
        self.handle
            .call("len", self.handle.storage().count(Some(&namespace)))
            .await
    }

    pub async fn is_empty(&self) -> SynodResult<bool> {
        Ok(self.len().await? == 0)
    }

    async fn load(&self, operation: &str) -> SynodResult<Vec<NotificationRecord>> {
        let run = self.handle.active()?;
        let storage = self.handle.storage();
        let query = MemoryQuery::new().with_namespace(run.namespace(NAMESPACE));
        let keys = self.handle.call(operation, storage.keys(&query)).await?;

        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.handle.call(operation, storage.get(&key)).await? {
                records.push(decode(&value)?);
            }
        }
        records.sort_by_key(|r| r.sequence);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SynodConfig;
    use crate::storage::InMemoryStorage;
    use crate::system::MemorySystem;
    use futures::StreamExt;

    async fn bus() -> NotificationBus {
        let system = MemorySystem::new(SynodConfig::default()).unwrap();
        system.initialize("run-1").await.unwrap();
        system.notifications()
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    #[test]
    fn test_recipients_normalize_to_broadcast() {
        assert!(Recipients::agents(Vec::<String>::new()).is_broadcast());
        assert!(Recipients::agents(["pm", "all"]).is_broadcast());
        assert!(!Recipients::agent("pm").includes("risk_manager"));
    }

    #[tokio::test]
    async fn test_targeted_and_broadcast_visibility() {
        let bus = bus().await;
        bus.publish("pm", Recipients::Broadcast, "market open", None)
            .await
            .unwrap();
        bus.publish("pm", Recipients::agent("technical_analyst"), "check RSI", None)
            .await
            .unwrap();

        let technical = bus.list_for("technical_analyst", None).await.unwrap();
        let valuation = bus.list_for("valuation_analyst", None).await.unwrap();

        assert_eq!(technical.len(), 2);
        assert_eq!(valuation.len(), 1);
        assert_eq!(valuation[0].content, "market open");
    }

    #[tokio::test]
    async fn test_raw_empty_or_sentinel_agents_are_broadcast() {
        let bus = bus().await;
        bus.publish("pm", Recipients::Agents(BTreeSet::new()), "nobody listed", None)
            .await
            .unwrap();
        bus.publish(
            "pm",
            Recipients::Agents(BTreeSet::from([BROADCAST.to_string()])),
            "sentinel listed",
            None,
        )
        .await
        .unwrap();

        let visible = bus.list_for("a1", None).await.unwrap();
        assert_eq!(visible.len(), 2);
        assert!(visible.iter().all(|r| r.recipients.is_broadcast()));
    }

    #[tokio::test]
    async fn test_date_filter_and_ordering() {
        let bus = bus().await;
        for (i, d) in [1, 2, 1, 3, 1].into_iter().enumerate() {
            bus.publish("pm", Recipients::Broadcast, &format!("msg {}", i), Some(day(d)))
                .await
                .unwrap();
        }
        bus.publish("pm", Recipients::Broadcast, "untagged", None)
            .await
            .unwrap();

        let first = bus.list_for("a1", Some(day(1))).await.unwrap();
        let contents: Vec<_> = first.iter().map(|r| r.content.as_str()).collect();
        assert_eq!(contents, vec!["msg 0", "msg 2", "msg 4"]);
        assert!(first.windows(2).all(|w| w[0].created_at <= w[1].created_at));

        // Reads have no side effect
        assert_eq!(bus.list_for("a1", Some(day(1))).await.unwrap(), first);
        assert_eq!(bus.len().await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_list_since_rederives_new_records() {
        let bus = bus().await;
        bus.publish("pm", Recipients::Broadcast, "one", None).await.unwrap();
        let seen = bus.list_for("a1", None).await.unwrap();
        let last = seen.last().map(|r| r.sequence);

        bus.publish("pm", Recipients::Broadcast, "two", None).await.unwrap();
        let fresh = bus.list_since("a1", last).await.unwrap();
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].content, "two");
    }

    #[tokio::test]
    async fn test_stream_matches_list() {
        let bus = bus().await;
        bus.publish("pm", Recipients::Broadcast, "one", None).await.unwrap();
        bus.publish("pm", Recipients::agent("other"), "hidden", None).await.unwrap();
        bus.publish("pm", Recipients::Broadcast, "two", None).await.unwrap();

        let streamed: Vec<_> = bus
            .stream_for("a1", None)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<SynodResult<_>>()
            .unwrap();
        assert_eq!(streamed, bus.list_for("a1", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_publishers_get_distinct_sequences() {
        let bus = bus().await;
        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let bus = bus.clone();
                tokio::spawn(async move {
                    bus.publish(&format!("agent_{}", i), Recipients::Broadcast, "hi", None)
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let records = bus.list_for("anyone", None).await.unwrap();
        let sequences: Vec<_> = records.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, (0..16).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_sequence_resumes_from_storage() {
        let storage: Arc<dyn Memory> = Arc::new(InMemoryStorage::new());
        let first = MemorySystem::builder(SynodConfig::default())
            .storage(storage.clone())
            .build()
            .unwrap();
        first.initialize("run-9").await.unwrap();
        first
            .notifications()
            .publish("pm", Recipients::Broadcast, "before restart", None)
            .await
            .unwrap();
        first.teardown().await.unwrap();

        let second = MemorySystem::builder(SynodConfig::default())
            .storage(storage)
            .build()
            .unwrap();
        second.initialize("run-9").await.unwrap();
        let bus = second.notifications();
        bus.publish("pm", Recipients::Broadcast, "after restart", None)
            .await
            .unwrap();

        let records = bus.list_for("a1", None).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].sequence, 1);
    }

    #[tokio::test]
    async fn test_empty_content_rejected() {
        let bus = bus().await;
        assert!(matches!(
            bus.publish("pm", Recipients::Broadcast, " ", None).await,
            Err(SynodError::InvalidInput { .. })
        ));
    }
}
