//! Memory system lifecycle
//!
//! [`MemorySystem`] owns the single active adapter of a run. It is built
//! explicitly and passed down to whoever needs memory or communication; there
//! is no global instance. Component handles ([`MemoryStore`],
//! [`ReflectionResolver`], [`NotificationBus`], [`SessionManager`]) share its
//! lifecycle: every operation on them fails with
//! [`SynodError::Uninitialized`] before [`MemorySystem::initialize`] and after
//! [`MemorySystem::teardown`].

use crate::adapter::{BackendKind, KeyValueAdapter, MemoryAdapter, WorkspaceAdapter};
use crate::config::{ReinitPolicy, SynodConfig};
use crate::embedding::{EmbeddingProvider, TokenEmbeddingProvider};
use crate::error::{SynodError, SynodResult};
use crate::notification::{NotificationBus, NotificationCursor};
use crate::reflection::ReflectionResolver;
use crate::session::SessionManager;
use crate::storage::{validate_key_segment, InMemoryStorage, Memory};
use crate::store::MemoryStore;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// State that exists only while a run is live
pub(crate) struct ActiveRun {
    pub(crate) run_id: String,
    pub(crate) adapter: Arc<dyn MemoryAdapter>,

    /// Agent id -> workspace id, for adapters that need one
    workspaces: DashMap<String, String>,

    revision: AtomicU64,

    /// Serializes notification appends
    pub(crate) notifications: Mutex<NotificationCursor>,

    /// Serializes session read-modify-write
    pub(crate) sessions: Mutex<()>,
}

impl ActiveRun {
    pub(crate) fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn workspace_for(&self, template: &str, agent_id: &str) -> String {
        self.workspaces
            .entry(agent_id.to_string())
            .or_insert_with(|| {
                template
                    .replace("{run}", &self.run_id)
                    .replace("{agent}", agent_id)
            })
            .value()
            .clone()
    }

    /// Key prefix for run-scoped logs in shared storage
    pub(crate) fn namespace(&self, kind: &str) -> String {
        format!("run::{}::{}", self.run_id, kind)
    }
}

struct Shared {
    config: SynodConfig,
    storage: Arc<dyn Memory>,
    embedder: Arc<dyn EmbeddingProvider>,
    adapter_override: Option<Arc<dyn MemoryAdapter>>,
    active: RwLock<Option<Arc<ActiveRun>>>,

    /// Serializes initialize/teardown
    lifecycle: Mutex<()>,
}

/// Cheap, cloneable view of a [`MemorySystem`] held by component handles
#[derive(Clone)]
pub(crate) struct SystemHandle {
    shared: Arc<Shared>,
}

impl SystemHandle {
    pub(crate) fn active(&self) -> SynodResult<Arc<ActiveRun>> {
        self.shared
            .active
            .read()
            .clone()
            .ok_or(SynodError::Uninitialized)
    }

    pub(crate) fn config(&self) -> &SynodConfig {
        &self.shared.config
    }

    pub(crate) fn storage(&self) -> &Arc<dyn Memory> {
        &self.shared.storage
    }

    pub(crate) fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.shared.embedder
    }

    /// Run a backend call under the configured timeout
    pub(crate) async fn call<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = SynodResult<T>>,
    ) -> SynodResult<T> {
        let timeout = self.shared.config.backend_timeout();
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(SynodError::backend_unavailable(
                operation,
                format!("timed out after {}ms", timeout.as_millis()),
            )),
        }
    }
}

/// Builder for [`MemorySystem`]
pub struct MemorySystemBuilder {
    config: SynodConfig,
    storage: Option<Arc<dyn Memory>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    adapter: Option<Arc<dyn MemoryAdapter>>,
}

impl MemorySystemBuilder {
    pub fn new(config: SynodConfig) -> Self {
        Self {
            config,
            storage: None,
            embedder: None,
            adapter: None,
        }
    }

    /// Key/value storage for the key/value adapter and the communication logs
    pub fn storage(mut self, storage: Arc<dyn Memory>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Embedding model used for memory content and queries
    pub fn embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Use this adapter instead of the one named by `config.backend`
    pub fn adapter(mut self, adapter: Arc<dyn MemoryAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn build(self) -> SynodResult<MemorySystem> {
        self.config.validate()?;

        let embedder = self.embedder.unwrap_or_else(|| {
            Arc::new(TokenEmbeddingProvider::new(self.config.embedding_dimensions))
        });
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(InMemoryStorage::new()));

        Ok(MemorySystem {
            handle: SystemHandle {
                shared: Arc::new(Shared {
                    config: self.config,
                    storage,
                    embedder,
                    adapter_override: self.adapter,
                    active: RwLock::new(None),
                    lifecycle: Mutex::new(()),
                }),
            },
        })
    }
}

/// Owns the active backend adapter and the lifecycle of every component
#[derive(Clone)]
pub struct MemorySystem {
    handle: SystemHandle,
}

impl MemorySystem {
    /// Build with in-memory storage and the token embedding provider
    pub fn new(config: SynodConfig) -> SynodResult<Self> {
        MemorySystemBuilder::new(config).build()
    }

    pub fn builder(config: SynodConfig) -> MemorySystemBuilder {
        MemorySystemBuilder::new(config)
    }

    pub fn config(&self) -> &SynodConfig {
        self.handle.config()
    }

    pub fn is_initialized(&self) -> bool {
        self.handle.shared.active.read().is_some()
    }

    /// Id of the live run, if any
    pub fn run_id(&self) -> Option<String> {
        self.handle
            .shared
            .active
            .read()
            .as_ref()
            .map(|run| run.run_id.clone())
    }

    /// Construct the adapter for `run_id` and make the system usable
    ///
    /// While a run is live, a second call either returns Ok without touching
    /// the live adapter ([`ReinitPolicy::Idempotent`]) or fails with
    /// [`SynodError::AlreadyInitialized`] ([`ReinitPolicy::Strict`]).
    pub async fn initialize(&self, run_id: impl Into<String>) -> SynodResult<()> {
        let run_id = run_id.into();
        validate_key_segment("run_id", &run_id)?;

        let shared = &self.handle.shared;
        let _guard = shared.lifecycle.lock().await;

        let live = shared.active.read().clone();
        if let Some(live) = live {
            return match shared.config.reinit {
                ReinitPolicy::Idempotent => {
                    if live.run_id != run_id {
                        tracing::warn!(
                            live_run = %live.run_id,
                            requested_run = %run_id,
                            "Ignoring initialize for a different run while one is live"
                        );
                    }
                    Ok(())
                }
                ReinitPolicy::Strict => Err(SynodError::AlreadyInitialized {
                    run_id: live.run_id.clone(),
                }),
            };
        }

        let adapter: Arc<dyn MemoryAdapter> = match &shared.adapter_override {
            Some(adapter) => adapter.clone(),
            None => match shared.config.backend {
                BackendKind::KeyValue => Arc::new(KeyValueAdapter::new(shared.storage.clone())),
                BackendKind::Workspace => Arc::new(WorkspaceAdapter::new()),
            },
        };

        let cursor = NotificationCursor::recover(&shared.storage, &run_id).await?;

        tracing::info!(
            run_id = %run_id,
            adapter = adapter.name(),
            resumed_notifications = cursor.next_sequence,
            "Memory system initialized"
        );

        *shared.active.write() = Some(Arc::new(ActiveRun {
            run_id,
            adapter,
            workspaces: DashMap::new(),
            revision: AtomicU64::new(0),
            notifications: Mutex::new(cursor),
            sessions: Mutex::new(()),
        }));

        Ok(())
    }

    /// Release the adapter and make the system inert; a no-op when not initialized
    pub async fn teardown(&self) -> SynodResult<()> {
        let shared = &self.handle.shared;
        let _guard = shared.lifecycle.lock().await;

        let taken = shared.active.write().take();
        let Some(run) = taken else {
            return Ok(());
        };

        run.adapter.close().await?;
        tracing::info!(run_id = %run.run_id, "Memory system torn down");
        Ok(())
    }

    pub fn memory_store(&self) -> MemoryStore {
        MemoryStore::new(self.handle.clone())
    }

    pub fn resolver(&self) -> ReflectionResolver {
        ReflectionResolver::new(self.memory_store())
    }

    pub fn notifications(&self) -> NotificationBus {
        NotificationBus::new(self.handle.clone())
    }

    pub fn sessions(&self) -> SessionManager {
        SessionManager::new(self.handle.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::MemoryMetadata;

    #[tokio::test]
    async fn test_operations_fail_before_initialize() {
        let system = MemorySystem::new(SynodConfig::default()).unwrap();
        let store = system.memory_store();

        let err = store
            .add("a1", "note", MemoryMetadata::default())
            .await
            .unwrap_err();
        assert_eq!(err, SynodError::Uninitialized);
        assert!(!system.is_initialized());
    }

    #[tokio::test]
    async fn test_idempotent_reinitialize_keeps_run() {
        let system = MemorySystem::new(SynodConfig::default()).unwrap();
        system.initialize("run-1").await.unwrap();

        let store = system.memory_store();
        let id = store
            .add("a1", "kept across reinit", MemoryMetadata::default())
            .await
            .unwrap();

        system.initialize("run-1").await.unwrap();
        system.initialize("run-2").await.unwrap();

        assert_eq!(system.run_id().as_deref(), Some("run-1"));
        assert!(store.get("a1", &id).await.is_ok());
    }

    #[tokio::test]
    async fn test_strict_reinitialize_fails_loudly() {
        let config = SynodConfig::default().with_reinit(ReinitPolicy::Strict);
        let system = MemorySystem::new(config).unwrap();
        system.initialize("run-1").await.unwrap();

        let err = system.initialize("run-1").await.unwrap_err();
        assert_eq!(
            err,
            SynodError::AlreadyInitialized {
                run_id: "run-1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_teardown_makes_handles_inert() {
        let system = MemorySystem::new(SynodConfig::default()).unwrap();
        system.initialize("run-1").await.unwrap();
        let store = system.memory_store();
        let bus = system.notifications();

        store.add("a1", "note", MemoryMetadata::default()).await.unwrap();
        system.teardown().await.unwrap();

        assert_eq!(
            store.search("a1", "note", 3, None).await.unwrap_err(),
            SynodError::Uninitialized
        );
        assert_eq!(
            bus.list_for("a1", None).await.unwrap_err(),
            SynodError::Uninitialized
        );

        // A second teardown is harmless
        system.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn test_workspace_names_follow_template() {
        let system = MemorySystem::new(SynodConfig::default()).unwrap();
        system.initialize("r7").await.unwrap();
        let run = system.handle.active().unwrap();

        assert_eq!(run.workspace_for("{run}__{agent}", "valuation_analyst"), "r7__valuation_analyst");
        assert_eq!(run.namespace("notification"), "run::r7::notification");
    }

    #[tokio::test]
    async fn test_malformed_run_id_rejected() {
        let system = MemorySystem::new(SynodConfig::default()).unwrap();
        for run_id in ["  ", "r1::notification"] {
            assert!(matches!(
                system.initialize(run_id).await,
                Err(SynodError::InvalidInput { .. })
            ));
        }
        assert!(system.run_id().is_none());
    }
}
