//! # Synod Memory
//!
//! Memory and communication core for multi-agent simulations, where analyst
//! and manager agents remember, revise their own recollections after each
//! cycle, and talk to each other.
//!
//! - **[`MemoryStore`]**: per-agent semantic memory over a swappable adapter
//! - **[`ReflectionResolver`]**: turns a self-review verdict into at most one
//!   update or delete, resolving the target by search when no id is given
//! - **[`NotificationBus`]**: append-only, totally ordered, broadcast or
//!   targeted messages
//! - **[`SessionManager`]**: round-based private chats and meetings
//!
//! Everything hangs off an explicitly constructed [`MemorySystem`]:
//!
//! ```rust,no_run
//! use synod_memory::{MemoryMetadata, MemoryMutation, MemorySystem, ReflectionVerdict, SynodConfig};
//!
//! # async fn demo() -> synod_memory::SynodResult<()> {
//! let system = MemorySystem::new(SynodConfig::default())?;
//! system.initialize("run-2024-q1").await?;
//!
//! let store = system.memory_store();
//! store
//!     .add("fundamentals_analyst", "overweighted growth signals in Q1", MemoryMetadata::new("reflection"))
//!     .await?;
//!
//! let verdict = ReflectionVerdict::mutate(
//!     "fundamentals_analyst",
//!     None,
//!     "growth calls were early",
//!     MemoryMutation::update_auto("growth signal weighting", "growth signals need confirmation from valuation"),
//! );
//! let resolution = system.resolver().resolve(&verdict).await?;
//! println!("{}", resolution);
//!
//! system.teardown().await?;
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod config;
pub mod embedding;
pub mod error;
pub mod notification;
pub mod record;
pub mod reflection;
pub mod retry;
pub mod session;
pub mod storage;
pub mod store;
pub mod system;

pub use adapter::{AdapterCapabilities, AdapterScope, BackendKind, KeyValueAdapter, MemoryAdapter, WorkspaceAdapter};
pub use config::{ReinitPolicy, RetryConfig, SynodConfig};
pub use embedding::{Embedding, EmbeddingProvider, TokenEmbeddingProvider};
pub use error::{ErrorKind, SynodError, SynodResult};
pub use notification::{NotificationBus, NotificationRecord, Recipients, BROADCAST};
pub use record::{MemoryMetadata, MemoryRecord, MetadataFilter, ScoredRecord};
pub use reflection::{
    MemoryMutation, MemoryTarget, MutationOperation, OperationKind, ReflectionResolver, ReflectionVerdict,
    Resolution, ResolutionState, ReviewSummary, VerdictPayload, AUTO_TARGET,
};
pub use retry::RetryPolicy;
pub use session::{CommunicationSession, SessionKind, SessionManager, SessionStatus, Turn};
pub use storage::{InMemoryStorage, Memory, MemoryQuery, MemoryValue};
pub use store::{AgentMemory, MemoryStore};
pub use system::{MemorySystem, MemorySystemBuilder};
