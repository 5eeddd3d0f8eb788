//! # Synod - Memory and Communication for Agent Simulations
//!
//! **Synod** brings together the pieces a room full of LLM-driven agents
//! needs to remember and talk:
//!
//! - **Synod Memory**: per-agent semantic memory, reflection-driven memory
//!   mutation, notifications and meeting transcripts
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use synod::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let system = MemorySystem::new(SynodConfig::default())?;
//!     system.initialize("run-1").await?;
//!
//!     system
//!         .memory_store()
//!         .add("technical_analyst", "RSI divergence preceded the drop", MemoryMetadata::new("reflection"))
//!         .await?;
//!
//!     system
//!         .notifications()
//!         .publish("technical_analyst", Recipients::Broadcast, "bearish divergence", None)
//!         .await?;
//!
//!     system.teardown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │                Synod                 │
//! │           (Umbrella Crate)           │
//! └──────────────────┬───────────────────┘
//!                    │
//!          ┌─────────▼─────────┐
//!          │   Synod Memory    │
//!          │ store · reflect · │
//!          │  bus · sessions   │
//!          └───────────────────┘
//! ```

#![doc(html_root_url = "https://docs.rs/synod/0.1.0")]
#![warn(missing_docs)]

/// Memory, reflection and communication core
#[cfg(feature = "memory")]
pub use synod_memory as memory;

/// Commonly used types and traits
pub mod prelude {
    #[cfg(feature = "memory")]
    pub use crate::memory::{
        error::{SynodError, SynodResult},
        BackendKind, CommunicationSession, MemoryMetadata, MemoryMutation, MemoryRecord, MemoryStore,
        MemorySystem, MetadataFilter, NotificationBus, NotificationRecord, Recipients, ReflectionResolver,
        ReflectionVerdict, Resolution, ResolutionState, ReviewSummary, SessionKind, SessionManager,
        SynodConfig,
    };
}
