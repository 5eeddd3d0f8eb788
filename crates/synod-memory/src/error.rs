//! Error types for the memory and communication core
//!
//! Every fallible operation returns [`SynodResult`]. Only
//! [`SynodError::BackendUnavailable`] is retryable; the other kinds describe
//! conditions a retry cannot fix and are surfaced to the caller as-is.

use serde::{Deserialize, Serialize};

/// Result alias used throughout the crate
pub type SynodResult<T> = Result<T, SynodError>;

/// Coarse classification of a [`SynodError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Uninitialized,
    AlreadyInitialized,
    NotFound,
    Unauthorized,
    BackendUnavailable,
    InvalidInput,
    Storage,
}

/// Main error type
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SynodError {
    /// The memory system has not been initialized, or was torn down
    #[error("memory system is not initialized")]
    Uninitialized,

    /// A strict re-initialization was attempted while a run is live
    #[error("memory system is already initialized for run '{run_id}'")]
    AlreadyInitialized { run_id: String },

    /// A referenced record does not exist or nothing matched
    #[error("{resource} not found: {id}")]
    NotFound { resource: String, id: String },

    /// An agent tried to act on something it does not own
    #[error("agent '{agent_id}' may not {action} {resource} owned by '{owner_id}'")]
    Unauthorized {
        agent_id: String,
        owner_id: String,
        action: String,
        resource: String,
    },

    /// Transport or I/O failure in the backend, retryable by the caller
    #[error("backend unavailable during {operation}: {message}")]
    BackendUnavailable { operation: String, message: String },

    /// Structurally invalid input
    #[error("invalid {field}: {reason}")]
    InvalidInput { field: String, reason: String },

    /// A persisted value could not be encoded or decoded
    #[error("storage error during {operation}: {message}")]
    Storage { operation: String, message: String },
}

impl SynodError {
    /// Create a not-found error
    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    /// Create an unauthorized error
    pub fn unauthorized(
        agent_id: impl Into<String>,
        owner_id: impl Into<String>,
        action: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self::Unauthorized {
            agent_id: agent_id.into(),
            owner_id: owner_id.into(),
            action: action.into(),
            resource: resource.into(),
        }
    }

    /// Create a backend-unavailable error
    pub fn backend_unavailable(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::BackendUnavailable {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Create an invalid-input error
    pub fn invalid_input(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a storage (encode/decode) error
    pub fn storage(operation: impl Into<String>, source: impl std::error::Error) -> Self {
        Self::Storage {
            operation: operation.into(),
            message: source.to_string(),
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Uninitialized => ErrorKind::Uninitialized,
            Self::AlreadyInitialized { .. } => ErrorKind::AlreadyInitialized,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Unauthorized { .. } => ErrorKind::Unauthorized,
            Self::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
            Self::InvalidInput { .. } => ErrorKind::InvalidInput,
            Self::Storage { .. } => ErrorKind::Storage,
        }
    }

    /// Whether a caller may retry the failed operation
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendUnavailable { .. })
    }
}

impl From<serde_json::Error> for SynodError {
    fn from(err: serde_json::Error) -> Self {
        Self::storage("json", err)
    }
}
