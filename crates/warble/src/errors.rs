use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures raised while a capability executes. These never end a turn, the
/// registry turns them into failed tool results the model can read.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum AgentError {
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Tool execution failed: {0}")]
    ExecutionError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type AgentResult<T> = Result<T, AgentError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("Duplicate capability: {0}")]
    DuplicateCapability(String),

    #[error("Capability not found: {0}")]
    NotFound(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Conversation not found: {0}")]
    NotFound(String),

    #[error("Storage failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt conversation record: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CancelError {
    #[error("A turn is already running for conversation {0}")]
    AlreadyRunning(String),
}

/// Reasons a turn is refused before the loop starts.
#[derive(Error, Debug)]
pub enum TurnError {
    #[error(transparent)]
    Busy(#[from] CancelError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Message has no content")]
    EmptyMessage,
}
