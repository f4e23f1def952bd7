//! Error types for the state caches.

use thiserror::Error;

/// Errors that can occur while persisting or restoring state.
#[derive(Debug, Error)]
pub enum StateError {
    /// Reading or writing a state file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A state file holds invalid JSON.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A game id cannot be used as a storage key.
    #[error("invalid game id: {0:?}")]
    InvalidGameId(String),

    /// The debugger rejected or dropped a request.
    #[error(transparent)]
    Client(#[from] ppdbg_client::ClientError),
}

/// Result type for state operations.
pub type Result<T> = std::result::Result<T, StateError>;
