//! Vigil error taxonomy.

use thiserror::Error;

/// Result alias used across all Vigil crates.
pub type Result<T> = std::result::Result<T, VigilError>;

/// Errors produced by the Vigil core.
#[derive(Debug, Error)]
pub enum VigilError {
    /// Bad or missing configuration — fatal at bootstrap, before any
    /// message mutation is attempted.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Durable store failure (read, write, or CAS plumbing).
    #[error("Store error: {0}")]
    Store(String),

    /// Delivery channel failure (SMTP relay, payload build, timeout).
    #[error("Channel error: {0}")]
    Channel(String),

    /// Operation not valid in the current cycle/message state.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Optimistic-concurrency conflict that survived retries.
    #[error("Concurrent update conflict: {0}")]
    Conflict(String),

    /// A referenced record does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
