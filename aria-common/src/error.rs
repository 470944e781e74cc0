//! Common error types for the Aria entity cache

use crate::kind::Kind;
use thiserror::Error;

/// Common result type for cache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy shared across the cache subsystem.
///
/// Propagation rules:
/// - Persistence-layer errors never reach cache callers; they degrade to
///   a cache miss inside `PersistentCache`.
/// - Retrieval errors are reported per id, never batch-wide, unless the
///   transport itself failed before any response was parsed.
/// - Confirmation errors surface only through the returned `ConfirmError`.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Entity absent at the remote source; non-fatal
    #[error("Not found: {kind} {id}")]
    NotFound { kind: Kind, id: i64 },

    /// Retryable network failure (timeouts, connection resets, 5xx)
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// Payload rejected before any optimistic write was applied
    #[error("Validation error: {0}")]
    Validation(String),

    /// Canonical state diverged from the optimistic assumption
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Persistent tier unavailable; in-memory cache continues alone
    #[error("Persistent storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientNetwork(_))
    }
}
