//! Error types for AtlasRepo
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using RepoError
pub type Result<T> = std::result::Result<T, RepoError>;

/// Unified error type for AtlasRepo operations
#[derive(Debug, Error)]
pub enum RepoError {
    // -------------------------------------------------------------------------
    // Transaction Errors (surfaced to callers)
    // -------------------------------------------------------------------------
    /// Stale version on write, or the distributed commit failed / timed out.
    /// The caller must re-read and retry.
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Entity already known: {0}")]
    DuplicateEntity(String),

    #[error("Transaction timed out: {0}")]
    Timeout(String),

    /// Illegal nesting, or an external transaction colliding with a local one.
    #[error("Protocol error: {0}")]
    Protocol(String),

    // -------------------------------------------------------------------------
    // Replication Errors
    // -------------------------------------------------------------------------
    #[error("Replication failed (during_commit={during_commit}): {reason}")]
    Replication { during_commit: bool, reason: String },

    /// The primary 2PC round committed but the synchronous backup write failed.
    #[error("Backup write failed after primary commit: {0}")]
    BackupWrite(String),

    #[error("Ownership lost: {0}")]
    OwnershipLost(String),

    // -------------------------------------------------------------------------
    // Optimistic Engine Signals (never escape Stm::run)
    // -------------------------------------------------------------------------
    #[error("Transactional conflict")]
    Conflict,

    #[error("Transaction requires a retry after deferred loads")]
    RetryRequired,

    // -------------------------------------------------------------------------
    // Registry Errors
    // -------------------------------------------------------------------------
    #[error("Unknown entity type: {0}")]
    UnknownEntityType(String),

    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Network Errors
    // -------------------------------------------------------------------------
    #[error("Network error: {0}")]
    Network(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl RepoError {
    /// Whether a caller may retry the whole unit of work with fresh data
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RepoError::Concurrency(_) | RepoError::Timeout(_) | RepoError::Replication { .. }
        )
    }
}

impl From<bincode::Error> for RepoError {
    fn from(e: bincode::Error) -> Self {
        RepoError::Serialization(e.to_string())
    }
}
