//! Error taxonomy for the cache, queue and sync layers.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
  /// The persistence substrate could not be opened. Non-fatal: callers fall
  /// back to memory-only operation.
  #[error("Storage unavailable: {0}")]
  StorageUnavailable(String),

  #[error("Storage error: {0}")]
  Storage(#[from] rusqlite::Error),

  /// A value could not be serialized or deserialized. Only the offending call fails.
  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("Network error: {0}")]
  Network(String),

  #[error("Timed out after {0}ms")]
  Timeout(u64),

  /// The remote rejected a mutation as stale or invalid.
  #[error("Conflict: {0}")]
  Conflict(String),

  #[error("A drain pass is already running")]
  DrainInProgress,

  #[error("Mutation {0} not found")]
  NotFound(i64),

  #[error("Invalid configuration: {0}")]
  Config(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;
