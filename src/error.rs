//! Error types for cache operations.

use thiserror::Error;

use crate::cache::RecordId;

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors surfaced by the cache, the journal and the storage layer.
///
/// Storage failures are passed through unchanged; nothing in this crate retries.
#[derive(Debug, Error)]
pub enum CacheError {
  /// An update or destroy targeted an id with no local row.
  #[error("{resource}: no local record with id {id}")]
  NotFound { resource: String, id: RecordId },

  /// The operation has no offline equivalent and always fails.
  #[error("operation not supported: {0}")]
  Unsupported(&'static str),

  /// The SQLite store rejected the operation.
  #[error("storage error: {0}")]
  Storage(#[from] rusqlite::Error),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// Schema versions could not be applied.
  #[error("schema error: {0}")]
  Schema(String),

  /// A resource, field or database name is not a plain identifier.
  #[error("invalid name '{0}': expected letters, digits or '_'")]
  InvalidName(String),

  #[error("lock poisoned: {0}")]
  Lock(String),

  /// A blocking storage task panicked or was cancelled by the runtime.
  #[error("storage task failed: {0}")]
  Task(#[from] tokio::task::JoinError),

  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
}

impl CacheError {
  pub(crate) fn not_found(resource: &str, id: &RecordId) -> Self {
    Self::NotFound {
      resource: resource.to_string(),
      id: id.clone(),
    }
  }

  /// True when the underlying SQLite error is a constraint violation
  /// (for example adding a row whose compound key already exists).
  pub fn is_constraint_violation(&self) -> bool {
    matches!(
      self,
      Self::Storage(rusqlite::Error::SqliteFailure(e, _))
        if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
  }
}
