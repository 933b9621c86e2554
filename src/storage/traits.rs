use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::record::CanonicalRecord;

#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("Item not found")]
    NotFound,
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Operation '{0}' timed out")]
    Timeout(String),
    #[error("Backend '{0}' unavailable (circuit open)")]
    Unavailable(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Whether a retry could plausibly succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::Timeout(_) | Self::Unavailable(_))
    }
}

/// Shared cache / lock service reachable by every process instance.
///
/// The primitive set is deliberately small: locks, idempotency tokens, dedupe
/// keys, fingerprints, row locations and the foreign-key id set are all built
/// from these calls.
#[async_trait]
pub trait SharedCache: Send + Sync {
    /// Atomic set-if-absent with TTL. Returns `true` if the key was set.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StorageError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Unconditional set; `None` TTL keeps the key until deleted.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Delete only if the key still holds `expected`. Returns `true` if deleted.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StorageError>;

    /// Atomically replace the set stored at `key`.
    async fn replace_set(&self, key: &str, members: &[String], ttl: Duration) -> Result<(), StorageError>;

    async fn is_member(&self, key: &str, member: &str) -> Result<bool, StorageError>;

    async fn ping(&self) -> Result<(), StorageError>;
}

/// Dead-letter row in the structured store's error log.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorLogEntry {
    pub origin: String,
    pub payload: String,
    pub message: String,
    pub stack_trace: String,
    /// Epoch millis
    pub timestamp: i64,
}

/// The structured record store (ground truth for typed records).
#[async_trait]
pub trait StructuredStore: Send + Sync {
    /// Insert or replace by primary id.
    async fn upsert(&self, table: &str, id: &str, record: &CanonicalRecord) -> Result<(), StorageError>;

    async fn select_by_id(&self, table: &str, id: &str) -> Result<Option<CanonicalRecord>, StorageError>;

    /// Insert-only append to the error log.
    async fn insert_error_log(&self, entry: &ErrorLogEntry) -> Result<(), StorageError>;

    /// All primary ids of a table (foreign-key set refresh).
    async fn list_ids(&self, table: &str) -> Result<Vec<String>, StorageError>;

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// The human-edited tabular store.
///
/// Row indexes are 0-based data rows; the header row is not counted.
#[async_trait]
pub trait TabularStore: Send + Sync {
    async fn read_headers(&self, table: &str) -> Result<Vec<String>, StorageError>;

    async fn read_cell(&self, table: &str, row: usize, col: usize) -> Result<Option<String>, StorageError>;

    /// Every data cell of one column, in row order.
    async fn read_column(&self, table: &str, col: usize) -> Result<Vec<String>, StorageError>;

    async fn write_row(&self, table: &str, row: usize, cells: &[String]) -> Result<(), StorageError>;

    /// Append a row and return its index.
    async fn append_row(&self, table: &str, cells: &[String]) -> Result<usize, StorageError>;

    async fn clear_row(&self, table: &str, row: usize) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StorageError::Backend("reset".into()).is_transient());
        assert!(StorageError::Timeout("get".into()).is_transient());
        assert!(StorageError::Unavailable("redis".into()).is_transient());
        assert!(!StorageError::NotFound.is_transient());
        assert!(!StorageError::Serialization("bad".into()).is_transient());
    }
}
