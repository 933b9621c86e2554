//! Store wrappers that apply per-call resilience.
//!
//! Each call goes: retry loop → (sheet writes: write queue permit) →
//! circuit breaker → per-attempt timeout → backend. Only transient errors
//! are retried; exhausting the attempts fails the event, never the process.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::record::CanonicalRecord;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitError};
use crate::resilience::rate_limit::WriteQueue;
use crate::resilience::retry::{retry_storage, RetryConfig};
use crate::storage::traits::{ErrorLogEntry, StorageError, StructuredStore, TabularStore};

async fn guarded<T, F, Fut>(circuit: &CircuitBreaker, op: F) -> Result<T, StorageError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let started = std::time::Instant::now();
    let result = circuit.call(op).await.map_err(|e| match e {
        CircuitError::Inner(e) => e,
        CircuitError::Rejected => StorageError::Unavailable(circuit.name().to_string()),
    });
    crate::metrics::record_external_latency(circuit.name(), started.elapsed());
    result
}

/// Sheet API with retry, circuit breaker and the global write quota.
pub struct ResilientSheet {
    inner: Arc<dyn TabularStore>,
    circuit: CircuitBreaker,
    retry: RetryConfig,
    queue: Arc<WriteQueue>,
}

impl ResilientSheet {
    pub fn new(inner: Arc<dyn TabularStore>, circuit: CircuitBreaker, retry: RetryConfig, queue: Arc<WriteQueue>) -> Self {
        Self {
            inner,
            circuit,
            retry,
            queue,
        }
    }

    #[must_use]
    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    async fn read<T, F, Fut>(&self, op_name: &str, op: F) -> Result<T, StorageError>
    where
        F: Fn(Arc<dyn TabularStore>) -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        crate::metrics::record_sheet_op(op_name);
        retry_storage(op_name, &self.retry, || guarded(&self.circuit, || op(Arc::clone(&self.inner)))).await
    }

    async fn write<T, F, Fut>(&self, op_name: &str, op: F) -> Result<T, StorageError>
    where
        F: Fn(Arc<dyn TabularStore>) -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        crate::metrics::record_sheet_op(op_name);
        retry_storage(op_name, &self.retry, || async {
            // Every attempt is a separate API call against the quota
            self.queue.acquire().await;
            guarded(&self.circuit, || op(Arc::clone(&self.inner))).await
        })
        .await
    }
}

#[async_trait]
impl TabularStore for ResilientSheet {
    async fn read_headers(&self, table: &str) -> Result<Vec<String>, StorageError> {
        self.read("sheet_read_headers", |s| async move { s.read_headers(table).await }).await
    }

    async fn read_cell(&self, table: &str, row: usize, col: usize) -> Result<Option<String>, StorageError> {
        self.read("sheet_read_cell", |s| async move { s.read_cell(table, row, col).await }).await
    }

    async fn read_column(&self, table: &str, col: usize) -> Result<Vec<String>, StorageError> {
        self.read("sheet_read_column", |s| async move { s.read_column(table, col).await }).await
    }

    async fn write_row(&self, table: &str, row: usize, cells: &[String]) -> Result<(), StorageError> {
        self.write("sheet_write_row", |s| async move { s.write_row(table, row, cells).await }).await
    }

    async fn append_row(&self, table: &str, cells: &[String]) -> Result<usize, StorageError> {
        self.write("sheet_append_row", |s| async move { s.append_row(table, cells).await }).await
    }

    async fn clear_row(&self, table: &str, row: usize) -> Result<(), StorageError> {
        self.write("sheet_clear_row", |s| async move { s.clear_row(table, row).await }).await
    }
}

/// Structured store with retry and circuit breaker.
pub struct ResilientRecords {
    inner: Arc<dyn StructuredStore>,
    circuit: CircuitBreaker,
    retry: RetryConfig,
}

impl ResilientRecords {
    pub fn new(inner: Arc<dyn StructuredStore>, circuit: CircuitBreaker, retry: RetryConfig) -> Self {
        Self { inner, circuit, retry }
    }

    #[must_use]
    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    async fn call<T, F, Fut>(&self, op_name: &str, op: F) -> Result<T, StorageError>
    where
        F: Fn(Arc<dyn StructuredStore>) -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        retry_storage(op_name, &self.retry, || guarded(&self.circuit, || op(Arc::clone(&self.inner)))).await
    }
}

#[async_trait]
impl StructuredStore for ResilientRecords {
    async fn upsert(&self, table: &str, id: &str, record: &CanonicalRecord) -> Result<(), StorageError> {
        self.call("structured_upsert", |s| async move { s.upsert(table, id, record).await }).await
    }

    async fn select_by_id(&self, table: &str, id: &str) -> Result<Option<CanonicalRecord>, StorageError> {
        self.call("structured_select", |s| async move { s.select_by_id(table, id).await }).await
    }

    /// The dead-letter write itself bypasses the breaker: it must be
    /// attempted even while upserts are being rejected.
    async fn insert_error_log(&self, entry: &ErrorLogEntry) -> Result<(), StorageError> {
        retry_storage("structured_error_log", &self.retry, || {
            let inner = Arc::clone(&self.inner);
            async move { inner.insert_error_log(entry).await }
        })
        .await
    }

    async fn list_ids(&self, table: &str) -> Result<Vec<String>, StorageError> {
        self.call("structured_list_ids", |s| async move { s.list_ids(table).await }).await
    }

    async fn ping(&self) -> Result<(), StorageError> {
        let inner = Arc::clone(&self.inner);
        guarded(&self.circuit, || async move { inner.ping().await }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::circuit_breaker::CircuitConfig;
    use crate::storage::memory::{InMemoryRecordStore, InMemorySheet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Sheet whose first `fail_first` writes fail transiently
    struct Flaky {
        inner: InMemorySheet,
        fail_first: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TabularStore for Flaky {
        async fn read_headers(&self, table: &str) -> Result<Vec<String>, StorageError> {
            self.inner.read_headers(table).await
        }
        async fn read_cell(&self, table: &str, row: usize, col: usize) -> Result<Option<String>, StorageError> {
            self.inner.read_cell(table, row, col).await
        }
        async fn read_column(&self, table: &str, col: usize) -> Result<Vec<String>, StorageError> {
            self.inner.read_column(table, col).await
        }
        async fn write_row(&self, table: &str, row: usize, cells: &[String]) -> Result<(), StorageError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.fail_first {
                return Err(StorageError::Backend("429 quota".into()));
            }
            self.inner.write_row(table, row, cells).await
        }
        async fn append_row(&self, table: &str, cells: &[String]) -> Result<usize, StorageError> {
            self.inner.append_row(table, cells).await
        }
        async fn clear_row(&self, table: &str, row: usize) -> Result<(), StorageError> {
            self.inner.clear_row(table, row).await
        }
    }

    fn circuit() -> CircuitBreaker {
        CircuitBreaker::new(
            "sheet",
            CircuitConfig {
                failure_threshold: 50,
                success_threshold: 1,
                recovery_timeout: Duration::from_millis(10),
            },
        )
    }

    #[tokio::test]
    async fn test_transient_write_failures_are_retried() {
        let inner = InMemorySheet::new();
        inner.create_table("t", &["id"]);
        let flaky = Arc::new(Flaky {
            inner,
            fail_first: 2,
            calls: AtomicUsize::new(0),
        });
        let sheet = ResilientSheet::new(
            flaky.clone(),
            circuit(),
            RetryConfig::test(),
            Arc::new(WriteQueue::per_second(100)),
        );

        sheet.write_row("t", 0, &["a".to_string()]).await.unwrap();
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
        assert_eq!(flaky.inner.row("t", 0), Some(vec!["a".to_string()]));
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_error() {
        let flaky = Arc::new(Flaky {
            inner: InMemorySheet::new(),
            fail_first: usize::MAX,
            calls: AtomicUsize::new(0),
        });
        let sheet = ResilientSheet::new(flaky.clone(), circuit(), RetryConfig::test(), Arc::new(WriteQueue::per_second(100)));
        let err = sheet.write_row("t", 0, &[]).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unknown_sheet_surfaces_error() {
        let sheet = ResilientSheet::new(
            Arc::new(InMemorySheet::new()),
            circuit(),
            RetryConfig::test(),
            Arc::new(WriteQueue::per_second(100)),
        );
        assert!(sheet.read_headers("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_records_pass_through() {
        let inner = Arc::new(InMemoryRecordStore::new());
        let records = ResilientRecords::new(inner.clone(), circuit(), RetryConfig::test());
        let mut record = CanonicalRecord::new();
        record.insert("name", crate::record::CellValue::Text("Lamp".into()));
        records.upsert("products", "a", &record).await.unwrap();
        assert_eq!(records.select_by_id("products", "a").await.unwrap(), Some(record));
        assert_eq!(records.list_ids("products").await.unwrap(), vec!["a"]);
        records.ping().await.unwrap();
    }
}
