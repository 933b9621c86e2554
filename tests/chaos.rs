//! Chaos Testing for Sheet Sync
//!
//! Failure scenarios driven by wrapper stores:
//! 1. **FailingRecords / FailingSheet** - error injection by call count or switch
//! 2. **FlakyCache** - shared cache that can be taken down and brought back
//!
//! What must hold under every scenario: the failing event answers 500 and is
//! dead-lettered, the entity lock is released, and the process keeps serving.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use sheet_sync::record::CanonicalRecord;
use sheet_sync::storage::memory::{InMemoryCache, InMemoryRecordStore, InMemorySheet};
use sheet_sync::storage::tiered::TieredCache;
use sheet_sync::storage::traits::{ErrorLogEntry, SharedCache, StorageError, StructuredStore, TabularStore};
use sheet_sync::time_source::{FakeTimeSource, TimeSource};
use sheet_sync::{
    Backends, BackendCircuits, CircuitBreaker, CircuitConfig, RetryConfig, SheetSyncConfig, SyncCoordinator, SyncService,
    WebhookRequest,
};

const LAMP: &str = "7f3c2a10-1b2c-4d5e-8f90-123456789abc";
const DESK: &str = "0a1b2c3d-4e5f-4a6b-9c8d-7e6f5a4b3c2d";
const T0: u64 = 1_700_000_000_000;

// =============================================================================
// Failing Store Wrappers - Precise Error Injection
// =============================================================================

/// Record store whose upserts fail while `failing` is set, and whose error
/// log can be made to fail too.
struct FailingRecords {
    inner: InMemoryRecordStore,
    failing: AtomicBool,
    error_log_failing: AtomicBool,
    upsert_calls: AtomicU64,
}

impl FailingRecords {
    fn new() -> Self {
        Self {
            inner: InMemoryRecordStore::new(),
            failing: AtomicBool::new(false),
            error_log_failing: AtomicBool::new(false),
            upsert_calls: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl StructuredStore for FailingRecords {
    async fn upsert(&self, table: &str, id: &str, record: &CanonicalRecord) -> Result<(), StorageError> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("connection reset by peer".into()));
        }
        self.inner.upsert(table, id, record).await
    }

    async fn select_by_id(&self, table: &str, id: &str) -> Result<Option<CanonicalRecord>, StorageError> {
        self.inner.select_by_id(table, id).await
    }

    async fn insert_error_log(&self, entry: &ErrorLogEntry) -> Result<(), StorageError> {
        if self.error_log_failing.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("error log unavailable".into()));
        }
        self.inner.insert_error_log(entry).await
    }

    async fn list_ids(&self, table: &str) -> Result<Vec<String>, StorageError> {
        self.inner.list_ids(table).await
    }
}

/// Sheet whose mutating calls fail while `failing` is set.
struct FailingSheet {
    inner: InMemorySheet,
    failing: AtomicBool,
    write_calls: AtomicU64,
}

impl FailingSheet {
    fn new() -> Self {
        let inner = InMemorySheet::new();
        inner.create_table("products", &["id", "name", "price"]);
        Self {
            inner,
            failing: AtomicBool::new(false),
            write_calls: AtomicU64::new(0),
        }
    }

    fn check(&self) -> Result<(), StorageError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            Err(StorageError::Backend("429 quota exceeded".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TabularStore for FailingSheet {
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
        self.check()?;
        self.inner.write_row(table, row, cells).await
    }
    async fn append_row(&self, table: &str, cells: &[String]) -> Result<usize, StorageError> {
        self.check()?;
        self.inner.append_row(table, cells).await
    }
    async fn clear_row(&self, table: &str, row: usize) -> Result<(), StorageError> {
        self.check()?;
        self.inner.clear_row(table, row).await
    }
}

/// Shared cache that can be switched off to simulate a Redis outage.
struct FlakyCache {
    inner: InMemoryCache,
    down: AtomicBool,
}

impl FlakyCache {
    fn gate(&self) -> Result<(), StorageError> {
        if self.down.load(Ordering::SeqCst) {
            Err(StorageError::Backend("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SharedCache for FlakyCache {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StorageError> {
        self.gate()?;
        self.inner.set_nx(key, value, ttl).await
    }
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.gate()?;
        self.inner.get(key).await
    }
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError> {
        self.gate()?;
        self.inner.set(key, value, ttl).await
    }
    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.gate()?;
        self.inner.delete(key).await
    }
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StorageError> {
        self.gate()?;
        self.inner.compare_and_delete(key, expected).await
    }
    async fn replace_set(&self, key: &str, members: &[String], ttl: Duration) -> Result<(), StorageError> {
        self.gate()?;
        self.inner.replace_set(key, members, ttl).await
    }
    async fn is_member(&self, key: &str, member: &str) -> Result<bool, StorageError> {
        self.gate()?;
        self.inner.is_member(key, member).await
    }
    async fn ping(&self) -> Result<(), StorageError> {
        self.gate()
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Chaos {
    service: SyncService,
    records: Arc<FailingRecords>,
    sheet: Arc<FailingSheet>,
    clock: FakeTimeSource,
}

/// Breakers that never trip within a test, so retries reach the store.
fn lenient_circuits() -> BackendCircuits {
    let config = CircuitConfig {
        failure_threshold: 50,
        success_threshold: 1,
        recovery_timeout: Duration::from_millis(10),
    };
    BackendCircuits {
        structured: CircuitBreaker::new("structured_store", config.clone()),
        sheet: CircuitBreaker::new("sheet", config),
    }
}

fn chaos_with(circuits: BackendCircuits, cache: impl FnOnce(Arc<dyn TimeSource>) -> TieredCache) -> Chaos {
    let clock = FakeTimeSource::new(T0);
    let clock_arc: Arc<dyn TimeSource> = Arc::new(clock.clone());
    let records = Arc::new(FailingRecords::new());
    let sheet = Arc::new(FailingSheet::new());
    let backends = Backends {
        cache: Arc::new(cache(clock_arc.clone())),
        records: records.clone(),
        sheet: sheet.clone(),
        clock: clock_arc,
    };
    let coordinator =
        SyncCoordinator::with_resilience(SheetSyncConfig::default(), backends, RetryConfig::test(), circuits);
    Chaos {
        service: SyncService::from_coordinator(Arc::new(coordinator)).expect("service assembles"),
        records,
        sheet,
        clock,
    }
}

fn chaos() -> Chaos {
    chaos_with(lenient_circuits(), TieredCache::local_only)
}

fn insert(id: &str, name: &str) -> WebhookRequest {
    WebhookRequest::new(
        json!({"type": "INSERT", "table": "products", "record": {"id": id, "name": name, "price": 20}}).to_string(),
    )
}

fn edit(id: &str, name: &str) -> WebhookRequest {
    WebhookRequest::new(json!({"table": "products", "row": [id, name, "20"]}).to_string())
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn chaos_structured_store_outage_dead_letters_and_recovers() {
    let c = chaos();
    c.records.failing.store(true, Ordering::SeqCst);

    let response = c.service.gateway().sheet_webhook(edit(LAMP, "Lamp")).await;
    assert_eq!(response.status, 500);
    assert_eq!(c.records.upsert_calls.load(Ordering::SeqCst), 3, "bounded retries");

    let log = c.records.inner.error_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].origin, "sheet");
    assert!(log[0].payload.contains(LAMP));
    assert!(log[0].stack_trace.contains("connection reset by peer"));
    assert_eq!(log[0].timestamp, T0 as i64);

    // Lock was released: the next delivery for the same entity goes through
    c.records.failing.store(false, Ordering::SeqCst);
    c.clock.advance(1_000);
    let response = c.service.gateway().sheet_webhook(edit(LAMP, "Lamp v2")).await;
    assert_eq!((response.status, response.body.as_str()), (200, "OK"));
}

#[tokio::test]
async fn chaos_sheet_outage_dead_letters_structured_change() {
    let c = chaos();
    c.sheet.failing.store(true, Ordering::SeqCst);

    let response = c.service.gateway().structured_webhook(insert(LAMP, "Lamp")).await;
    assert_eq!(response.status, 500);
    assert_eq!(response.body, "Internal error");

    let log = c.records.inner.error_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].origin, "database");
    assert!(log[0].message.contains("Storage failure"));

    c.sheet.failing.store(false, Ordering::SeqCst);
    c.clock.advance(1_000);
    let response = c.service.gateway().structured_webhook(insert(LAMP, "Lamp again")).await;
    assert_eq!(response.status, 200);
    assert_eq!(c.sheet.inner.rows("products").len(), 1);
}

#[tokio::test]
async fn chaos_failed_entity_does_not_block_others() {
    let c = chaos();
    c.sheet.failing.store(true, Ordering::SeqCst);
    let failed = c.service.gateway().structured_webhook(insert(LAMP, "Lamp"));

    // A concurrent event for another entity still reaches the write path
    let records = c.records.clone();
    let other = async {
        let response = c.service.gateway().sheet_webhook(edit(DESK, "Desk")).await;
        (response.status, records.inner.get("products", DESK).is_some())
    };
    let (failed, (status, stored)) = tokio::join!(failed, other);
    assert_eq!(failed.status, 500);
    assert_eq!(status, 200);
    assert!(stored);
}

#[tokio::test]
async fn chaos_dead_letter_sink_failure_never_crashes() {
    let c = chaos();
    c.records.failing.store(true, Ordering::SeqCst);
    c.records.error_log_failing.store(true, Ordering::SeqCst);

    let response = c.service.gateway().sheet_webhook(edit(LAMP, "Lamp")).await;
    assert_eq!(response.status, 500);
    assert!(c.records.inner.error_log().is_empty());

    // Still serving
    let health = c.service.gateway().health().await;
    assert_eq!(health.status, 200);
}

#[tokio::test]
async fn chaos_sustained_sheet_failure_opens_circuit() {
    let circuits = BackendCircuits {
        structured: CircuitBreaker::new("structured_store", CircuitConfig::test()),
        sheet: CircuitBreaker::new(
            "sheet",
            CircuitConfig {
                failure_threshold: 4,
                success_threshold: 1,
                recovery_timeout: Duration::from_secs(60),
            },
        ),
    };
    let c = chaos_with(circuits, TieredCache::local_only);
    c.sheet.failing.store(true, Ordering::SeqCst);

    for i in 0..4 {
        c.clock.advance(1_000);
        let id = format!("00000000-0000-4000-8000-{:012}", i);
        let response = c.service.gateway().structured_webhook(insert(&id, "Item")).await;
        assert_eq!(response.status, 500);
    }
    let calls_before = c.sheet.write_calls.load(Ordering::SeqCst);

    c.clock.advance(1_000);
    let response = c.service.gateway().structured_webhook(insert(LAMP, "Lamp")).await;
    assert_eq!(response.status, 500);
    assert_eq!(
        c.sheet.write_calls.load(Ordering::SeqCst),
        calls_before,
        "open circuit rejects without calling the sheet"
    );
    assert!(c
        .records
        .inner
        .error_log()
        .last()
        .is_some_and(|e| e.message.contains("circuit open")));
}

/// Shared cache that accepts connections and never answers.
struct HangingCache;

#[async_trait]
impl SharedCache for HangingCache {
    async fn set_nx(&self, _: &str, _: &str, _: Duration) -> Result<bool, StorageError> {
        std::future::pending().await
    }
    async fn get(&self, _: &str) -> Result<Option<String>, StorageError> {
        std::future::pending().await
    }
    async fn set(&self, _: &str, _: &str, _: Option<Duration>) -> Result<(), StorageError> {
        std::future::pending().await
    }
    async fn delete(&self, _: &str) -> Result<(), StorageError> {
        std::future::pending().await
    }
    async fn compare_and_delete(&self, _: &str, _: &str) -> Result<bool, StorageError> {
        std::future::pending().await
    }
    async fn replace_set(&self, _: &str, _: &[String], _: Duration) -> Result<(), StorageError> {
        std::future::pending().await
    }
    async fn is_member(&self, _: &str, _: &str) -> Result<bool, StorageError> {
        std::future::pending().await
    }
    async fn ping(&self) -> Result<(), StorageError> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn chaos_hanging_cache_times_out_and_keeps_serving() {
    let c = chaos_with(lenient_circuits(), |clock| {
        TieredCache::with_parts(
            Some(Arc::new(HangingCache) as Arc<dyn SharedCache>),
            clock,
            CircuitConfig {
                failure_threshold: 1,
                success_threshold: 1,
                recovery_timeout: Duration::from_secs(60),
            },
        )
        .with_call_timeout(Duration::from_millis(20))
    });

    let response = tokio::time::timeout(
        Duration::from_secs(5),
        c.service.gateway().structured_webhook(insert(LAMP, "Lamp")),
    )
    .await
    .expect("a hung cache must not hang the webhook");
    assert_eq!(response.status, 200);
    assert_eq!(c.sheet.inner.rows("products").len(), 1);
    assert!(c.service.coordinator().cache().is_degraded());

    let health = c.service.gateway().health().await;
    assert_eq!(health.status, 503);
}

#[tokio::test]
async fn chaos_cache_outage_degrades_to_local_tier() {
    let primary = Arc::new(FlakyCache {
        inner: InMemoryCache::new(),
        down: AtomicBool::new(false),
    });
    let shared: Arc<dyn SharedCache> = primary.clone();
    let c = chaos_with(lenient_circuits(), move |clock| {
        TieredCache::with_parts(
            Some(shared),
            clock,
            CircuitConfig {
                failure_threshold: 1,
                success_threshold: 1,
                recovery_timeout: Duration::from_millis(1),
            },
        )
    });

    let health = c.service.gateway().health().await;
    assert_eq!((health.status, health.body.contains("connected")), (200, true));

    primary.down.store(true, Ordering::SeqCst);
    let response = c.service.gateway().structured_webhook(insert(LAMP, "Lamp")).await;
    assert_eq!(response.status, 200, "events still processed on the local tier");
    assert!(c.service.coordinator().cache().is_degraded());

    let health = c.service.gateway().health().await;
    assert_eq!(health.status, 503);
    assert!(health.body.contains("disconnected"));

    primary.down.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(5)).await;
    let health = c.service.gateway().health().await;
    assert_eq!(health.status, 200);
    assert!(!c.service.coordinator().cache().is_degraded());
}
