// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync coordinator.
//!
//! The [`SyncCoordinator`] drives every accepted event through the per-entity
//! state machine (see [`SyncState`]):
//!
//! ```text
//! lock ─► normalize ─► loop check ─► conflict check ─► write ─► fingerprint ─► unlock
//!  │                       │               │             │
//!  └ burst protected       └ loop skipped  └ stale       └ failed → dead letter
//! ```
//!
//! Two directions share the machinery:
//! - **structured → sheet** ([`SyncCoordinator::handle_structured`]): render the
//!   record against the current headers and write it through the row location
//!   cache (verify, else rescan, else append).
//! - **sheet → structured** ([`SyncCoordinator::handle_sheet`]): type-repair the
//!   row, upsert by id tagged with the sheet origin, and rewrite the sheet row
//!   when its columns had drifted.
//!
//! # Shared state (all in the tiered cache)
//!
//! | Key | Value |
//! |---|---|
//! | `lock:{table}:{id}` | random owner token, short TTL |
//! | `fp:{table}:{id}` | last synced fingerprint |
//! | `syncts:{origin}:{table}:{id}` | last synced change time from `origin` |
//! | `misaligned:{table}:{id}` | pending forced rewrite |
//! | `rowloc:{table}:{id}` | row location (see [`crate::row_cache`]) |
//! | `fkset:{table}` | valid foreign-key ids |
//!
//! The lock is the only per-entity ordering. Events for different entities run
//! fully in parallel; sheet writes share one global [`WriteQueue`].

mod handlers;
mod resilient;
mod sheet_flow;
mod structured_flow;
mod types;

pub use handlers::{SheetEditHandler, StructuredChangeHandler};
pub use resilient::{ResilientRecords, ResilientSheet};
pub use types::{resolve_conflict, ConflictDecision, SyncOutcome, SyncState};

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, error, warn};

use crate::config::SheetSyncConfig;
use crate::error::{RegistryError, SyncError};
use crate::fingerprint::FingerprintService;
use crate::normalize::RecordNormalizer;
use crate::record::{normalize_key, CanonicalRecord, CellValue, EntityKey, EventEnvelope, Origin};
use crate::registry::{EventClass, HandlerRegistry};
use crate::resilience::circuit_breaker::BackendCircuits;
use crate::resilience::rate_limit::WriteQueue;
use crate::resilience::retry::RetryConfig;
use crate::row_cache::RowLocationCache;
use crate::storage::tiered::TieredCache;
use crate::storage::traits::{ErrorLogEntry, StructuredStore, TabularStore};
use crate::time_source::TimeSource;

/// Raw collaborators the coordinator is built from.
pub struct Backends {
    pub cache: Arc<TieredCache>,
    pub records: Arc<dyn StructuredStore>,
    pub sheet: Arc<dyn TabularStore>,
    pub clock: Arc<dyn TimeSource>,
}

#[derive(Debug, Clone)]
struct CachedHeaders {
    headers: Vec<String>,
    fetched_at_ms: u64,
}

/// Exclusive claim on one entity.
pub(crate) struct EntityLock {
    key: String,
    token: String,
}

pub struct SyncCoordinator {
    pub(super) config: SheetSyncConfig,
    pub(super) cache: Arc<TieredCache>,
    pub(super) records: Arc<ResilientRecords>,
    pub(super) sheet: Arc<ResilientSheet>,
    pub(super) normalizer: RecordNormalizer,
    pub(super) fingerprints: FingerprintService,
    pub(super) rows: RowLocationCache,
    pub(super) clock: Arc<dyn TimeSource>,
    headers: DashMap<String, CachedHeaders>,
}

impl SyncCoordinator {
    /// Production resilience: external retry preset and default breakers.
    pub fn new(config: SheetSyncConfig, backends: Backends) -> Self {
        let retry = RetryConfig::external(
            Duration::from_millis(config.external_timeout_ms),
            config.external_max_retries,
        );
        Self::with_resilience(config, backends, retry, BackendCircuits::new())
    }

    pub fn with_resilience(
        config: SheetSyncConfig,
        backends: Backends,
        retry: RetryConfig,
        circuits: BackendCircuits,
    ) -> Self {
        let queue = Arc::new(WriteQueue::per_second(config.sheet_ops_per_sec));
        let records = Arc::new(ResilientRecords::new(backends.records, circuits.structured, retry.clone()));
        let sheet = Arc::new(ResilientSheet::new(backends.sheet, circuits.sheet, retry, queue));
        let fingerprints = FingerprintService::with_metadata([&config.origin_field, &config.last_synced_field]);
        let rows = RowLocationCache::new(
            Arc::clone(&backends.cache),
            Duration::from_secs(config.row_location_ttl_secs),
        );

        Self {
            normalizer: RecordNormalizer::from_config(&config),
            config,
            cache: backends.cache,
            records,
            sheet,
            fingerprints,
            rows,
            clock: backends.clock,
            headers: DashMap::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SheetSyncConfig {
        &self.config
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn TimeSource> {
        &self.clock
    }

    #[must_use]
    pub fn records(&self) -> &Arc<ResilientRecords> {
        &self.records
    }

    #[must_use]
    pub fn normalizer(&self) -> &RecordNormalizer {
        &self.normalizer
    }

    /// Bind both webhook classes to this coordinator.
    pub fn register_handlers(self: &Arc<Self>, registry: &HandlerRegistry) -> Result<(), RegistryError> {
        registry.register(
            EventClass::StructuredChange,
            Arc::new(StructuredChangeHandler::new(Arc::clone(self))),
        )?;
        registry.register(EventClass::SheetEdit, Arc::new(SheetEditHandler::new(Arc::clone(self))))?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Event entry points
    // ═══════════════════════════════════════════════════════════════════════

    /// Structured store change → sheet.
    #[tracing::instrument(skip(self, envelope), fields(origin = "database", event = %envelope.event_type))]
    pub async fn handle_structured(&self, envelope: &EventEnvelope) -> Result<SyncOutcome, SyncError> {
        let result = self.structured_event(envelope).await;
        self.finish("to_sheet", envelope, result).await
    }

    /// Sheet edit → structured store.
    #[tracing::instrument(skip(self, envelope), fields(origin = "sheet"))]
    pub async fn handle_sheet(&self, envelope: &EventEnvelope) -> Result<SyncOutcome, SyncError> {
        let result = self.sheet_event(envelope).await;
        self.finish("to_structured", envelope, result).await
    }

    async fn finish(
        &self,
        direction: &str,
        envelope: &EventEnvelope,
        result: Result<SyncOutcome, SyncError>,
    ) -> Result<SyncOutcome, SyncError> {
        match &result {
            Ok(outcome) => crate::metrics::record_sync_outcome(direction, outcome.as_str()),
            Err(e) => {
                crate::metrics::record_sync_outcome(direction, "failed");
                if e.is_dead_letter() {
                    self.dead_letter(envelope, e).await;
                } else {
                    debug!(error = %e, "Event rejected");
                }
            }
        }
        result
    }

    /// Append the failed event to the error log. Never fails the caller.
    async fn dead_letter(&self, envelope: &EventEnvelope, err: &SyncError) {
        error!(origin = %envelope.origin, error = %err, "Sync failed, routing to dead letter");
        crate::metrics::record_dead_letter(envelope.origin.as_str());
        let entry = ErrorLogEntry {
            origin: envelope.origin.as_str().to_string(),
            payload: String::from_utf8_lossy(&envelope.payload).into_owned(),
            message: err.to_string(),
            stack_trace: err.chain(),
            timestamp: self.now_ms(),
        };
        if let Err(log_err) = self.records.insert_error_log(&entry).await {
            error!(error = %log_err, payload = %entry.payload, "Dead letter could not be persisted");
        }
    }

    pub(super) fn transition(&self, entity: &EntityKey, state: SyncState) {
        debug!(entity = %entity, state = %state, "Sync state");
    }

    pub(super) fn now_ms(&self) -> i64 {
        self.clock.now_ms() as i64
    }

    pub(super) fn tolerance_ms(&self) -> i64 {
        self.config.conflict_tolerance_ms as i64
    }

    fn state_ttl(&self) -> Duration {
        Duration::from_secs(self.config.row_location_ttl_secs)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Entity lock
    // ═══════════════════════════════════════════════════════════════════════

    pub(super) async fn try_lock(&self, entity: &EntityKey) -> Option<EntityLock> {
        let key = format!("lock:{}", entity);
        let token = uuid::Uuid::new_v4().to_string();
        let ttl = Duration::from_secs(self.config.lock_ttl_secs);
        if self.cache.set_nx(&key, &token, ttl).await {
            Some(EntityLock { key, token })
        } else {
            None
        }
    }

    /// Release only if we still own the lock, optionally after a drain delay
    /// that swallows trailing deliveries from the same burst.
    pub(super) async fn release(&self, lock: EntityLock) {
        let drain = Duration::from_millis(self.config.lock_drain_ms);
        if drain.is_zero() {
            if !self.cache.compare_and_delete(&lock.key, &lock.token).await {
                debug!(key = %lock.key, "Lock expired before release");
            }
            return;
        }
        let cache = Arc::clone(&self.cache);
        tokio::spawn(async move {
            tokio::time::sleep(drain).await;
            cache.compare_and_delete(&lock.key, &lock.token).await;
        });
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Headers (short-TTL cache)
    // ═══════════════════════════════════════════════════════════════════════

    async fn headers(&self, table: &str, force: bool) -> Result<Vec<String>, SyncError> {
        let now = self.clock.now_ms();
        let ttl = self.config.header_ttl_secs * 1000;
        if !force {
            if let Some(cached) = self.headers.get(table) {
                if now.saturating_sub(cached.fetched_at_ms) < ttl {
                    return Ok(cached.headers.clone());
                }
            }
        }
        let headers = self.sheet.read_headers(table).await?;
        debug!(table, columns = headers.len(), "Headers refreshed");
        self.headers.insert(
            table.to_string(),
            CachedHeaders {
                headers: headers.clone(),
                fetched_at_ms: now,
            },
        );
        Ok(headers)
    }

    /// Current headers plus the id column index. A missing id column forces
    /// one re-read before the event is rejected.
    pub(super) async fn headers_with_id(&self, table: &str) -> Result<(Vec<String>, usize), SyncError> {
        let headers = self.headers(table, false).await?;
        if let Some(col) = self.normalizer.id_column_index(&headers) {
            return Ok((headers, col));
        }
        let headers = self.headers(table, true).await?;
        match self.normalizer.id_column_index(&headers) {
            Some(col) => Ok((headers, col)),
            None => Err(SyncError::validation(format!(
                "sheet '{}' has no '{}' column",
                table,
                self.normalizer.id_column()
            ))),
        }
    }

    /// Drop cached headers (all tables).
    pub fn invalidate_headers(&self) {
        self.headers.clear();
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Fingerprints, sync timestamps, misalignment flag
    // ═══════════════════════════════════════════════════════════════════════

    /// Fingerprint over the fields the sheet actually shows.
    pub(super) fn fingerprint_for(&self, record: &CanonicalRecord, headers: &[String]) -> String {
        let keys: Vec<String> = headers
            .iter()
            .map(|h| normalize_key(h))
            .filter(|k| !k.is_empty())
            .collect();
        let allow: Vec<&str> = keys.iter().map(String::as_str).collect();
        self.fingerprints.fingerprint(record, Some(allow.as_slice()))
    }

    pub(super) async fn stored_fingerprint(&self, entity: &EntityKey) -> Option<String> {
        self.cache.get(&format!("fp:{}", entity)).await
    }

    pub(super) async fn store_fingerprint(&self, entity: &EntityKey, fingerprint: &str) {
        self.cache
            .set(&format!("fp:{}", entity), fingerprint, Some(self.state_ttl()))
            .await;
    }

    pub(super) async fn forget_fingerprint(&self, entity: &EntityKey) {
        self.cache.delete(&format!("fp:{}", entity)).await;
    }

    pub(super) async fn sync_time(&self, origin: Origin, entity: &EntityKey) -> Option<i64> {
        let raw = self.cache.get(&format!("syncts:{}:{}", origin, entity)).await?;
        raw.parse().ok()
    }

    pub(super) async fn record_sync_time(&self, origin: Origin, entity: &EntityKey, at_ms: i64) {
        self.cache
            .set(
                &format!("syncts:{}:{}", origin, entity),
                &at_ms.to_string(),
                Some(self.state_ttl()),
            )
            .await;
    }

    pub(super) async fn flag_misaligned(&self, entity: &EntityKey) {
        let ttl = Duration::from_secs(self.config.misalignment_ttl_secs);
        self.cache.set(&format!("misaligned:{}", entity), "1", Some(ttl)).await;
    }

    /// Read and clear the pending-rewrite flag.
    pub(super) async fn take_misaligned(&self, entity: &EntityKey) -> bool {
        let key = format!("misaligned:{}", entity);
        let flagged = self.cache.get(&key).await.is_some();
        if flagged {
            self.cache.delete(&key).await;
        }
        flagged
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Foreign-key id set
    // ═══════════════════════════════════════════════════════════════════════

    /// Reload the related table's ids into the shared set. Returns the count.
    pub async fn refresh_foreign_keys(&self) -> Result<usize, SyncError> {
        let Some(relation) = &self.config.relation else {
            return Ok(0);
        };
        let ids = self.records.list_ids(&relation.table).await?;
        let ids: Vec<String> = ids.into_iter().map(|id| id.trim().to_ascii_lowercase()).collect();
        let refresh = Duration::from_secs(self.config.fk_refresh_secs.max(1));
        self.cache
            .replace_set(&format!("fkset:{}", relation.table), &ids, refresh * 2)
            .await;
        self.cache
            .set(&format!("fkset:{}:fresh", relation.table), &ids.len().to_string(), Some(refresh))
            .await;
        debug!(table = %relation.table, ids = ids.len(), "Foreign-key id set refreshed");
        Ok(ids.len())
    }

    /// Number of known ids, refreshing when stale. `None` when unknown.
    async fn foreign_key_count(&self, table: &str) -> Option<usize> {
        if let Some(count) = self.cache.get(&format!("fkset:{}:fresh", table)).await {
            return count.parse().ok();
        }
        match self.refresh_foreign_keys().await {
            Ok(count) => Some(count),
            Err(e) => {
                warn!(table, error = %e, "Foreign-key refresh failed, skipping validation");
                None
            }
        }
    }

    /// Null out a relation value that references no known id. With an empty
    /// or unavailable id set nothing is discarded.
    pub(super) async fn validate_relation(&self, entity: &EntityKey, record: &mut CanonicalRecord) {
        let Some(relation) = &self.config.relation else {
            return;
        };
        let Some(value) = record.text(&relation.field) else {
            return;
        };
        if !matches!(self.foreign_key_count(&relation.table).await, Some(n) if n > 0) {
            return;
        }
        let member = value.to_ascii_lowercase();
        if !self.cache.is_member(&format!("fkset:{}", relation.table), &member).await {
            warn!(
                entity = %entity,
                field = %relation.field,
                value = %value,
                "Foreign key references unknown id, discarded"
            );
            crate::metrics::record_fk_rejected(&relation.table);
            record.insert(&relation.field, CellValue::Null);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelationConfig;
    use crate::storage::memory::{InMemoryRecordStore, InMemorySheet};
    use crate::time_source::FakeTimeSource;

    fn coordinator(config: SheetSyncConfig) -> (SyncCoordinator, Arc<InMemoryRecordStore>, Arc<InMemorySheet>, FakeTimeSource) {
        let clock = FakeTimeSource::default();
        let clock_arc: Arc<dyn TimeSource> = Arc::new(clock.clone());
        let records = Arc::new(InMemoryRecordStore::new());
        let sheet = Arc::new(InMemorySheet::new());
        sheet.create_table("products", &["id", "name", "price", "category_id"]);
        let backends = Backends {
            cache: Arc::new(TieredCache::local_only(clock_arc.clone())),
            records: records.clone(),
            sheet: sheet.clone(),
            clock: clock_arc,
        };
        let coordinator =
            SyncCoordinator::with_resilience(config, backends, RetryConfig::test(), BackendCircuits::for_tests());
        (coordinator, records, sheet, clock)
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_and_owner_released() {
        let (c, _, _, _) = coordinator(SheetSyncConfig::default());
        let entity = EntityKey::new("products", "a");
        let lock = c.try_lock(&entity).await.unwrap();
        assert!(c.try_lock(&entity).await.is_none());
        c.release(lock).await;
        assert!(c.try_lock(&entity).await.is_some());
    }

    #[tokio::test]
    async fn test_lock_expires_after_ttl() {
        let (c, _, _, clock) = coordinator(SheetSyncConfig::default());
        let entity = EntityKey::new("products", "a");
        let _held = c.try_lock(&entity).await.unwrap();
        clock.advance(8_001);
        assert!(c.try_lock(&entity).await.is_some());
    }

    #[tokio::test]
    async fn test_headers_cached_until_ttl() {
        let (c, _, sheet, clock) = coordinator(SheetSyncConfig::default());
        c.headers_with_id("products").await.unwrap();
        c.headers_with_id("products").await.unwrap();
        assert_eq!(sheet.header_reads(), 1);
        clock.advance(60_000);
        c.headers_with_id("products").await.unwrap();
        assert_eq!(sheet.header_reads(), 2);
    }

    #[tokio::test]
    async fn test_missing_id_column_rereads_then_rejects() {
        let (c, _, sheet, _) = coordinator(SheetSyncConfig::default());
        sheet.create_table("orphans", &["name"]);
        let err = c.headers_with_id("orphans").await.unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
        assert_eq!(sheet.header_reads(), 2);

        sheet.set_headers("orphans", &["name", "ID"]);
        c.invalidate_headers();
        let (_, col) = c.headers_with_id("orphans").await.unwrap();
        assert_eq!(col, 1);
    }

    #[tokio::test]
    async fn test_misalignment_flag_is_taken_once() {
        let (c, _, _, _) = coordinator(SheetSyncConfig::default());
        let entity = EntityKey::new("products", "a");
        c.flag_misaligned(&entity).await;
        assert!(c.take_misaligned(&entity).await);
        assert!(!c.take_misaligned(&entity).await);
    }

    #[tokio::test]
    async fn test_relation_validation_discards_unknown_ids() {
        let config = SheetSyncConfig {
            relation: Some(RelationConfig {
                field: "category_id".into(),
                table: "categories".into(),
            }),
            ..Default::default()
        };
        let (c, records, _, _) = coordinator(config);
        let known = "11111111-2222-4333-8444-555555555555";
        records.seed("categories", known, CanonicalRecord::new());
        let entity = EntityKey::new("products", "a");

        let mut ok = CanonicalRecord::new();
        ok.insert("category_id", CellValue::Uuid(known.into()));
        c.validate_relation(&entity, &mut ok).await;
        assert!(!ok.is_null("category_id"));

        let mut bad = CanonicalRecord::new();
        bad.insert("category_id", CellValue::Uuid("99999999-2222-4333-8444-555555555555".into()));
        c.validate_relation(&entity, &mut bad).await;
        assert!(bad.is_null("category_id"));
    }

    #[tokio::test]
    async fn test_empty_relation_table_discards_nothing() {
        let config = SheetSyncConfig {
            relation: Some(RelationConfig {
                field: "category_id".into(),
                table: "categories".into(),
            }),
            ..Default::default()
        };
        let (c, _, _, _) = coordinator(config);
        let mut record = CanonicalRecord::new();
        record.insert("category_id", CellValue::Uuid("99999999-2222-4333-8444-555555555555".into()));
        c.validate_relation(&EntityKey::new("products", "a"), &mut record).await;
        assert!(!record.is_null("category_id"));
        assert_eq!(c.refresh_foreign_keys().await.unwrap(), 0);
    }
}
