//! In-process backends.
//!
//! - [`InMemoryCache`]: TTL-aware [`SharedCache`], used as the degraded local
//!   tier of [`super::tiered::TieredCache`] and directly in tests
//! - [`InMemoryRecordStore`]: [`StructuredStore`] for tests and sql-less setups
//! - [`InMemorySheet`]: [`TabularStore`] that tests can edit and reshuffle

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use super::traits::{ErrorLogEntry, SharedCache, StorageError, StructuredStore, TabularStore};
use crate::record::CanonicalRecord;
use crate::time_source::{SystemTimeSource, TimeSource};

#[derive(Debug, Clone)]
enum CachedValue {
    Str(String),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: CachedValue,
    expires_at_ms: Option<u64>,
}

impl CacheEntry {
    fn is_live(&self, now_ms: u64) -> bool {
        self.expires_at_ms.map_or(true, |exp| now_ms < exp)
    }
}

fn expiry(now_ms: u64, ttl: Option<Duration>) -> Option<u64> {
    ttl.map(|t| now_ms.saturating_add(t.as_millis() as u64))
}

pub struct InMemoryCache {
    data: DashMap<String, CacheEntry>,
    clock: Arc<dyn TimeSource>,
}

impl InMemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::with_time_source(Arc::new(SystemTimeSource))
    }

    pub fn with_time_source(clock: Arc<dyn TimeSource>) -> Self {
        Self {
            data: DashMap::new(),
            clock,
        }
    }

    /// Number of live (unexpired) keys
    #[must_use]
    pub fn len(&self) -> usize {
        let now = self.clock.now_ms();
        self.data.iter().filter(|e| e.value().is_live(now)).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.data.clear();
    }

    /// Drop expired keys. Lookups already ignore them; this reclaims memory.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.data.len();
        self.data.retain(|_, e| e.is_live(now));
        before - self.data.len()
    }

    fn live(&self, key: &str) -> Option<CacheEntry> {
        let now = self.clock.now_ms();
        let entry = self.data.get(key)?;
        if entry.is_live(now) {
            Some(entry.value().clone())
        } else {
            None
        }
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedCache for InMemoryCache {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StorageError> {
        let now = self.clock.now_ms();
        let fresh = CacheEntry {
            value: CachedValue::Str(value.to_string()),
            expires_at_ms: expiry(now, Some(ttl)),
        };
        match self.data.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    Ok(false)
                } else {
                    occupied.insert(fresh);
                    Ok(true)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match self.live(key) {
            Some(CacheEntry { value: CachedValue::Str(s), .. }) => Ok(Some(s)),
            Some(_) => Err(StorageError::Backend(format!("key '{}' holds a set", key))),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError> {
        let now = self.clock.now_ms();
        self.data.insert(
            key.to_string(),
            CacheEntry {
                value: CachedValue::Str(value.to_string()),
                expires_at_ms: expiry(now, ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.data.remove(key);
        Ok(())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StorageError> {
        let now = self.clock.now_ms();
        let removed = self.data.remove_if(key, |_, e| {
            e.is_live(now) && matches!(&e.value, CachedValue::Str(s) if s == expected)
        });
        Ok(removed.is_some())
    }

    async fn replace_set(&self, key: &str, members: &[String], ttl: Duration) -> Result<(), StorageError> {
        let now = self.clock.now_ms();
        self.data.insert(
            key.to_string(),
            CacheEntry {
                value: CachedValue::Set(members.iter().cloned().collect()),
                expires_at_ms: expiry(now, Some(ttl)),
            },
        );
        Ok(())
    }

    async fn is_member(&self, key: &str, member: &str) -> Result<bool, StorageError> {
        match self.live(key) {
            Some(CacheEntry { value: CachedValue::Set(set), .. }) => Ok(set.contains(member)),
            _ => Ok(false),
        }
    }

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Structured store kept in memory.
#[derive(Default)]
pub struct InMemoryRecordStore {
    records: DashMap<(String, String), CanonicalRecord>,
    error_log: Mutex<Vec<ErrorLogEntry>>,
    upserts: AtomicU64,
}

impl InMemoryRecordStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record without counting it as a sync write.
    pub fn seed(&self, table: &str, id: &str, record: CanonicalRecord) {
        self.records.insert((table.to_string(), id.to_string()), record);
    }

    #[must_use]
    pub fn get(&self, table: &str, id: &str) -> Option<CanonicalRecord> {
        self.records
            .get(&(table.to_string(), id.to_string()))
            .map(|r| r.value().clone())
    }

    #[must_use]
    pub fn upsert_count(&self) -> u64 {
        self.upserts.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn error_log(&self) -> Vec<ErrorLogEntry> {
        self.error_log.lock().clone()
    }
}

#[async_trait]
impl StructuredStore for InMemoryRecordStore {
    async fn upsert(&self, table: &str, id: &str, record: &CanonicalRecord) -> Result<(), StorageError> {
        self.records
            .insert((table.to_string(), id.to_string()), record.clone());
        self.upserts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn select_by_id(&self, table: &str, id: &str) -> Result<Option<CanonicalRecord>, StorageError> {
        Ok(self.get(table, id))
    }

    async fn insert_error_log(&self, entry: &ErrorLogEntry) -> Result<(), StorageError> {
        self.error_log.lock().push(entry.clone());
        Ok(())
    }

    async fn list_ids(&self, table: &str) -> Result<Vec<String>, StorageError> {
        let mut ids: Vec<String> = self
            .records
            .iter()
            .filter(|e| e.key().0 == table)
            .map(|e| e.key().1.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[derive(Debug, Clone, Default)]
struct SheetTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

/// Spreadsheet kept in memory. Tests use the inherent methods to play the
/// human editor (reorder columns, shuffle rows, paste garbage).
#[derive(Default)]
pub struct InMemorySheet {
    tables: RwLock<HashMap<String, SheetTable>>,
    header_reads: AtomicU64,
    writes: AtomicU64,
}

impl InMemorySheet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_table(&self, table: &str, headers: &[&str]) {
        self.tables.write().insert(
            table.to_string(),
            SheetTable {
                headers: headers.iter().map(|h| h.to_string()).collect(),
                rows: Vec::new(),
            },
        );
    }

    pub fn set_headers(&self, table: &str, headers: &[&str]) {
        if let Some(t) = self.tables.write().get_mut(table) {
            t.headers = headers.iter().map(|h| h.to_string()).collect();
        }
    }

    /// Insert a row directly, as a human would. Returns its index.
    pub fn push_row(&self, table: &str, cells: &[&str]) -> usize {
        let mut tables = self.tables.write();
        let t = tables.entry(table.to_string()).or_default();
        t.rows.push(cells.iter().map(|c| c.to_string()).collect());
        t.rows.len() - 1
    }

    pub fn swap_rows(&self, table: &str, a: usize, b: usize) {
        if let Some(t) = self.tables.write().get_mut(table) {
            if a < t.rows.len() && b < t.rows.len() {
                t.rows.swap(a, b);
            }
        }
    }

    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<Vec<String>> {
        self.tables
            .read()
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn row(&self, table: &str, row: usize) -> Option<Vec<String>> {
        self.tables.read().get(table).and_then(|t| t.rows.get(row).cloned())
    }

    /// Mutating operations performed through the [`TabularStore`] trait
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn header_reads(&self) -> u64 {
        self.header_reads.load(Ordering::SeqCst)
    }

    fn missing(table: &str) -> StorageError {
        StorageError::Backend(format!("unknown sheet '{}'", table))
    }
}

#[async_trait]
impl TabularStore for InMemorySheet {
    async fn read_headers(&self, table: &str) -> Result<Vec<String>, StorageError> {
        self.header_reads.fetch_add(1, Ordering::SeqCst);
        self.tables
            .read()
            .get(table)
            .map(|t| t.headers.clone())
            .ok_or_else(|| Self::missing(table))
    }

    async fn read_cell(&self, table: &str, row: usize, col: usize) -> Result<Option<String>, StorageError> {
        let tables = self.tables.read();
        let t = tables.get(table).ok_or_else(|| Self::missing(table))?;
        Ok(t.rows.get(row).and_then(|r| r.get(col)).cloned())
    }

    async fn read_column(&self, table: &str, col: usize) -> Result<Vec<String>, StorageError> {
        let tables = self.tables.read();
        let t = tables.get(table).ok_or_else(|| Self::missing(table))?;
        Ok(t.rows
            .iter()
            .map(|r| r.get(col).cloned().unwrap_or_default())
            .collect())
    }

    async fn write_row(&self, table: &str, row: usize, cells: &[String]) -> Result<(), StorageError> {
        let mut tables = self.tables.write();
        let t = tables.get_mut(table).ok_or_else(|| Self::missing(table))?;
        if row >= t.rows.len() {
            t.rows.resize(row + 1, Vec::new());
        }
        t.rows[row] = cells.to_vec();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn append_row(&self, table: &str, cells: &[String]) -> Result<usize, StorageError> {
        let mut tables = self.tables.write();
        let t = tables.get_mut(table).ok_or_else(|| Self::missing(table))?;
        t.rows.push(cells.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(t.rows.len() - 1)
    }

    async fn clear_row(&self, table: &str, row: usize) -> Result<(), StorageError> {
        let mut tables = self.tables.write();
        let t = tables.get_mut(table).ok_or_else(|| Self::missing(table))?;
        if let Some(r) = t.rows.get_mut(row) {
            r.iter_mut().for_each(String::clear);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
