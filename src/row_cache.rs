//! Row location cache: (table, id) → sheet row.
//!
//! Sheet rows move whenever a human sorts, inserts or deletes, so a cached
//! position is only a hint. [`RowLocationCache::resolve`] reads the id cell at
//! the cached row before trusting it; a mismatch drops the entry and falls
//! back to a scan of the whole id column.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::storage::tiered::TieredCache;
use crate::storage::traits::{StorageError, TabularStore};

/// Cached position of an entity's row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowLocation {
    pub row: usize,
    /// The id cell matched when this entry was last written
    pub verified: bool,
}

impl RowLocation {
    fn encode(&self) -> String {
        format!("{}:{}", self.row, u8::from(self.verified))
    }

    fn decode(raw: &str) -> Option<Self> {
        let (row, verified) = match raw.split_once(':') {
            Some((row, flag)) => (row, flag == "1"),
            None => (raw, false),
        };
        row.parse().ok().map(|row| Self { row, verified })
    }
}

/// How a row was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowLookup {
    /// Cached position confirmed by reading the id cell
    Verified(usize),
    /// Cache missing or stale; found by scanning the id column
    Relocated(usize),
    /// Not in the sheet: the caller appends
    NotFound,
}

impl RowLookup {
    #[must_use]
    pub fn row(&self) -> Option<usize> {
        match self {
            Self::Verified(row) | Self::Relocated(row) => Some(*row),
            Self::NotFound => None,
        }
    }
}

fn ids_match(cell: &str, id: &str) -> bool {
    cell.trim().eq_ignore_ascii_case(id.trim())
}

pub struct RowLocationCache {
    cache: Arc<TieredCache>,
    ttl: Duration,
}

impl RowLocationCache {
    pub fn new(cache: Arc<TieredCache>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    fn key(table: &str, id: &str) -> String {
        format!("rowloc:{}:{}", table, id)
    }

    pub async fn locate(&self, table: &str, id: &str) -> Option<RowLocation> {
        let raw = self.cache.get(&Self::key(table, id)).await?;
        RowLocation::decode(&raw)
    }

    pub async fn remember(&self, table: &str, id: &str, row: usize) {
        let location = RowLocation { row, verified: true };
        self.cache
            .set(&Self::key(table, id), &location.encode(), Some(self.ttl))
            .await;
    }

    pub async fn invalidate(&self, table: &str, id: &str) {
        self.cache.delete(&Self::key(table, id)).await;
    }

    /// Verify-then-use, else rescan the id column.
    pub async fn resolve(
        &self,
        sheet: &dyn TabularStore,
        table: &str,
        id: &str,
        id_col: usize,
    ) -> Result<RowLookup, StorageError> {
        if let Some(location) = self.locate(table, id).await {
            let cell = sheet.read_cell(table, location.row, id_col).await?;
            if cell.as_deref().is_some_and(|c| ids_match(c, id)) {
                crate::metrics::record_row_lookup("verified");
                return Ok(RowLookup::Verified(location.row));
            }
            debug!(table, id, row = location.row, "Cached row location is stale");
            self.invalidate(table, id).await;
            crate::metrics::record_row_lookup("stale");
        }

        let column = sheet.read_column(table, id_col).await?;
        match column.iter().position(|cell| ids_match(cell, id)) {
            Some(row) => {
                self.remember(table, id, row).await;
                crate::metrics::record_row_lookup("scanned");
                Ok(RowLookup::Relocated(row))
            }
            None => {
                crate::metrics::record_row_lookup("missing");
                Ok(RowLookup::NotFound)
            }
        }
    }
}
