// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL backend for the structured record store.
//!
//! Records are schema-less, so each one is kept as a JSON document keyed by
//! `(table_name, id)`; the error log is an insert-only table:
//!
//! ```sql
//! CREATE TABLE sync_records (
//!   table_name VARCHAR(128) NOT NULL,
//!   id VARCHAR(255) NOT NULL,
//!   payload LONGTEXT NOT NULL,   -- canonical record as JSON
//!   updated_at BIGINT NOT NULL,  -- epoch millis of last upsert
//!   PRIMARY KEY (table_name, id)
//! )
//!
//! CREATE TABLE sync_errors (
//!   origin VARCHAR(32), payload LONGTEXT, message TEXT,
//!   stack_trace LONGTEXT, created_at BIGINT
//! )
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! The `Any` driver reads MySQL LONGTEXT as bytes, so text columns are read as
//! `String` first and fall back to `Vec<u8>`.

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use std::sync::Once;
use std::time::Duration;

use super::traits::{ErrorLogEntry, StorageError, StructuredStore};
use crate::record::CanonicalRecord;
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

fn backend(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn text_column(row: &AnyRow, column: &str) -> Option<String> {
    row.try_get::<String, _>(column).ok().or_else(|| {
        row.try_get::<Vec<u8>, _>(column)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    })
}

pub struct SqlRecordStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlRecordStore {
    /// Connect with startup-mode retry and create the tables if missing.
    pub async fn connect(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(if is_sqlite { 1 } else { 10 })
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(backend)
        })
        .await?;

        let store = Self { pool, is_sqlite };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements: [&str; 2] = if self.is_sqlite {
            [
                r#"
                CREATE TABLE IF NOT EXISTS sync_records (
                    table_name TEXT NOT NULL,
                    id TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    updated_at INTEGER NOT NULL,
                    PRIMARY KEY (table_name, id)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS sync_errors (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    origin TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    message TEXT NOT NULL,
                    stack_trace TEXT NOT NULL,
                    created_at INTEGER NOT NULL
                )
                "#,
            ]
        } else {
            [
                r#"
                CREATE TABLE IF NOT EXISTS sync_records (
                    table_name VARCHAR(128) NOT NULL,
                    id VARCHAR(255) NOT NULL,
                    payload LONGTEXT NOT NULL,
                    updated_at BIGINT NOT NULL,
                    PRIMARY KEY (table_name, id),
                    INDEX idx_updated_at (updated_at)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS sync_errors (
                    seq BIGINT AUTO_INCREMENT PRIMARY KEY,
                    origin VARCHAR(32) NOT NULL,
                    payload LONGTEXT NOT NULL,
                    message TEXT NOT NULL,
                    stack_trace LONGTEXT NOT NULL,
                    created_at BIGINT NOT NULL
                )
                "#,
            ]
        };

        for sql in statements {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql).execute(&self.pool).await.map_err(backend)
            })
            .await?;
        }
        Ok(())
    }

    /// Rows in the error log (operational inspection)
    pub async fn error_count(&self) -> Result<i64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM sync_errors")
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        row.try_get::<i64, _>("n").map_err(backend)
    }
}

#[async_trait]
impl StructuredStore for SqlRecordStore {
    async fn upsert(&self, table: &str, id: &str, record: &CanonicalRecord) -> Result<(), StorageError> {
        let payload = serde_json::to_string(&record.to_json())
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let now = chrono::Utc::now().timestamp_millis();

        let sql = if self.is_sqlite {
            "INSERT INTO sync_records (table_name, id, payload, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(table_name, id) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at"
        } else {
            "INSERT INTO sync_records (table_name, id, payload, updated_at) VALUES (?, ?, ?, ?)
             ON DUPLICATE KEY UPDATE payload = VALUES(payload), updated_at = VALUES(updated_at)"
        };

        sqlx::query(sql)
            .bind(table)
            .bind(id)
            .bind(&payload)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn select_by_id(&self, table: &str, id: &str) -> Result<Option<CanonicalRecord>, StorageError> {
        let row = sqlx::query("SELECT payload FROM sync_records WHERE table_name = ? AND id = ?")
            .bind(table)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let payload = text_column(&row, "payload")
            .ok_or_else(|| StorageError::Serialization(format!("no payload for {}:{}", table, id)))?;
        let value: serde_json::Value =
            serde_json::from_str(&payload).map_err(|e| StorageError::Serialization(e.to_string()))?;
        CanonicalRecord::from_json(&value)
            .map(Some)
            .map_err(|e| StorageError::Serialization(e.to_string()))
    }

    async fn insert_error_log(&self, entry: &ErrorLogEntry) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO sync_errors (origin, payload, message, stack_trace, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&entry.origin)
        .bind(&entry.payload)
        .bind(&entry.message)
        .bind(&entry.stack_trace)
        .bind(entry.timestamp)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn list_ids(&self, table: &str) -> Result<Vec<String>, StorageError> {
        let rows = sqlx::query("SELECT id FROM sync_records WHERE table_name = ? ORDER BY id")
            .bind(table)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        Ok(rows.iter().filter_map(|r| text_column(r, "id")).collect())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }
}
