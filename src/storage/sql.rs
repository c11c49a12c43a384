// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite backend for the local durable tier.
//!
//! Every record family (mirror, sync queue, migration ledger) lives in one
//! table, distinguished by key prefix:
//!
//! ```sql
//! CREATE TABLE kv_records (
//!   record_key   TEXT PRIMARY KEY,
//!   record_value TEXT NOT NULL,
//!   written_at   INTEGER NOT NULL   -- epoch millis, oldest-first eviction
//! )
//! ```
//!
//! ## Capacity
//!
//! The store is bounded: `LENGTH(record_key) + LENGTH(record_value)` summed
//! over all rows may not exceed `capacity_bytes`. The running total is loaded
//! at open and maintained on every write, so the quota check never scans.

use async_trait::async_trait;
use sqlx::{any::AnyPoolOptions, AnyPool, Row};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Once;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::traits::{StorageAdapter, StorageError, StorageUsage, StoredRecord};
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

fn backend(err: sqlx::Error) -> StorageError {
    StorageError::Backend(err.to_string())
}

pub struct SqliteStorage {
    pool: AnyPool,
    path: String,
    capacity_bytes: u64,
    used_bytes: AtomicU64,
    /// Serializes quota check + write so the running total stays exact
    write_lock: Mutex<()>,
}

impl SqliteStorage {
    /// Default capacity: 50 MB
    pub const DEFAULT_CAPACITY_BYTES: u64 = 50 * 1024 * 1024;

    /// Open (or create) the store at `path` with the default capacity.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::with_capacity(path, Self::DEFAULT_CAPACITY_BYTES).await
    }

    /// Open (or create) the store with a custom capacity (0 = unbounded).
    pub async fn with_capacity(
        path: impl AsRef<Path>,
        capacity_bytes: u64,
    ) -> Result<Self, StorageError> {
        install_drivers();

        let path = path.as_ref().to_string_lossy().to_string();
        let url = format!("sqlite://{}?mode=rwc", path);

        let pool = retry("sqlite_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(4)
                .acquire_timeout(Duration::from_secs(10))
                .connect(&url)
                .await
                .map_err(backend)
        })
        .await?;

        let store = Self {
            pool,
            path,
            capacity_bytes,
            used_bytes: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        };

        store.enable_wal_mode().await?;
        store.init_schema().await?;

        let used = store.measure_used_bytes().await?;
        store.used_bytes.store(used, Ordering::Release);

        info!(path = %store.path, used, capacity_bytes, "Opened local SQLite store");
        Ok(store)
    }

    /// Get the path to the database file.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Concurrent reads during writes, single fsync per commit.
    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        // FULL: an acknowledged write must survive power loss
        sqlx::query("PRAGMA synchronous = FULL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_records (
                record_key TEXT PRIMARY KEY,
                record_value TEXT NOT NULL,
                written_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_kv_written_at ON kv_records (written_at)")
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        Ok(())
    }

    async fn measure_used_bytes(&self) -> Result<u64, StorageError> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(LENGTH(record_key) + LENGTH(record_value)), 0) AS used FROM kv_records",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;

        let used: i64 = row.try_get("used").map_err(backend)?;
        Ok(used.max(0) as u64)
    }

    async fn stored_size(&self, key: &str) -> Result<u64, StorageError> {
        let row = sqlx::query(
            "SELECT LENGTH(record_key) + LENGTH(record_value) AS size FROM kv_records WHERE record_key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        match row {
            Some(row) => {
                let size: i64 = row.try_get("size").map_err(backend)?;
                Ok(size.max(0) as u64)
            }
            None => Ok(0),
        }
    }

    /// Close the pool, waiting for in-flight statements.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn sqlite_len(s: &str) -> u64 {
    // LENGTH() on TEXT counts characters
    s.chars().count() as u64
}

#[async_trait]
impl StorageAdapter for SqliteStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let row = sqlx::query("SELECT record_value FROM kv_records WHERE record_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        row.map(|row| row.try_get::<String, _>("record_value").map_err(backend))
            .transpose()
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;

        let old_size = self.stored_size(key).await?;
        let new_size = sqlite_len(key) + sqlite_len(value);
        let used = self.used_bytes.load(Ordering::Acquire);
        let projected = used.saturating_sub(old_size).saturating_add(new_size);

        if self.capacity_bytes > 0 && projected > self.capacity_bytes {
            return Err(StorageError::QuotaExceeded {
                used,
                capacity: self.capacity_bytes,
            });
        }

        sqlx::query(
            r#"
            INSERT INTO kv_records (record_key, record_value, written_at)
            VALUES (?, ?, ?)
            ON CONFLICT(record_key) DO UPDATE SET
                record_value = excluded.record_value,
                written_at = excluded.written_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(crate::now_millis())
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        self.used_bytes.store(projected, Ordering::Release);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let _guard = self.write_lock.lock().await;

        let size = self.stored_size(key).await?;
        let result = sqlx::query("DELETE FROM kv_records WHERE record_key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        let removed = result.rows_affected() > 0;
        if removed {
            self.used_bytes.fetch_sub(size, Ordering::Release);
        }
        Ok(removed)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<StoredRecord>, StorageError> {
        // substr() avoids LIKE escaping of '_' and '%' in keys
        let rows = sqlx::query(
            r#"
            SELECT record_key, record_value, written_at FROM kv_records
            WHERE substr(record_key, 1, ?) = ?
            ORDER BY written_at ASC, rowid ASC
            "#,
        )
        .bind(sqlite_len(prefix) as i64)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.into_iter()
            .map(|row| {
                Ok(StoredRecord {
                    key: row.try_get("record_key").map_err(backend)?,
                    value: row.try_get("record_value").map_err(backend)?,
                    written_at: row.try_get("written_at").map_err(backend)?,
                })
            })
            .collect()
    }

    async fn usage(&self) -> Result<StorageUsage, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS records FROM kv_records")
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        let records: i64 = row.try_get("records").map_err(backend)?;

        Ok(StorageUsage {
            used_bytes: self.used_bytes.load(Ordering::Acquire),
            capacity_bytes: self.capacity_bytes,
            records: records.max(0) as u64,
        })
    }

    /// Fold the WAL back into the main database file.
    async fn checkpoint(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("WAL checkpoint failed: {}", e)))?;

        debug!(path = %self.path, "SQLite checkpoint completed");
        Ok(())
    }
}
