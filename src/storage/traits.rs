use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("Storage quota exceeded: {used} of {capacity} bytes in use")]
    QuotaExceeded { used: u64, capacity: u64 },
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Transient failures count against the circuit breaker and trigger fallback.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::Unavailable(_) | Self::Timeout(_))
    }

    #[must_use]
    pub fn is_quota(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// A raw record in the local store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub key: String,
    pub value: String,
    /// Last write time (epoch millis), used for oldest-first eviction
    pub written_at: i64,
}

/// Capacity accounting of a bounded local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageUsage {
    pub used_bytes: u64,
    pub capacity_bytes: u64,
    pub records: u64,
}

impl StorageUsage {
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.capacity_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.capacity_bytes as f64
    }
}

/// Durable, bounded local key/value store.
///
/// Writes that would exceed capacity fail with [`StorageError::QuotaExceeded`]
/// and leave the store unchanged.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    async fn put(&self, key: &str, value: &str) -> Result<(), StorageError>;
    /// Returns whether a record was removed.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// All records whose key starts with `prefix`, oldest write first.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<StoredRecord>, StorageError>;

    async fn usage(&self) -> Result<StorageUsage, StorageError>;

    /// Flush anything buffered to durable storage. Called once on shutdown.
    async fn checkpoint(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Networked store. May be slow, unavailable or quota-limited.
#[async_trait]
pub trait RemoteAdapter: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    async fn put(&self, key: &str, value: &str) -> Result<(), StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}
