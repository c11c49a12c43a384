use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use super::traits::{RemoteAdapter, StorageAdapter, StorageError, StorageUsage, StoredRecord};

#[derive(Debug, Clone)]
struct Slot {
    value: String,
    written_at: i64,
    seq: u64,
}

fn record_size(key: &str, value: &str) -> u64 {
    (key.len() + value.len()) as u64
}

/// Bounded in-memory local store.
///
/// Capacity is counted as key bytes plus value bytes, the same accounting
/// [`super::sql::SqliteStorage`] uses.
pub struct InMemoryStorage {
    data: DashMap<String, Slot>,
    capacity_bytes: u64,
    used_bytes: AtomicU64,
    seq: AtomicU64,
    /// Serializes the quota check with the write it guards
    write_lock: Mutex<()>,
}

impl InMemoryStorage {
    /// Unbounded store.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Store bounded to `capacity_bytes` (0 = unbounded).
    #[must_use]
    pub fn with_capacity(capacity_bytes: u64) -> Self {
        Self {
            data: DashMap::new(),
            capacity_bytes,
            used_bytes: AtomicU64::new(0),
            seq: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::Acquire)
    }

    /// All keys currently stored (unordered).
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.data.iter().map(|r| r.key().clone()).collect()
    }

    pub fn clear(&self) {
        let _guard = self.write_lock.lock();
        self.data.clear();
        self.used_bytes.store(0, Ordering::Release);
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageAdapter for InMemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.data.get(key).map(|r| r.value().value.clone()))
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock();

        let new_size = record_size(key, value);
        let old_size = self
            .data
            .get(key)
            .map_or(0, |r| record_size(key, &r.value().value));
        let used = self.used_bytes.load(Ordering::Acquire);
        let projected = used.saturating_sub(old_size).saturating_add(new_size);

        if self.capacity_bytes > 0 && projected > self.capacity_bytes {
            return Err(StorageError::QuotaExceeded {
                used,
                capacity: self.capacity_bytes,
            });
        }

        self.data.insert(
            key.to_string(),
            Slot {
                value: value.to_string(),
                written_at: crate::now_millis(),
                seq: self.seq.fetch_add(1, Ordering::Relaxed),
            },
        );
        self.used_bytes.store(projected, Ordering::Release);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let _guard = self.write_lock.lock();
        match self.data.remove(key) {
            Some((k, slot)) => {
                self.used_bytes
                    .fetch_sub(record_size(&k, &slot.value), Ordering::Release);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<StoredRecord>, StorageError> {
        let mut slots: Vec<(String, Slot)> = self
            .data
            .iter()
            .filter(|r| r.key().starts_with(prefix))
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();
        slots.sort_by_key(|(_, slot)| (slot.written_at, slot.seq));

        Ok(slots
            .into_iter()
            .map(|(key, slot)| StoredRecord {
                key,
                value: slot.value,
                written_at: slot.written_at,
            })
            .collect())
    }

    async fn usage(&self) -> Result<StorageUsage, StorageError> {
        Ok(StorageUsage {
            used_bytes: self.used_bytes.load(Ordering::Acquire),
            capacity_bytes: self.capacity_bytes,
            records: self.data.len() as u64,
        })
    }
}

/// In-process remote store with an availability switch.
///
/// Useful for embedding without a network backend and for exercising the
/// fallback chain: while offline every call fails with
/// [`StorageError::Unavailable`].
pub struct InMemoryRemote {
    data: DashMap<String, String>,
    offline: AtomicBool,
    gets: AtomicU64,
    puts: AtomicU64,
    deletes: AtomicU64,
}

impl InMemoryRemote {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
            offline: AtomicBool::new(false),
            gets: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Release);
    }

    #[must_use]
    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::Acquire)
    }

    /// Value currently held, bypassing the availability switch.
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<String> {
        self.data.get(key).map(|r| r.value().clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of `get` calls that reached the store (online or not).
    #[must_use]
    pub fn gets(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn puts(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    fn check_online(&self) -> Result<(), StorageError> {
        if self.is_offline() {
            Err(StorageError::Unavailable("remote offline".into()))
        } else {
            Ok(())
        }
    }
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteAdapter for InMemoryRemote {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        self.check_online()?;
        Ok(self.data.get(key).map(|r| r.value().clone()))
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.puts.fetch_add(1, Ordering::Relaxed);
        self.check_online()?;
        self.data.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        self.check_online()?;
        self.data.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_new_store_is_empty() {
        let store = InMemoryStorage::new();
        assert!(store.is_empty());
        assert_eq!(store.used_bytes(), 0);
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = InMemoryStorage::new();

        store.put("data:a.b", "1").await.unwrap();
        assert_eq!(store.get("data:a.b").await.unwrap().as_deref(), Some("1"));

        assert!(store.delete("data:a.b").await.unwrap());
        assert!(!store.delete("data:a.b").await.unwrap());
        assert!(store.get("data:a.b").await.unwrap().is_none());
        assert_eq!(store.used_bytes(), 0);
    }

    #[tokio::test]
    async fn test_overwrite_tracks_size() {
        let store = InMemoryStorage::new();

        store.put("k", "short").await.unwrap();
        store.put("k", "a much longer value").await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.used_bytes(), record_size("k", "a much longer value"));
    }

    #[tokio::test]
    async fn test_quota_exceeded_leaves_store_unchanged() {
        let store = InMemoryStorage::with_capacity(20);

        store.put("k1", "0123456789").await.unwrap(); // 12 bytes
        let err = store.put("k2", "0123456789").await.unwrap_err();
        assert!(err.is_quota());

        assert_eq!(store.len(), 1);
        assert!(store.get("k2").await.unwrap().is_none());

        // Overwriting in place with a same-sized value still fits
        store.put("k1", "9876543210").await.unwrap();
    }

    #[tokio::test]
    async fn test_scan_prefix_oldest_first() {
        let store = InMemoryStorage::new();

        store.put("data:a.1", "1").await.unwrap();
        store.put("queue:pending:x", "q").await.unwrap();
        store.put("data:a.2", "2").await.unwrap();
        store.put("data:a.1", "1b").await.unwrap();

        let records = store.scan_prefix("data:").await.unwrap();
        let keys: Vec<_> = records.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["data:a.2", "data:a.1"]);
        assert_eq!(records[1].value, "1b");
    }

    #[tokio::test]
    async fn test_usage_reports_capacity() {
        let store = InMemoryStorage::with_capacity(1024);
        store.put("k", "v").await.unwrap();

        let usage = store.usage().await.unwrap();
        assert_eq!(usage.capacity_bytes, 1024);
        assert_eq!(usage.used_bytes, 2);
        assert_eq!(usage.records, 1);
    }

    #[tokio::test]
    async fn test_remote_offline_switch() {
        let remote = InMemoryRemote::new();

        remote.put("a.b", "1").await.unwrap();
        remote.set_offline(true);

        assert!(matches!(remote.get("a.b").await, Err(StorageError::Unavailable(_))));
        assert!(remote.put("a.b", "2").await.is_err());
        assert_eq!(remote.peek("a.b").as_deref(), Some("1"));

        remote.set_offline(false);
        assert_eq!(remote.get("a.b").await.unwrap().as_deref(), Some("1"));
        assert_eq!(remote.gets(), 2);
        assert_eq!(remote.puts(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_access() {
        use std::sync::Arc;

        let store = Arc::new(InMemoryStorage::new());
        let mut handles = vec![];

        for batch in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..10 {
                    store.put(&format!("data:b{}.i{}", batch, i), "x").await.unwrap();
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.len(), 100);
    }
}
