//! Public data API: get, set, clear, plus observability accessors.
//!
//! - `get()` / `get_value()` - cache → remote → local read with fallback
//! - `set()` / `set_value()` - write-through to cache and local, queued for remote
//! - `clear()` - remove everywhere, remote delete queued
//! - `migrate_if_needed()` - eager legacy migration
//! - health, performance, queue and circuit inspection

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::cache::CacheStats;
use crate::events::{HandlerEvent, Tier};
use crate::health::HealthSnapshot;
use crate::key::{StorageKey, DATA_PREFIX};
use crate::metrics::LatencyTimer;
use crate::migration::MigrationReport;
use crate::monitored::Monitored;
use crate::performance::PerformanceMetrics;
use crate::resilience::circuit_breaker::{CircuitConfig, CircuitSnapshot};
use crate::resilience::sync_queue::{SyncOp, SyncQueueItem, SyncQueueStats};
use crate::storage::traits::StorageError;

use super::{DataHandler, HandlerError};

/// An eviction pass drops at least 1/EVICTION_FRACTION of the records
/// (and at least one)...
const EVICTION_FRACTION: usize = 10;
/// ...and keeps going until the store is back under this utilization.
const EVICTION_TARGET_UTILIZATION: f64 = 0.75;

fn decode(raw: &str) -> Result<Value, HandlerError> {
    serde_json::from_str(raw).map_err(HandlerError::from)
}

impl DataHandler {
    // ═══════════════════════════════════════════════════════════════════════════
    // API: Reads
    // ═══════════════════════════════════════════════════════════════════════════

    /// Read `namespace.field` and deserialize it as `T`.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use data_handler::DataHandler;
    /// # async fn example(handler: &DataHandler) {
    /// #[derive(serde::Deserialize)]
    /// struct Profile { name: String }
    ///
    /// match handler.get::<Profile>("profile", "user_1").await {
    ///     Ok(Some(profile)) => println!("Hello {}", profile.name),
    ///     Ok(None) => println!("No profile yet"),
    ///     Err(e) => eprintln!("Read failed: {e}"),
    /// }
    /// # }
    /// ```
    pub async fn get<T: DeserializeOwned>(
        &self,
        namespace: &str,
        field: &str,
    ) -> Result<Option<T>, HandlerError> {
        match self.get_value(namespace, field).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Read `namespace.field` as raw JSON.
    ///
    /// Lookup order:
    /// 1. Memory cache
    /// 2. Local store, if the key has writes the remote hasn't confirmed
    /// 3. Remote store (through the breaker, bounded by the remote timeout)
    /// 4. Local store
    ///
    /// A miss everywhere is `Ok(None)`. Only a failure of both the remote
    /// and the local tier is an error.
    #[tracing::instrument(skip(self))]
    pub async fn get_value(&self, namespace: &str, field: &str) -> Result<Option<Value>, HandlerError> {
        self.tracker
            .track("get", async {
                self.ensure_open()?;
                let key = StorageKey::new(namespace, field)?;
                self.read(&key).await
            })
            .await
    }

    async fn read(&self, key: &StorageKey) -> Result<Option<Value>, HandlerError> {
        self.ensure_migrated(key.namespace()).await;

        // Anything read below is only cached if no write lands meanwhile
        let seen = self.cache.generation();
        if let Some(value) = self.cache.get(key) {
            debug!(key = %key, tier = "cache", "Cache hit");
            return Ok(Some(value));
        }

        // Local holds a newer value than the remote can have
        if self.queue.has_unsynced(key).await {
            debug!(key = %key, "Unsynced writes pending, reading local tier");
            let value = self.read_local(key).await.map_err(HandlerError::from_local)?;
            if let Some(ref value) = value {
                self.cache.fill(key.clone(), value.clone(), true, seen);
            }
            return Ok(value);
        }

        let remote_error = match self.read_remote(key).await {
            Ok(Some(raw)) => {
                let value = decode(&raw)?;
                debug!(key = %key, tier = "remote", "Remote hit");
                self.cache.fill(key.clone(), value.clone(), false, seen);
                return Ok(Some(value));
            }
            Ok(None) => None,
            Err(e) => {
                debug!(key = %key, error = %e, "Remote read failed, falling back to local tier");
                Some(e)
            }
        };

        match (self.read_local(key).await, remote_error) {
            (Ok(Some(value)), _) => {
                debug!(key = %key, tier = "local", "Local hit");
                self.cache.fill(key.clone(), value.clone(), false, seen);
                Ok(Some(value))
            }
            (Ok(None), _) => Ok(None),
            (Err(StorageError::Serialization(msg)), _) => Err(HandlerError::Serialization(msg)),
            (Err(local), Some(remote)) => {
                error!(key = %key, remote = %remote, local = %local, "All tiers failed");
                crate::metrics::record_error("local", "get", "all_tiers_failed");
                Err(HandlerError::AllTiersFailed { remote, local })
            }
            (Err(local), None) => {
                // The remote answered authoritatively that there is nothing
                warn!(key = %key, error = %local, "Local read failed after remote miss");
                crate::metrics::record_error("local", "get", "backend");
                Ok(None)
            }
        }
    }

    async fn read_local(&self, key: &StorageKey) -> Result<Option<Value>, StorageError> {
        let _timer = LatencyTimer::new("local", "get");
        match self.storage.get(&key.data_key()).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| StorageError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    async fn read_remote(&self, key: &StorageKey) -> Result<Option<String>, StorageError> {
        let Some(permit) = self.breaker.try_acquire() else {
            crate::metrics::record_operation("remote", "get", "rejected");
            return Err(StorageError::Unavailable("circuit open".into()));
        };

        let timeout = self.config.remote_timeout();
        let result = {
            let _timer = LatencyTimer::new("remote", "get");
            match tokio::time::timeout(timeout, self.remote.get(&key.to_string())).await {
                Ok(result) => result,
                Err(_) => {
                    crate::metrics::record_timeout("remote", "get");
                    Err(StorageError::Timeout(timeout))
                }
            }
        };

        match &result {
            Ok(_) => {
                permit.success();
                crate::metrics::record_operation("remote", "get", "success");
            }
            Err(e) if e.is_transient() => {
                permit.failure();
                crate::metrics::record_operation("remote", "get", "error");
            }
            Err(_) => {
                permit.success();
                crate::metrics::record_operation("remote", "get", "error");
            }
        }
        result
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // API: Writes
    // ═══════════════════════════════════════════════════════════════════════════

    /// Serialize `value` and store it under `namespace.field`.
    ///
    /// Returns once the value is in the cache and durable in the local
    /// store. Remote delivery happens in the background, coalesced over the
    /// debounce window.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        namespace: &str,
        field: &str,
        value: &T,
    ) -> Result<(), HandlerError> {
        let value = serde_json::to_value(value)?;
        self.set_value(namespace, field, value).await
    }

    #[tracing::instrument(skip(self, value))]
    pub async fn set_value(&self, namespace: &str, field: &str, value: Value) -> Result<(), HandlerError> {
        self.tracker
            .track("set", async {
                self.ensure_open()?;
                let key = StorageKey::new(namespace, field)?;
                self.write(key, value).await
            })
            .await
    }

    async fn write(&self, key: StorageKey, value: Value) -> Result<(), HandlerError> {
        let payload = serde_json::to_string(&value)?;
        let _writer = self.writer.lock().await;
        self.ensure_migrated(key.namespace()).await;

        let data_key = key.data_key();
        let persisted = {
            let _timer = LatencyTimer::new("local", "put");
            self.with_quota_retry(&key, || self.storage.put(&data_key, &payload)).await
        };
        persisted?;

        let debounce = self.config.debounce();
        let queued = self
            .with_quota_retry(&key, || {
                self.queue
                    .enqueue(&key, SyncOp::Put, Some(payload.clone()), debounce)
            })
            .await;
        if let Err(e) = queued {
            // Local copy stays, but the cache must not serve a write that errored
            warn!(key = %key, error = %e, "Stored locally but could not queue for remote sync");
            self.cache.remove(&key);
            return Err(e);
        }

        // Last, so it also replaces anything a concurrent reader filled in
        self.cache.put(key.clone(), value, true);
        debug!(key = %key, bytes = payload.len(), "Value stored");
        Ok(())
    }

    /// Remove `namespace.field` from every tier.
    ///
    /// Pending remote writes for the key are cancelled and a remote delete
    /// is queued.
    #[tracing::instrument(skip(self))]
    pub async fn clear(&self, namespace: &str, field: &str) -> Result<(), HandlerError> {
        self.tracker
            .track("clear", async {
                self.ensure_open()?;
                let key = StorageKey::new(namespace, field)?;
                self.remove(&key).await
            })
            .await
    }

    async fn remove(&self, key: &StorageKey) -> Result<(), HandlerError> {
        let _writer = self.writer.lock().await;
        // Otherwise a later lazy migration would bring a legacy value back
        self.ensure_migrated(key.namespace()).await;

        self.cache.remove(key);
        let cancelled = self.queue.cancel(key).await.map_err(HandlerError::from_local)?;
        {
            let _timer = LatencyTimer::new("local", "delete");
            self.storage
                .delete(&key.data_key())
                .await
                .map_err(HandlerError::from_local)?;
        }
        self.with_quota_retry(key, || self.queue.enqueue(key, SyncOp::Delete, None, Duration::ZERO))
            .await?;
        // Drop whatever a reader filled in while the delete was in progress
        self.cache.remove(key);

        debug!(key = %key, cancelled, "Value cleared");
        Ok(())
    }

    /// Run a local-tier write for `key`; on quota exhaustion evict and try
    /// once more.
    async fn with_quota_retry<F, Fut, T>(&self, key: &StorageKey, op: F) -> Result<T, HandlerError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        match op().await {
            Ok(value) => Ok(value),
            Err(e) if e.is_quota() => {
                warn!(error = %e, "Local storage quota exceeded, evicting");
                crate::metrics::record_quota_exceeded("local");
                self.events.emit(HandlerEvent::QuotaExceeded { tier: Tier::Local });
                self.relieve_quota(key).await;

                op().await.map_err(|e| {
                    if e.is_quota() {
                        error!(error = %e, "Local storage still over quota after eviction");
                    }
                    HandlerError::from_local(e)
                })
            }
            Err(e) => {
                crate::metrics::record_error("local", "write", "backend");
                Err(HandlerError::from_local(e))
            }
        }
    }

    /// Drop the oldest cache entries and the oldest local data records
    /// that the remote already holds. `writing` is never evicted.
    async fn relieve_quota(&self, writing: &StorageKey) {
        let cache_evicted = self
            .cache
            .evict_oldest((self.cache.len() / EVICTION_FRACTION).max(1));

        let records = match self.storage.scan_prefix(DATA_PREFIX).await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Cannot scan local store for eviction");
                return;
            }
        };
        let unsynced: HashSet<StorageKey> = self.queue.unsynced_keys().await;
        let min_records = (records.len() / EVICTION_FRACTION).max(1);
        // Bytes to free to get back under the target utilization
        let mut excess = match self.storage.usage().await {
            Ok(usage) if usage.capacity_bytes > 0 => {
                let target = (usage.capacity_bytes as f64 * EVICTION_TARGET_UTILIZATION) as u64;
                usage.used_bytes.saturating_sub(target)
            }
            _ => 0,
        };

        let mut local_evicted = 0;
        for record in records {
            if local_evicted >= min_records && excess == 0 {
                break;
            }
            let Some(key) = StorageKey::from_data_key(&record.key) else {
                continue;
            };
            // Only copy of a value the remote hasn't got
            if &key == writing || unsynced.contains(&key) {
                continue;
            }
            match self.storage.delete(&record.key).await {
                Ok(_) => {
                    self.cache.remove(&key);
                    local_evicted += 1;
                    excess = excess.saturating_sub((record.key.len() + record.value.len()) as u64);
                }
                Err(e) => warn!(record = %record.key, error = %e, "Eviction delete failed"),
            }
        }

        crate::metrics::record_eviction("local", local_evicted);
        info!(cache_evicted, local_evicted, "Quota eviction pass complete");
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // API: Migration
    // ═══════════════════════════════════════════════════════════════════════════

    /// Migrate every legacy record not yet migrated. Safe to call any
    /// number of times; namespaces already checked this session are skipped.
    #[tracing::instrument(skip(self))]
    pub async fn migrate_if_needed(&self) -> Result<MigrationReport, HandlerError> {
        self.tracker
            .track("migrate", async {
                self.ensure_open()?;
                let report = self
                    .migration
                    .migrate_all()
                    .await
                    .map_err(HandlerError::from_local)?;
                self.enqueue_migrated(&report).await;
                Ok(report)
            })
            .await
    }

    /// Lazy per-namespace migration. Failures are logged and retried on the
    /// next access to the namespace.
    async fn ensure_migrated(&self, namespace: &str) {
        match self.migration.ensure_namespace(namespace).await {
            Ok(Some(report)) => self.enqueue_migrated(&report).await,
            Ok(None) => {}
            Err(e) => {
                warn!(namespace, error = %e, "Legacy migration check failed");
                crate::metrics::record_migration("failed");
            }
        }
    }

    /// Migrated values go to the remote like any other write.
    async fn enqueue_migrated(&self, report: &MigrationReport) {
        for migrated in &report.migrated {
            let result = self
                .with_quota_retry(&migrated.key, || {
                    self.queue.enqueue(
                        &migrated.key,
                        SyncOp::Put,
                        Some(migrated.payload.clone()),
                        Duration::ZERO,
                    )
                })
                .await;
            if let Err(e) = result {
                warn!(key = %migrated.key, error = %e, "Failed to queue migrated record for sync");
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // API: Observability
    // ═══════════════════════════════════════════════════════════════════════════

    /// Latest health snapshot, as of the last sample.
    #[must_use]
    pub fn health_snapshot(&self) -> Arc<HealthSnapshot> {
        self.health.latest()
    }

    /// Take a fresh health sample now.
    pub fn sample_health(&self) -> Arc<HealthSnapshot> {
        self.health.sample()
    }

    #[must_use]
    pub fn performance_metrics(&self) -> PerformanceMetrics {
        self.tracker.snapshot()
    }

    #[must_use]
    pub fn circuit(&self) -> CircuitSnapshot {
        self.breaker.snapshot()
    }

    /// Force the remote circuit closed (operator action).
    pub fn reset_circuit(&self) {
        info!("Remote circuit reset");
        self.breaker.reset();
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    #[must_use]
    pub fn sync_queue_stats(&self) -> SyncQueueStats {
        self.queue.stats()
    }

    pub async fn dead_letters(&self) -> Vec<SyncQueueItem> {
        self.queue.dead_letters().await
    }

    /// Move every dead-lettered item back to pending with a fresh attempt
    /// budget. Returns how many were requeued.
    #[tracing::instrument(skip(self))]
    pub async fn retry_dead_letters(&self) -> Result<usize, HandlerError> {
        self.tracker
            .track("retry_dead_letters", async {
                self.ensure_open()?;
                let requeued = self
                    .queue
                    .retry_dead_letters()
                    .await
                    .map_err(HandlerError::from_local)?;
                if requeued > 0 {
                    info!(requeued, "Dead-lettered items requeued");
                }
                Ok(requeued)
            })
            .await
    }

    /// Receive [`HandlerEvent`]s from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<HandlerEvent> {
        self.events.subscribe()
    }

    /// Wrap `component` with its own breaker and tracker; its circuit
    /// transitions are published on this handler's event stream.
    pub fn monitored<T>(&self, name: impl Into<String>, component: T, config: CircuitConfig) -> Monitored<T> {
        Monitored::with_events(
            name,
            component,
            config,
            self.events.clone(),
            self.config.latency_window,
        )
    }
}
