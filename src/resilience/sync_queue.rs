// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable queue of writes waiting to reach the remote tier.
//!
//! Every item is persisted in the local store under `queue:pending:<id>`
//! before it is acknowledged, and the in-memory queue is rebuilt from those
//! records on startup. Items that exhaust their attempts move to
//! `queue:dead:<id>` and stay there until an operator requeues them.
//!
//! Ordering is FIFO per key with no cross-key guarantee: an item is never
//! handed out while an older item for the same key is pending or in flight.
//! Writes that land while the newest item for a key is still waiting are
//! folded into it (last write wins) instead of queueing a second delivery.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::circuit_breaker::CircuitBreaker;
use super::retry::Backoff;
use crate::events::{EventBus, HandlerEvent};
use crate::key::{StorageKey, QUEUE_DEAD_PREFIX, QUEUE_PENDING_PREFIX};
use crate::metrics::LatencyTimer;
use crate::storage::traits::{RemoteAdapter, StorageAdapter, StorageError};

/// Remote operation carried by a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOp {
    Put,
    Delete,
}

impl SyncOp {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Put => "put",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueItem {
    pub id: Uuid,
    pub key: StorageKey,
    pub op: SyncOp,
    /// Serialized value for `Put`, `None` for `Delete`
    pub payload: Option<String>,
    pub attempts: u32,
    /// Epoch millis before which the item is not handed out
    pub next_retry_at: i64,
    pub created_at: i64,
    /// Enqueue order, survives restarts
    pub sequence: u64,
}

impl SyncQueueItem {
    fn pending_key(&self) -> String {
        format!("{QUEUE_PENDING_PREFIX}{}", self.id)
    }

    fn dead_key(&self) -> String {
        format!("{QUEUE_DEAD_PREFIX}{}", self.id)
    }

    fn encode(&self) -> Result<String, StorageError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone)]
pub struct SyncQueueConfig {
    /// Attempts before an item is dead-lettered
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for SyncQueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            backoff: Backoff::new(Duration::from_millis(500), Duration::from_secs(60)),
        }
    }
}

/// Result of [`SyncQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    New(Uuid),
    /// Folded into a waiting item for the same key
    Coalesced(Uuid),
}

impl Enqueued {
    #[must_use]
    pub fn id(&self) -> Uuid {
        match self {
            Self::New(id) | Self::Coalesced(id) => *id,
        }
    }
}

/// What happened to an item after a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Rescheduled { next_retry_at: i64 },
    DeadLettered,
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Keys whose item reached the remote
    pub delivered: Vec<StorageKey>,
    pub retried: usize,
    pub dead_lettered: usize,
    /// Items handed back untouched because the breaker refused the call
    pub rejected: usize,
}

impl DrainReport {
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.retried + self.dead_lettered
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attempted() == 0 && self.rejected == 0
    }

    pub fn merge(&mut self, other: DrainReport) {
        self.delivered.extend(other.delivered);
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
        self.rejected += other.rejected;
    }
}

/// Queue state for observability
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueStats {
    /// Items waiting (including in-flight ones)
    pub pending: usize,
    pub in_flight: usize,
    pub dead_lettered: usize,
    /// Totals since startup
    pub total_enqueued: u64,
    pub total_coalesced: u64,
    pub total_delivered: u64,
    pub total_dead_lettered: u64,
}

#[derive(Default)]
struct QueueState {
    /// Ordered by `sequence`
    pending: Vec<SyncQueueItem>,
    in_flight: HashSet<Uuid>,
    dead: Vec<SyncQueueItem>,
}

impl QueueState {
    fn position(&self, id: Uuid) -> Option<usize> {
        self.pending.iter().position(|i| i.id == id)
    }

    fn insert_ordered(&mut self, item: SyncQueueItem) {
        let at = self.pending.partition_point(|i| i.sequence < item.sequence);
        self.pending.insert(at, item);
    }
}

pub struct SyncQueue {
    storage: Arc<dyn StorageAdapter>,
    config: SyncQueueConfig,
    events: EventBus,
    /// Held across the storage write of each mutation so persisted order
    /// matches memory order
    state: Mutex<QueueState>,
    next_sequence: AtomicU64,

    pending_count: AtomicUsize,
    in_flight_count: AtomicUsize,
    dead_count: AtomicUsize,
    total_enqueued: AtomicU64,
    total_coalesced: AtomicU64,
    total_delivered: AtomicU64,
    total_dead_lettered: AtomicU64,
}

async fn load_items(
    storage: &dyn StorageAdapter,
    prefix: &str,
) -> Result<Vec<SyncQueueItem>, StorageError> {
    let mut items = Vec::new();
    for record in storage.scan_prefix(prefix).await? {
        match serde_json::from_str::<SyncQueueItem>(&record.value) {
            Ok(item) => items.push(item),
            Err(e) => warn!(record = %record.key, error = %e, "Skipping unreadable queue record"),
        }
    }
    items.sort_by_key(|i| i.sequence);
    Ok(items)
}

impl SyncQueue {
    /// Open the queue, rebuilding it from the records persisted in `storage`.
    pub async fn open(
        storage: Arc<dyn StorageAdapter>,
        config: SyncQueueConfig,
        events: EventBus,
    ) -> Result<Self, StorageError> {
        let pending = load_items(storage.as_ref(), QUEUE_PENDING_PREFIX).await?;
        let dead = load_items(storage.as_ref(), QUEUE_DEAD_PREFIX).await?;

        let next_sequence = pending
            .iter()
            .chain(dead.iter())
            .map(|i| i.sequence + 1)
            .max()
            .unwrap_or(0);

        if !pending.is_empty() || !dead.is_empty() {
            warn!(
                pending = pending.len(),
                dead_lettered = dead.len(),
                "Sync queue has items from previous run, will drain"
            );
        }

        let queue = Self {
            storage,
            config,
            events,
            state: Mutex::new(QueueState {
                pending,
                in_flight: HashSet::new(),
                dead,
            }),
            next_sequence: AtomicU64::new(next_sequence),
            pending_count: AtomicUsize::new(0),
            in_flight_count: AtomicUsize::new(0),
            dead_count: AtomicUsize::new(0),
            total_enqueued: AtomicU64::new(0),
            total_coalesced: AtomicU64::new(0),
            total_delivered: AtomicU64::new(0),
            total_dead_lettered: AtomicU64::new(0),
        };
        queue.publish(&*queue.state.lock().await);
        Ok(queue)
    }

    fn publish(&self, state: &QueueState) {
        self.pending_count.store(state.pending.len(), Ordering::Release);
        self.in_flight_count.store(state.in_flight.len(), Ordering::Release);
        self.dead_count.store(state.dead.len(), Ordering::Release);
        crate::metrics::set_queue_depth(state.pending.len(), state.dead.len());
    }

    #[must_use]
    pub fn config(&self) -> &SyncQueueConfig {
        &self.config
    }

    /// Queue `op` for `key`, due after `delay`.
    ///
    /// If the newest item for `key` is still waiting (not in flight) the
    /// write is folded into it: it takes the new op and payload but keeps its
    /// id, position and due time, so the debounce window is anchored at the
    /// first write. The attempt count starts over, earlier failures were for
    /// a value that no longer exists. Returns only once the item is persisted.
    pub async fn enqueue(
        &self,
        key: &StorageKey,
        op: SyncOp,
        payload: Option<String>,
        delay: Duration,
    ) -> Result<Enqueued, StorageError> {
        let now = crate::now_millis();
        let mut state = self.state.lock().await;

        let mergeable = state
            .pending
            .iter()
            .rposition(|i| &i.key == key)
            .filter(|&pos| !state.in_flight.contains(&state.pending[pos].id));
        if let Some(pos) = mergeable {
            let mut merged = state.pending[pos].clone();
            merged.op = op;
            merged.payload = payload;
            merged.attempts = 0;
            self.storage.put(&merged.pending_key(), &merged.encode()?).await?;

            let id = merged.id;
            state.pending[pos] = merged;
            self.total_coalesced.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_coalesced();
            debug!(key = %key, id = %id, "Coalesced write into pending sync item");
            return Ok(Enqueued::Coalesced(id));
        }

        let item = SyncQueueItem {
            id: Uuid::new_v4(),
            key: key.clone(),
            op,
            payload,
            attempts: 0,
            next_retry_at: now + delay.as_millis() as i64,
            created_at: now,
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
        };
        self.storage.put(&item.pending_key(), &item.encode()?).await?;

        let id = item.id;
        debug!(key = %key, id = %id, op = op.as_str(), "Queued sync item");
        state.insert_ordered(item);
        self.total_enqueued.fetch_add(1, Ordering::Relaxed);
        self.publish(&state);
        Ok(Enqueued::New(id))
    }

    /// Drop every waiting and dead-lettered item for `key`. An item already
    /// in flight is left to finish. Returns the number of items removed.
    pub async fn cancel(&self, key: &StorageKey) -> Result<usize, StorageError> {
        let mut state = self.state.lock().await;

        let pending: Vec<SyncQueueItem> = state
            .pending
            .iter()
            .filter(|i| &i.key == key && !state.in_flight.contains(&i.id))
            .cloned()
            .collect();
        let dead: Vec<SyncQueueItem> = state.dead.iter().filter(|i| &i.key == key).cloned().collect();

        for item in &pending {
            self.storage.delete(&item.pending_key()).await?;
            if let Some(pos) = state.position(item.id) {
                state.pending.remove(pos);
            }
        }
        for item in &dead {
            self.storage.delete(&item.dead_key()).await?;
            state.dead.retain(|i| i.id != item.id);
        }

        let removed = pending.len() + dead.len();
        if removed > 0 {
            debug!(key = %key, removed, "Cancelled sync items");
        }
        self.publish(&state);
        Ok(removed)
    }

    /// Hand out up to `limit` items that are due at `now` (all waiting items
    /// when `force`), marking them in flight. At most one item per key.
    pub async fn take_due(&self, now: i64, limit: usize, force: bool) -> Vec<SyncQueueItem> {
        let mut state = self.state.lock().await;
        let mut blocked: HashSet<StorageKey> = HashSet::new();
        let mut taken = Vec::new();

        for item in &state.pending {
            if taken.len() >= limit {
                break;
            }
            if blocked.contains(&item.key) {
                continue;
            }
            // Whatever happens to this item, later ones for the key wait on it
            blocked.insert(item.key.clone());
            if state.in_flight.contains(&item.id) {
                continue;
            }
            if force || item.next_retry_at <= now {
                taken.push(item.clone());
            }
        }

        for item in &taken {
            state.in_flight.insert(item.id);
        }
        self.publish(&state);
        taken
    }

    /// Confirmed delivery: forget the item.
    pub async fn complete(&self, item: &SyncQueueItem) {
        let mut state = self.state.lock().await;
        state.in_flight.remove(&item.id);
        if let Some(pos) = state.position(item.id) {
            state.pending.remove(pos);
        }
        if let Err(e) = self.storage.delete(&item.pending_key()).await {
            // Redelivered after a restart at worst; puts and deletes are idempotent
            warn!(id = %item.id, error = %e, "Failed to remove delivered sync item");
        }
        self.total_delivered.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_sync_delivery(item.op.as_str(), "delivered");
        self.publish(&state);
    }

    /// Failed delivery: reschedule with backoff, or dead-letter once the
    /// attempt ceiling is reached.
    pub async fn fail(&self, item: &SyncQueueItem, error: &StorageError) -> FailOutcome {
        let now = crate::now_millis();
        let mut state = self.state.lock().await;
        state.in_flight.remove(&item.id);

        let Some(pos) = state.position(item.id) else {
            self.publish(&state);
            return FailOutcome::Rescheduled { next_retry_at: now };
        };

        let mut updated = state.pending[pos].clone();
        updated.attempts = updated.attempts.saturating_add(1);

        if updated.attempts >= self.config.max_attempts {
            state.pending.remove(pos);
            if let Err(e) = self.persist_dead(&updated).await {
                warn!(id = %updated.id, error = %e, "Failed to persist dead-lettered sync item");
            }
            warn!(
                key = %updated.key,
                attempts = updated.attempts,
                error = %error,
                "Sync item dead-lettered"
            );
            self.events.emit(HandlerEvent::SyncItemDeadLettered {
                key: updated.key.to_string(),
                attempts: updated.attempts,
            });
            state.dead.push(updated);
            self.total_dead_lettered.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_dead_letter();
            crate::metrics::record_sync_delivery(item.op.as_str(), "dead_lettered");
            self.publish(&state);
            return FailOutcome::DeadLettered;
        }

        let delay = self.config.backoff.delay(updated.attempts);
        updated.next_retry_at = now + delay.as_millis() as i64;
        let next_retry_at = updated.next_retry_at;
        match updated.encode() {
            Ok(encoded) => {
                if let Err(e) = self.storage.put(&updated.pending_key(), &encoded).await {
                    warn!(id = %updated.id, error = %e, "Failed to persist sync item retry state");
                }
            }
            Err(e) => warn!(id = %updated.id, error = %e, "Failed to encode sync item"),
        }
        debug!(
            key = %updated.key,
            attempts = updated.attempts,
            retry_in_ms = delay.as_millis() as u64,
            error = %error,
            "Sync delivery failed, rescheduled"
        );
        state.pending[pos] = updated;
        crate::metrics::record_sync_delivery(item.op.as_str(), "retry");
        self.publish(&state);
        FailOutcome::Rescheduled { next_retry_at }
    }

    async fn persist_dead(&self, item: &SyncQueueItem) -> Result<(), StorageError> {
        self.storage.put(&item.dead_key(), &item.encode()?).await?;
        self.storage.delete(&item.pending_key()).await?;
        Ok(())
    }

    /// Hand an item back unchanged (no attempt was made).
    pub async fn release(&self, item: &SyncQueueItem) {
        let mut state = self.state.lock().await;
        state.in_flight.remove(&item.id);
        self.publish(&state);
    }

    /// Deliver due items to `remote`, each call guarded by `breaker` and
    /// bounded by `timeout`. The pass stops at the first breaker rejection;
    /// rejected items are released without counting an attempt.
    pub async fn drain_to(
        &self,
        remote: &dyn RemoteAdapter,
        breaker: &CircuitBreaker,
        timeout: Duration,
        limit: usize,
        force: bool,
    ) -> DrainReport {
        let items = self.take_due(crate::now_millis(), limit, force).await;
        let mut report = DrainReport::default();
        if items.is_empty() {
            return report;
        }

        let mut remaining = items.into_iter();
        while let Some(item) = remaining.next() {
            let Some(permit) = breaker.try_acquire() else {
                self.release(&item).await;
                report.rejected += 1;
                for rest in remaining.by_ref() {
                    self.release(&rest).await;
                    report.rejected += 1;
                }
                crate::metrics::record_sync_delivery(item.op.as_str(), "rejected");
                debug!(rejected = report.rejected, "Circuit open, sync drain paused");
                break;
            };

            match deliver(remote, &item, timeout).await {
                Ok(()) => {
                    permit.success();
                    self.complete(&item).await;
                    report.delivered.push(item.key.clone());
                }
                Err(e) => {
                    if e.is_transient() {
                        permit.failure();
                    } else {
                        // The remote answered; not an availability failure
                        permit.success();
                    }
                    match self.fail(&item, &e).await {
                        FailOutcome::Rescheduled { .. } => report.retried += 1,
                        FailOutcome::DeadLettered => report.dead_lettered += 1,
                    }
                }
            }
        }

        if report.attempted() > 0 {
            info!(
                delivered = report.delivered.len(),
                retried = report.retried,
                dead_lettered = report.dead_lettered,
                remaining = self.pending_count.load(Ordering::Acquire),
                "Sync drain pass complete"
            );
        }
        report
    }

    /// Whether `key` has a write the remote has not confirmed (pending, in
    /// flight or dead-lettered).
    pub async fn has_unsynced(&self, key: &StorageKey) -> bool {
        let state = self.state.lock().await;
        state.pending.iter().any(|i| &i.key == key) || state.dead.iter().any(|i| &i.key == key)
    }

    /// Every key with an unconfirmed write.
    pub async fn unsynced_keys(&self) -> HashSet<StorageKey> {
        let state = self.state.lock().await;
        state
            .pending
            .iter()
            .chain(state.dead.iter())
            .map(|i| i.key.clone())
            .collect()
    }

    pub async fn dead_letters(&self) -> Vec<SyncQueueItem> {
        self.state.lock().await.dead.clone()
    }

    /// Move every dead-lettered item back to pending with its attempts reset.
    /// Items keep their original sequence, so per-key order is preserved.
    pub async fn retry_dead_letters(&self) -> Result<usize, StorageError> {
        let now = crate::now_millis();
        let mut state = self.state.lock().await;
        let dead = std::mem::take(&mut state.dead);
        let mut requeued = 0;

        let mut iter = dead.into_iter();
        while let Some(mut item) = iter.next() {
            item.attempts = 0;
            item.next_retry_at = now;
            let persisted = async {
                self.storage.put(&item.pending_key(), &item.encode()?).await?;
                self.storage.delete(&item.dead_key()).await
            }
            .await;
            if let Err(e) = persisted {
                // Put what is left back where it was
                item.attempts = self.config.max_attempts;
                state.dead.push(item);
                state.dead.extend(iter);
                self.publish(&state);
                return Err(e);
            }
            state.insert_ordered(item);
            requeued += 1;
        }

        if requeued > 0 {
            info!(requeued, "Dead-lettered sync items requeued");
        }
        self.publish(&state);
        Ok(requeued)
    }

    #[must_use]
    pub fn stats(&self) -> SyncQueueStats {
        SyncQueueStats {
            pending: self.pending_count.load(Ordering::Acquire),
            in_flight: self.in_flight_count.load(Ordering::Acquire),
            dead_lettered: self.dead_count.load(Ordering::Acquire),
            total_enqueued: self.total_enqueued.load(Ordering::Relaxed),
            total_coalesced: self.total_coalesced.load(Ordering::Relaxed),
            total_delivered: self.total_delivered.load(Ordering::Relaxed),
            total_dead_lettered: self.total_dead_lettered.load(Ordering::Relaxed),
        }
    }

    /// Check if the queue has items waiting for delivery.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.pending_count.load(Ordering::Acquire) > 0
    }
}

async fn deliver(
    remote: &dyn RemoteAdapter,
    item: &SyncQueueItem,
    timeout: Duration,
) -> Result<(), StorageError> {
    let key = item.key.to_string();
    let _timer = LatencyTimer::new("remote", item.op.as_str());

    let call = async {
        match item.op {
            SyncOp::Put => {
                let payload = item
                    .payload
                    .as_deref()
                    .ok_or_else(|| StorageError::Serialization("put item without payload".into()))?;
                remote.put(&key, payload).await
            }
            SyncOp::Delete => remote.delete(&key).await,
        }
    };

    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => {
            crate::metrics::record_timeout("remote", item.op.as_str());
            Err(StorageError::Timeout(timeout))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::circuit_breaker::CircuitConfig;
    use crate::storage::memory::{InMemoryRemote, InMemoryStorage};

    fn key(field: &str) -> StorageKey {
        StorageKey::new("profile", field).unwrap()
    }

    fn fast_config(max_attempts: u32) -> SyncQueueConfig {
        SyncQueueConfig {
            max_attempts,
            backoff: Backoff::new(Duration::from_millis(1), Duration::from_millis(2)),
        }
    }

    async fn open(storage: &Arc<InMemoryStorage>, config: SyncQueueConfig) -> SyncQueue {
        SyncQueue::open(storage.clone(), config, EventBus::new(16)).await.unwrap()
    }

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("remote", CircuitConfig { failure_threshold: 100, cooldown: Duration::from_secs(60) })
    }

    #[tokio::test]
    async fn test_enqueue_persists_item() {
        let storage = Arc::new(InMemoryStorage::new());
        let queue = open(&storage, SyncQueueConfig::default()).await;

        let outcome = queue
            .enqueue(&key("u1"), SyncOp::Put, Some("1".into()), Duration::ZERO)
            .await
            .unwrap();

        let persisted = storage.scan_prefix(QUEUE_PENDING_PREFIX).await.unwrap();
        assert_eq!(persisted.len(), 1);
        assert!(persisted[0].key.ends_with(&outcome.id().to_string()));
        assert_eq!(queue.stats().pending, 1);
        assert!(queue.has_unsynced(&key("u1")).await);
    }

    #[tokio::test]
    async fn test_coalescing_keeps_id_and_due_time() {
        let storage = Arc::new(InMemoryStorage::new());
        let queue = open(&storage, SyncQueueConfig::default()).await;

        let first = queue
            .enqueue(&key("u1"), SyncOp::Put, Some("1".into()), Duration::from_secs(60))
            .await
            .unwrap();
        let due = queue.take_due(i64::MAX, 10, false).await;
        for item in &due {
            queue.release(item).await;
        }
        let before = due[0].next_retry_at;

        let second = queue
            .enqueue(&key("u1"), SyncOp::Put, Some("2".into()), Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(second, Enqueued::Coalesced(first.id()));
        let items = queue.take_due(i64::MAX, 10, false).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].payload.as_deref(), Some("2"));
        assert_eq!(items[0].next_retry_at, before);
        assert_eq!(queue.stats().total_coalesced, 1);
    }

    #[tokio::test]
    async fn test_in_flight_item_is_not_coalesced() {
        let storage = Arc::new(InMemoryStorage::new());
        let queue = open(&storage, SyncQueueConfig::default()).await;

        queue.enqueue(&key("u1"), SyncOp::Put, Some("1".into()), Duration::ZERO).await.unwrap();
        let in_flight = queue.take_due(crate::now_millis(), 10, false).await;
        assert_eq!(in_flight.len(), 1);

        let outcome = queue
            .enqueue(&key("u1"), SyncOp::Put, Some("2".into()), Duration::ZERO)
            .await
            .unwrap();
        assert!(matches!(outcome, Enqueued::New(_)));

        // Second item waits for the first
        assert!(queue.take_due(crate::now_millis(), 10, false).await.is_empty());

        queue.complete(&in_flight[0]).await;
        let next = queue.take_due(crate::now_millis(), 10, false).await;
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].payload.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_take_due_respects_schedule() {
        let storage = Arc::new(InMemoryStorage::new());
        let queue = open(&storage, SyncQueueConfig::default()).await;

        queue.enqueue(&key("now"), SyncOp::Put, Some("1".into()), Duration::ZERO).await.unwrap();
        queue.enqueue(&key("later"), SyncOp::Put, Some("2".into()), Duration::from_secs(60)).await.unwrap();

        let due = queue.take_due(crate::now_millis(), 10, false).await;
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].key, key("now"));

        let forced = queue.take_due(crate::now_millis(), 10, true).await;
        assert_eq!(forced.len(), 1);
        assert_eq!(forced[0].key, key("later"));
        assert_eq!(queue.stats().in_flight, 2);
    }

    #[tokio::test]
    async fn test_fail_reschedules_then_dead_letters() {
        let storage = Arc::new(InMemoryStorage::new());
        let events = EventBus::new(16);
        let mut rx = events.subscribe();
        let queue = SyncQueue::open(storage.clone(), fast_config(2), events).await.unwrap();
        let err = StorageError::Unavailable("down".into());

        queue.enqueue(&key("u1"), SyncOp::Put, Some("1".into()), Duration::ZERO).await.unwrap();

        let item = queue.take_due(i64::MAX, 1, false).await.remove(0);
        assert!(matches!(queue.fail(&item, &err).await, FailOutcome::Rescheduled { .. }));

        let item = queue.take_due(i64::MAX, 1, false).await.remove(0);
        assert_eq!(item.attempts, 1);
        assert_eq!(queue.fail(&item, &err).await, FailOutcome::DeadLettered);

        let stats = queue.stats();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.dead_lettered, 1);
        assert!(storage.scan_prefix(QUEUE_PENDING_PREFIX).await.unwrap().is_empty());
        assert_eq!(storage.scan_prefix(QUEUE_DEAD_PREFIX).await.unwrap().len(), 1);

        // Dead-lettered keys still count as unsynced
        assert!(queue.has_unsynced(&key("u1")).await);
        assert_eq!(
            rx.recv().await.unwrap(),
            HandlerEvent::SyncItemDeadLettered { key: "profile.u1".into(), attempts: 2 }
        );
    }

    #[tokio::test]
    async fn test_coalescing_into_retrying_item_resets_attempts() {
        let storage = Arc::new(InMemoryStorage::new());
        let queue = open(&storage, fast_config(2)).await;
        let err = StorageError::Unavailable("down".into());

        queue.enqueue(&key("u1"), SyncOp::Put, Some("1".into()), Duration::ZERO).await.unwrap();
        let item = queue.take_due(i64::MAX, 1, false).await.remove(0);
        assert!(matches!(queue.fail(&item, &err).await, FailOutcome::Rescheduled { .. }));

        // Fresh value lands while the old one waits out its backoff
        let outcome = queue
            .enqueue(&key("u1"), SyncOp::Put, Some("2".into()), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(outcome, Enqueued::Coalesced(item.id));

        let item = queue.take_due(i64::MAX, 1, false).await.remove(0);
        assert_eq!(item.attempts, 0);
        assert_eq!(item.payload.as_deref(), Some("2"));

        // One failure is not enough to dead-letter the new value
        assert!(matches!(queue.fail(&item, &err).await, FailOutcome::Rescheduled { .. }));
        assert_eq!(queue.stats().dead_lettered, 0);

        let persisted = storage.scan_prefix(QUEUE_PENDING_PREFIX).await.unwrap();
        let decoded: SyncQueueItem = serde_json::from_str(&persisted[0].value).unwrap();
        assert_eq!(decoded.attempts, 1);
    }

    #[tokio::test]
    async fn test_reopen_rebuilds_in_order() {
        let storage = Arc::new(InMemoryStorage::new());
        {
            let queue = open(&storage, fast_config(1)).await;
            queue.enqueue(&key("a"), SyncOp::Put, Some("1".into()), Duration::ZERO).await.unwrap();
            queue.enqueue(&key("b"), SyncOp::Delete, None, Duration::ZERO).await.unwrap();
            queue.enqueue(&key("c"), SyncOp::Put, Some("3".into()), Duration::ZERO).await.unwrap();
            let item = queue.take_due(i64::MAX, 1, false).await.remove(0);
            queue.fail(&item, &StorageError::Unavailable("down".into())).await;
        }

        let queue = open(&storage, fast_config(1)).await;
        let stats = queue.stats();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.dead_lettered, 1);

        let items = queue.take_due(i64::MAX, 10, false).await;
        let keys: Vec<_> = items.iter().map(|i| i.key.field().to_string()).collect();
        assert_eq!(keys, vec!["b", "c"]);
        assert!(items[1].sequence > items[0].sequence);

        // New items sequence after everything persisted
        queue.enqueue(&key("d"), SyncOp::Put, Some("4".into()), Duration::ZERO).await.unwrap();
        let dead = queue.dead_letters().await;
        let newest = queue.take_due(i64::MAX, 10, false).await.remove(0);
        assert!(newest.sequence > dead[0].sequence.max(items[1].sequence));
    }

    #[tokio::test]
    async fn test_cancel_removes_pending_and_dead() {
        let storage = Arc::new(InMemoryStorage::new());
        let queue = open(&storage, fast_config(1)).await;

        queue.enqueue(&key("u1"), SyncOp::Put, Some("1".into()), Duration::ZERO).await.unwrap();
        let item = queue.take_due(i64::MAX, 1, false).await.remove(0);
        queue.fail(&item, &StorageError::Unavailable("down".into())).await;
        queue.enqueue(&key("u1"), SyncOp::Put, Some("2".into()), Duration::ZERO).await.unwrap();
        queue.enqueue(&key("u2"), SyncOp::Put, Some("3".into()), Duration::ZERO).await.unwrap();

        assert_eq!(queue.cancel(&key("u1")).await.unwrap(), 2);
        assert!(!queue.has_unsynced(&key("u1")).await);
        assert!(queue.has_unsynced(&key("u2")).await);
        assert_eq!(storage.scan_prefix("queue:").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_dead_letters_requeues() {
        let storage = Arc::new(InMemoryStorage::new());
        let queue = open(&storage, fast_config(1)).await;

        queue.enqueue(&key("u1"), SyncOp::Put, Some("1".into()), Duration::ZERO).await.unwrap();
        let item = queue.take_due(i64::MAX, 1, false).await.remove(0);
        queue.fail(&item, &StorageError::Unavailable("down".into())).await;

        assert_eq!(queue.retry_dead_letters().await.unwrap(), 1);
        assert!(queue.dead_letters().await.is_empty());

        let items = queue.take_due(crate::now_millis(), 10, false).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].attempts, 0);
        assert_eq!(items[0].id, item.id);
        assert!(storage.scan_prefix(QUEUE_DEAD_PREFIX).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drain_delivers_puts_and_deletes() {
        let storage = Arc::new(InMemoryStorage::new());
        let queue = open(&storage, SyncQueueConfig::default()).await;
        let remote = InMemoryRemote::new();
        remote.put("profile.gone", "old").await.unwrap();

        queue.enqueue(&key("u1"), SyncOp::Put, Some("{\"name\":\"A\"}".into()), Duration::ZERO).await.unwrap();
        queue.enqueue(&key("gone"), SyncOp::Delete, None, Duration::ZERO).await.unwrap();

        let report = queue
            .drain_to(&remote, &breaker(), Duration::from_secs(1), 64, false)
            .await;

        assert_eq!(report.delivered.len(), 2);
        assert_eq!(remote.peek("profile.u1").as_deref(), Some("{\"name\":\"A\"}"));
        assert!(remote.peek("profile.gone").is_none());
        assert!(!queue.has_pending());
        assert_eq!(queue.stats().total_delivered, 2);
    }

    #[tokio::test]
    async fn test_drain_stops_on_open_circuit() {
        let storage = Arc::new(InMemoryStorage::new());
        let queue = open(&storage, SyncQueueConfig::default()).await;
        let remote = InMemoryRemote::new();
        let breaker = CircuitBreaker::new(
            "remote",
            CircuitConfig { failure_threshold: 1, cooldown: Duration::from_secs(60) },
        );
        let _: Result<(), _> = breaker.call(|| async { Err::<(), _>("down") }).await;

        queue.enqueue(&key("a"), SyncOp::Put, Some("1".into()), Duration::ZERO).await.unwrap();
        queue.enqueue(&key("b"), SyncOp::Put, Some("2".into()), Duration::ZERO).await.unwrap();

        let report = queue.drain_to(&remote, &breaker, Duration::from_secs(1), 64, false).await;

        assert_eq!(report.rejected, 2);
        assert_eq!(report.attempted(), 0);
        assert_eq!(remote.puts(), 0);
        let stats = queue.stats();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.in_flight, 0);

        // No attempt was charged
        let items = queue.take_due(i64::MAX, 10, false).await;
        assert!(items.iter().all(|i| i.attempts == 0));
    }

    #[tokio::test]
    async fn test_drain_failure_is_retried() {
        let storage = Arc::new(InMemoryStorage::new());
        let queue = open(&storage, fast_config(5)).await;
        let remote = InMemoryRemote::new();
        remote.set_offline(true);

        queue.enqueue(&key("a"), SyncOp::Put, Some("1".into()), Duration::ZERO).await.unwrap();
        let report = queue.drain_to(&remote, &breaker(), Duration::from_secs(1), 64, false).await;
        assert_eq!(report.retried, 1);

        remote.set_offline(false);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let report = queue.drain_to(&remote, &breaker(), Duration::from_secs(1), 64, false).await;
        assert_eq!(report.delivered, vec![key("a")]);
        assert_eq!(remote.peek("profile.a").as_deref(), Some("1"));
    }
}
