//! Handler lifecycle: initialize, background worker, shutdown.

use std::sync::{Arc, Weak};
use std::time::Instant;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cache::CacheLayer;
use crate::config::HandlerConfig;
use crate::events::EventBus;
use crate::health::HealthMonitor;
use crate::migration::MigrationEngine;
use crate::performance::PerformanceTracker;
use crate::resilience::circuit_breaker::CircuitBreaker;
use crate::resilience::sync_queue::SyncQueue;
use crate::storage::traits::{RemoteAdapter, StorageAdapter};

use super::{DataHandler, HandlerState, InitError};

impl DataHandler {
    /// Build a handler over the given adapters and start its background
    /// worker.
    ///
    /// Startup flow:
    /// 1. Validate config
    /// 2. Rebuild the sync queue from the local store (items from a previous
    ///    run are delivered by the worker)
    /// 3. Build breaker, tracker and health monitor
    /// 4. Spawn the worker, which first runs a one-off legacy migration
    ///    pass, then syncs and samples health on their intervals
    ///
    /// Startup never waits on the remote store.
    #[tracing::instrument(skip_all)]
    pub async fn initialize(
        config: HandlerConfig,
        storage: Arc<dyn StorageAdapter>,
        remote: Arc<dyn RemoteAdapter>,
    ) -> Result<Arc<Self>, InitError> {
        let startup_start = Instant::now();
        config.validate()?;

        let (state_tx, state_rx) = watch::channel(HandlerState::Created);
        let _ = state_tx.send(HandlerState::Initializing);
        crate::metrics::set_handler_state("Initializing");
        info!("Initializing data handler...");

        let events = EventBus::new(config.event_capacity);
        let queue = Arc::new(
            SyncQueue::open(storage.clone(), config.sync_queue_config(), events.clone()).await?,
        );

        let breaker = Arc::new(
            CircuitBreaker::new("remote", config.circuit_config()).with_events(events.clone()),
        );
        let tracker = Arc::new(PerformanceTracker::new("data_handler", config.latency_window));
        let health = HealthMonitor::new(
            "data_handler",
            breaker.clone(),
            tracker.clone(),
            Some(queue.clone()),
        );
        let migration = MigrationEngine::new(
            storage.clone(),
            config.legacy_separator.clone(),
            events.clone(),
        )
        .with_namespaces(config.legacy_namespaces.iter().cloned());
        let (shutdown_tx, _) = watch::channel(false);

        let handler = Arc::new(Self {
            cache: CacheLayer::new(config.cache_max_entries, config.cache_ttl()),
            config,
            state: state_tx,
            state_rx,
            storage,
            remote,
            breaker,
            queue,
            migration,
            tracker,
            health,
            events,
            writer: Mutex::new(()),
            shutdown_tx,
            worker: SyncMutex::new(None),
        });
        handler.set_state(HandlerState::Ready);

        let worker = spawn_worker(&handler);
        *handler.worker.lock() = Some(worker);
        handler.set_state(HandlerState::Running);

        crate::metrics::record_startup_total(startup_start.elapsed());
        info!(
            pending = handler.queue.stats().pending,
            dead_lettered = handler.queue.stats().dead_lettered,
            elapsed_ms = startup_start.elapsed().as_millis() as u64,
            "Data handler running"
        );
        Ok(handler)
    }

    /// Stop the worker, make a last delivery pass over due items and close.
    ///
    /// Items that could not be delivered stay persisted and are picked up
    /// by the next [`DataHandler::initialize`] over the same local store.
    /// Idempotent.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        let first = self.state.send_if_modified(|state| {
            if state.is_open() {
                *state = HandlerState::ShuttingDown;
                true
            } else {
                false
            }
        });
        if !first {
            return;
        }
        crate::metrics::set_handler_state("ShuttingDown");
        let shutdown_start = Instant::now();
        info!("Initiating data handler shutdown...");

        let _ = self.shutdown_tx.send(true);
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "Background worker ended abnormally");
            }
        }

        // Serialize with any write still in progress
        let _writer = self.writer.lock().await;
        let report = self.drain_pass(false).await;
        if let Err(e) = self.storage.checkpoint().await {
            warn!(error = %e, "Local storage checkpoint failed");
        }
        self.health.sample();
        self.set_state(HandlerState::Closed);

        let stats = self.queue.stats();
        info!(
            delivered = report.delivered.len(),
            pending = stats.pending,
            dead_lettered = stats.dead_lettered,
            elapsed_ms = shutdown_start.elapsed().as_millis() as u64,
            "Data handler shutdown complete"
        );
    }
}

/// Background maintenance loop. Holds only a `Weak` so dropping the last
/// handle is enough to stop it.
fn spawn_worker(handler: &Arc<DataHandler>) -> tokio::task::JoinHandle<()> {
    let weak: Weak<DataHandler> = Arc::downgrade(handler);
    let mut shutdown_rx = handler.shutdown_tx.subscribe();
    let sync_every = handler.config.sync_interval();
    let health_every = handler.config.health_interval();

    tokio::spawn(async move {
        if let Some(handler) = weak.upgrade() {
            handler.startup_migration().await;
        }

        let mut sync_interval = tokio::time::interval(sync_every);
        sync_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut health_interval = tokio::time::interval(health_every);
        health_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }

                _ = sync_interval.tick() => {
                    let Some(handler) = weak.upgrade() else { break };
                    handler.sync_tick().await;
                }

                _ = health_interval.tick() => {
                    let Some(handler) = weak.upgrade() else { break };
                    handler.health.sample();
                }
            }
        }
        debug!("Data handler worker stopped");
    })
}

impl DataHandler {
    async fn startup_migration(&self) {
        match self.migrate_if_needed().await {
            Ok(report) if !report.is_empty() => {
                info!(
                    migrated = report.migrated.len(),
                    conflicts = report.conflicts.len(),
                    "Legacy records migrated at startup"
                );
            }
            Ok(_) => debug!("No legacy records to migrate"),
            Err(e) => warn!(error = %e, "Startup migration failed, namespaces will migrate on first access"),
        }
    }
}
