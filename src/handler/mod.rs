// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Data handler.
//!
//! The [`DataHandler`] is the single entry point that ties the tiers
//! together:
//! - memory cache ([`CacheLayer`]) for hot reads
//! - remote store behind a circuit breaker, written asynchronously through
//!   the durable [`SyncQueue`]
//! - local store, the durable fallback that also holds the queue and the
//!   migration ledger
//!
//! # Lifecycle
//!
//! ```text
//! Created → Initializing → Ready → Running → ShuttingDown → Closed
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use data_handler::{DataHandler, HandlerConfig, HandlerState};
//! use data_handler::storage::memory::{InMemoryRemote, InMemoryStorage};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let handler = DataHandler::initialize(
//!     HandlerConfig::default(),
//!     Arc::new(InMemoryStorage::new()),
//!     Arc::new(InMemoryRemote::new()),
//! )
//! .await
//! .expect("init failed");
//!
//! assert_eq!(handler.state(), HandlerState::Running);
//! handler.set("profile", "user_1", &42).await.unwrap();
//! assert_eq!(handler.get::<i32>("profile", "user_1").await.unwrap(), Some(42));
//!
//! handler.shutdown().await;
//! # }
//! ```

mod types;
mod api;
mod lifecycle;
mod flush;

pub use types::{HandlerError, HandlerState, InitError};

use std::sync::Arc;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::cache::CacheLayer;
use crate::config::HandlerConfig;
use crate::events::EventBus;
use crate::health::HealthMonitor;
use crate::migration::MigrationEngine;
use crate::performance::PerformanceTracker;
use crate::resilience::circuit_breaker::CircuitBreaker;
use crate::resilience::sync_queue::SyncQueue;
use crate::storage::traits::{RemoteAdapter, StorageAdapter};

/// Tiered data handler.
///
/// Reads go cache → remote → local, writes go cache → local → sync queue.
/// The remote tier is only ever touched through the circuit breaker, with
/// every call bounded by `remote_timeout_ms`.
///
/// # Thread Safety
///
/// The handler is `Send + Sync` and is shared as `Arc<DataHandler>`.
/// Writes (`set`/`clear`) are serialized; reads run concurrently.
pub struct DataHandler {
    pub(super) config: HandlerConfig,

    /// Handler state (broadcast to watchers)
    pub(super) state: watch::Sender<HandlerState>,
    pub(super) state_rx: watch::Receiver<HandlerState>,

    pub(super) cache: CacheLayer,
    pub(super) storage: Arc<dyn StorageAdapter>,
    pub(super) remote: Arc<dyn RemoteAdapter>,

    /// Guards every remote call, reads and queue deliveries alike
    pub(super) breaker: Arc<CircuitBreaker>,
    pub(super) queue: Arc<SyncQueue>,
    pub(super) migration: MigrationEngine,

    pub(super) tracker: Arc<PerformanceTracker>,
    pub(super) health: HealthMonitor,
    pub(super) events: EventBus,

    /// Single writer: held for the whole of each set/clear
    pub(super) writer: Mutex<()>,

    /// Tells the background worker to stop
    pub(super) shutdown_tx: watch::Sender<bool>,
    pub(super) worker: SyncMutex<Option<JoinHandle<()>>>,
}

impl DataHandler {
    /// Get current handler state.
    #[must_use]
    pub fn state(&self) -> HandlerState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<HandlerState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == HandlerState::Running
    }

    #[must_use]
    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    pub(super) fn set_state(&self, state: HandlerState) {
        let _ = self.state.send(state);
        crate::metrics::set_handler_state(&state.to_string());
    }

    pub(super) fn ensure_open(&self) -> Result<(), HandlerError> {
        if self.state().is_open() {
            Ok(())
        } else {
            Err(HandlerError::Closed)
        }
    }
}

impl Drop for DataHandler {
    fn drop(&mut self) {
        // Worker only holds a Weak, but don't leave it sleeping until the next tick
        let _ = self.shutdown_tx.send(true);
    }
}
