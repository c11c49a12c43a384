//! # Data Handler
//!
//! Tiered key/value persistence for JSON values, with a remote store that
//! may be slow, flaky or gone, and a local store that is always there.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Public API                          │
//! │  • get / set / clear on namespace.field keys               │
//! │  • flush, migrate_if_needed, health, metrics, events       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Cache: In-Memory                        │
//! │  • DashMap with LRU eviction and optional TTL              │
//! │  • Dirty flag until the remote confirms the write          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!              (reads: breaker-guarded, time-bounded)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Remote: RemoteAdapter                    │
//! │  • Redis or any other shared store                         │
//! │  • Written only by the sync queue, debounced per key       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                   (fallback, always written)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Local: StorageAdapter                    │
//! │  • SQLite or in-memory                                     │
//! │  • data:, queue:pending:, queue:dead:, migration: records  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use data_handler::{DataHandler, HandlerConfig};
//! use data_handler::storage::redis::RedisRemote;
//! use data_handler::storage::sql::SqliteStorage;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     let storage = SqliteStorage::open("./data_handler.db").await.expect("local store");
//!     let remote = RedisRemote::new("redis://localhost:6379").await.expect("remote store");
//!
//!     let handler = DataHandler::initialize(
//!         HandlerConfig::default(),
//!         Arc::new(storage),
//!         Arc::new(remote),
//!     )
//!     .await
//!     .expect("Failed to initialize");
//!
//!     // Durable locally as soon as this returns
//!     handler.set("profile", "user_1", &json!({"name": "Ada"})).await.unwrap();
//!
//!     // Cache → remote → local
//!     let profile: Option<serde_json::Value> = handler.get("profile", "user_1").await.unwrap();
//!     println!("{profile:?}");
//!
//!     handler.shutdown().await;
//! }
//! ```
//!
//! ## Features
//!
//! - **Tiered Reads**: cache → remote → local, only total failure is an error
//! - **Durable Writes**: local write before returning, remote write queued
//! - **Sync Queue**: persisted, coalescing, backoff with jitter, dead letters
//! - **Circuit Breaker**: one breaker guards every remote call
//! - **Legacy Migration**: `namespace_field` records imported once, lazily
//! - **Health & Performance**: 0-100 score, rolling latency percentiles
//!
//! ## Configuration
//!
//! See [`HandlerConfig`] for all configuration options.
//!
//! ## Modules
//!
//! - [`handler`]: The main [`DataHandler`] orchestrating all components
//! - [`storage`]: Storage adapters (SQLite, Redis, memory)
//! - [`cache`]: In-memory cache tier
//! - [`resilience`]: Circuit breaker, retry/backoff, sync queue
//! - [`migration`]: Legacy key migration
//! - [`health`], [`performance`], [`monitored`]: Observability

pub mod config;
pub mod key;
pub mod events;
pub mod storage;
pub mod cache;
pub mod resilience;
pub mod migration;
pub mod performance;
pub mod health;
pub mod monitored;
pub mod handler;
pub mod metrics;

pub use config::{ConfigError, HandlerConfig};
pub use handler::{DataHandler, HandlerError, HandlerState, InitError};
pub use key::{KeyError, StorageKey};
pub use events::{EventBus, HandlerEvent, Tier};
pub use storage::traits::{RemoteAdapter, StorageAdapter, StorageError};
pub use cache::{CacheLayer, CacheStats};
pub use resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitState};
pub use resilience::sync_queue::{DrainReport, SyncOp, SyncQueueItem, SyncQueueStats};
pub use migration::MigrationReport;
pub use health::{HealthSnapshot, HealthStatus};
pub use performance::PerformanceMetrics;
pub use monitored::Monitored;
pub use metrics::LatencyTimer;

/// Wall-clock epoch milliseconds, used for persisted timestamps.
#[must_use]
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
