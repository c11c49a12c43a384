//! Storage adapters for the remote and local tiers.
//!
//! - [`traits`]: the [`StorageAdapter`](traits::StorageAdapter) and
//!   [`RemoteAdapter`](traits::RemoteAdapter) contracts
//! - [`memory`]: bounded in-memory local store and in-process remote
//! - [`sql`]: SQLite local durable store
//! - [`redis`]: Redis remote store

pub mod traits;
pub mod memory;
pub mod sql;
pub mod redis;
