//! Failure isolation and eventual delivery.
//!
//! - [`circuit_breaker`]: CLOSED / OPEN / HALF_OPEN guard for remote calls
//! - [`retry`]: startup retry and exponential backoff with jitter
//! - [`sync_queue`]: durable queue of pending remote writes with dead-lettering

pub mod circuit_breaker;
pub mod retry;
pub mod sync_queue;
