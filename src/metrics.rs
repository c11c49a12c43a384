// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the data handler.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding application is responsible for choosing the exporter
//! (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `data_handler_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `tier`: cache, remote, local
//! - `operation`: get, set, clear, put, delete, migrate, sync
//! - `status`: success, error, rejected, miss

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record the outcome of a tier operation
pub fn record_operation(tier: &str, operation: &str, status: &str) {
    counter!(
        "data_handler_operations_total",
        "tier" => tier.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(tier: &str, operation: &str, duration: Duration) {
    histogram!(
        "data_handler_operation_seconds",
        "tier" => tier.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// ERROR TRACKING - Categorized error counters for alerting
// ═══════════════════════════════════════════════════════════════════════════

/// Record an error with category for alerting
pub fn record_error(tier: &str, operation: &str, error_type: &str) {
    counter!(
        "data_handler_errors_total",
        "tier" => tier.to_string(),
        "operation" => operation.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Record a remote call abandoned after the configured timeout
pub fn record_timeout(tier: &str, operation: &str) {
    counter!(
        "data_handler_timeouts_total",
        "tier" => tier.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record a quota-exceeded condition on a tier
pub fn record_quota_exceeded(tier: &str) {
    counter!(
        "data_handler_quota_exceeded_total",
        "tier" => tier.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// CACHE - Memory tier occupancy
// ═══════════════════════════════════════════════════════════════════════════

/// Record a cache lookup
pub fn record_cache_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    counter!(
        "data_handler_cache_lookups_total",
        "result" => result
    )
    .increment(1);
}

/// Set current cache entry count
pub fn set_cache_entries(count: usize) {
    gauge!("data_handler_cache_entries").set(count as f64);
}

/// Record eviction of `count` entries from a tier
pub fn record_eviction(tier: &str, count: usize) {
    counter!(
        "data_handler_evictions_total",
        "tier" => tier.to_string()
    )
    .increment(count as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// SYNC QUEUE - Pending work
// ═══════════════════════════════════════════════════════════════════════════

/// Set sync queue depths
pub fn set_queue_depth(pending: usize, dead_lettered: usize) {
    gauge!("data_handler_sync_queue_pending").set(pending as f64);
    gauge!("data_handler_sync_queue_dead_lettered").set(dead_lettered as f64);
}

/// Record one delivery attempt of a queued operation
pub fn record_sync_delivery(op: &str, outcome: &str) {
    counter!(
        "data_handler_sync_deliveries_total",
        "op" => op.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record writes that were folded into an existing queue item
pub fn record_coalesced() {
    counter!("data_handler_sync_coalesced_total").increment(1);
}

/// Record an item moved to the dead-letter list
pub fn record_dead_letter() {
    counter!("data_handler_sync_dead_lettered_total").increment(1);
}

/// Record a full drain duration
pub fn record_flush_duration(duration: Duration) {
    histogram!("data_handler_flush_seconds").record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// CIRCUIT BREAKER - Resilience metrics
// ═══════════════════════════════════════════════════════════════════════════

/// Record circuit breaker state change (0 = closed, 1 = half-open, 2 = open)
pub fn set_circuit_state(circuit: &str, state: u8) {
    gauge!(
        "data_handler_circuit_breaker_state",
        "circuit" => circuit.to_string()
    )
    .set(state as f64);
}

/// Record circuit breaker call outcome
pub fn record_circuit_call(circuit: &str, outcome: &str) {
    counter!(
        "data_handler_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// HEALTH / LIFECYCLE
// ═══════════════════════════════════════════════════════════════════════════

/// Set the latest health score (0 - 100)
pub fn set_health_score(monitor: &str, score: u8) {
    gauge!(
        "data_handler_health_score",
        "monitor" => monitor.to_string()
    )
    .set(score as f64);
}

/// Record a migration outcome (migrated, conflict, skipped)
pub fn record_migration(outcome: &str) {
    counter!(
        "data_handler_migrations_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record total startup time
pub fn record_startup_total(duration: Duration) {
    histogram!("data_handler_startup_seconds").record(duration.as_secs_f64());
}

/// Track handler state transitions
pub fn set_handler_state(state: &str) {
    counter!(
        "data_handler_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    tier: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(tier: &'static str, operation: &'static str) -> Self {
        Self {
            tier,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.tier, self.operation, self.start.elapsed());
    }
}
