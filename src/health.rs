// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Health scoring.
//!
//! A [`HealthMonitor`] reads its circuit breaker, performance tracker and
//! (optionally) a sync queue, and folds them into a 0-100 score:
//!
//! | input | effect |
//! |---|---|
//! | circuit `OPEN` | score capped at 25 |
//! | circuit `HALF_OPEN` | -30 |
//! | pending queue items | -0.5 each, at most -30 |
//! | dead-lettered items | -10 each, at most -40 |
//! | recent error rate | -40 × rate |
//!
//! Snapshots are immutable. Each sample builds a new one and swaps it in, so
//! readers holding an older `Arc<HealthSnapshot>` are never disturbed.

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::performance::PerformanceTracker;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::resilience::sync_queue::SyncQueue;

/// Health status derived from the score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Score 80 and above
    Healthy,
    /// Score 50 to 79
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    #[must_use]
    pub fn from_score(score: u8) -> Self {
        match score {
            80.. => Self::Healthy,
            50..=79 => Self::Degraded,
            _ => Self::Unhealthy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub circuit_state: CircuitState,
    /// Pending (not dead-lettered) queue items
    pub queue_depth: usize,
    pub dead_letters: usize,
    pub error_rate: f64,
    pub average_latency_ms: f64,
    pub score: u8,
    pub status: HealthStatus,
    /// Epoch millis
    pub computed_at: i64,
}

/// Score from raw inputs; see the module docs for the weights.
#[must_use]
pub fn compute_score(state: CircuitState, pending: usize, dead: usize, error_rate: f64) -> u8 {
    let mut score = 100.0_f64;
    score -= (pending as f64 * 0.5).min(30.0);
    score -= (dead as f64 * 10.0).min(40.0);
    score -= error_rate.clamp(0.0, 1.0) * 40.0;
    match state {
        CircuitState::Open => score = score.min(25.0),
        CircuitState::HalfOpen => score -= 30.0,
        CircuitState::Closed => {}
    }
    score.clamp(0.0, 100.0).round() as u8
}

pub struct HealthMonitor {
    name: String,
    breaker: Arc<CircuitBreaker>,
    tracker: Arc<PerformanceTracker>,
    queue: Option<Arc<SyncQueue>>,
    latest: RwLock<Arc<HealthSnapshot>>,
}

impl HealthMonitor {
    pub fn new(
        name: impl Into<String>,
        breaker: Arc<CircuitBreaker>,
        tracker: Arc<PerformanceTracker>,
        queue: Option<Arc<SyncQueue>>,
    ) -> Self {
        let monitor = Self {
            name: name.into(),
            breaker,
            tracker,
            queue,
            latest: RwLock::new(Arc::new(HealthSnapshot {
                circuit_state: CircuitState::Closed,
                queue_depth: 0,
                dead_letters: 0,
                error_rate: 0.0,
                average_latency_ms: 0.0,
                score: 100,
                status: HealthStatus::Healthy,
                computed_at: crate::now_millis(),
            })),
        };
        monitor.sample();
        monitor
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Compute a fresh snapshot and publish it.
    pub fn sample(&self) -> Arc<HealthSnapshot> {
        let circuit_state = self.breaker.state();
        let (queue_depth, dead_letters) = self.queue.as_ref().map_or((0, 0), |q| {
            let stats = q.stats();
            (stats.pending, stats.dead_lettered)
        });
        let error_rate = self.tracker.error_rate();
        let score = compute_score(circuit_state, queue_depth, dead_letters, error_rate);

        let snapshot = Arc::new(HealthSnapshot {
            circuit_state,
            queue_depth,
            dead_letters,
            error_rate,
            average_latency_ms: self.tracker.average_latency_ms(),
            score,
            status: HealthStatus::from_score(score),
            computed_at: crate::now_millis(),
        });

        let previous = std::mem::replace(&mut *self.latest.write(), snapshot.clone());
        if previous.status != snapshot.status {
            warn!(
                monitor = %self.name,
                from = ?previous.status,
                to = ?snapshot.status,
                score,
                "Health status changed"
            );
        } else {
            debug!(monitor = %self.name, score, "Health sampled");
        }
        crate::metrics::set_health_score(&self.name, score);
        snapshot
    }

    /// Most recent snapshot (never blocks on a sample in progress).
    #[must_use]
    pub fn latest(&self) -> Arc<HealthSnapshot> {
        self.latest.read().clone()
    }
}
