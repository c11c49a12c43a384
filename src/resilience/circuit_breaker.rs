// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker guarding calls to the remote tier.
//!
//! Provides protection against cascading failures when the remote store is
//! unhealthy. Callers either wrap an operation with [`CircuitBreaker::call`]
//! or, when the outcome must be classified by hand, take a [`Permit`] and
//! resolve it.
//!
//! States:
//! - Closed: Normal operation, requests pass through. Each failure bumps the
//!   failure count, each success resets it. Reaching the threshold trips the
//!   breaker.
//! - Open: Requests fail fast without touching the network until the
//!   cooldown since the last failure has elapsed.
//! - HalfOpen: Exactly one trial request is let through. Success closes the
//!   breaker, failure re-opens it with a fresh cooldown.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::events::{EventBus, HandlerEvent};

/// Circuit breaker state for metrics/monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Error type for circuit-protected operations
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit breaker rejected the call (circuit is open)
    #[error("circuit breaker open, request rejected")]
    Rejected,

    /// The underlying operation failed
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitConfig {
    /// Number of consecutive failures to trip the circuit
    pub failure_threshold: u32,
    /// How long to stay open before letting a trial call through
    pub cooldown: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Aggressive config for critical paths (trips faster, recovers cautiously)
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
        }
    }

    /// Lenient config for less critical paths (tolerates more failures)
    #[must_use]
    pub fn lenient() -> Self {
        Self {
            failure_threshold: 10,
            cooldown: Duration::from_secs(15),
        }
    }

    /// Fast recovery for testing
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            failure_threshold: 2,
            cooldown: Duration::from_millis(50),
        }
    }
}

/// Point-in-time view of a breaker, safe to hand to readers.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u64,
    pub threshold: u32,
    pub cooldown_ms: u64,
    /// Epoch millis of the failure that last (re)opened the breaker
    pub last_failure_at: Option<i64>,
    pub calls_total: u64,
    pub failures: u64,
    pub rejections: u64,
    /// Failures over admitted calls since the last reset
    pub failure_rate: f64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u64,
    last_failure_at: Option<Instant>,
    last_failure_ms: Option<i64>,
    trial_in_flight: bool,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
            last_failure_ms: None,
            trial_in_flight: false,
        }
    }
}

/// A named circuit breaker with metrics tracking
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    inner: Mutex<BreakerState>,
    events: Option<EventBus>,

    // Metrics
    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

/// Admission to make one guarded call.
///
/// Resolve with [`Permit::success`] or [`Permit::failure`]. A permit dropped
/// unresolved (e.g. the caller's future was cancelled mid-call) counts as a
/// failure, so a half-open trial can never be leaked.
#[must_use = "an unresolved permit counts as a failure"]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    resolved: bool,
}

impl Permit<'_> {
    /// Whether this permit is the single half-open trial.
    #[must_use]
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.on_success(self.trial);
    }

    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            self.breaker.on_failure(self.trial);
        }
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and config
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let name = name.into();
        crate::metrics::set_circuit_state(&name, CircuitState::Closed as u8);
        Self {
            name,
            config,
            inner: Mutex::new(BreakerState::closed()),
            events: None,
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    /// Create with default config
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitConfig::default())
    }

    /// Emit `circuit-opened` / `circuit-closed` on the given bus.
    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Get the circuit breaker name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Current state. An open breaker whose cooldown has elapsed reports
    /// `HalfOpen`, since the next call would be admitted as the trial.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Open if self.cooldown_elapsed(&inner) => CircuitState::HalfOpen,
            state => state,
        }
    }

    fn cooldown_elapsed(&self, inner: &BreakerState) -> bool {
        inner
            .last_failure_at
            .map_or(true, |at| at.elapsed() >= self.config.cooldown)
    }

    /// Ask for admission. `None` means the call must not be attempted.
    pub fn try_acquire(&self) -> Option<Permit<'_>> {
        self.calls_total.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        let current = inner.state;

        let trial = match current {
            CircuitState::Closed => false,
            CircuitState::Open => {
                if !self.cooldown_elapsed(&inner) {
                    drop(inner);
                    self.reject();
                    return None;
                }
                info!(circuit = %self.name, "Circuit cooldown elapsed, admitting trial call");
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                crate::metrics::set_circuit_state(&self.name, CircuitState::HalfOpen as u8);
                true
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    drop(inner);
                    self.reject();
                    return None;
                }
                inner.trial_in_flight = true;
                true
            }
        };

        Some(Permit {
            breaker: self,
            trial,
            resolved: false,
        })
    }

    fn reject(&self) {
        self.rejections.fetch_add(1, Ordering::Relaxed);
        debug!(circuit = %self.name, "Circuit breaker rejected call (open)");
        crate::metrics::record_circuit_call(&self.name, "rejected");
    }

    /// Only the half-open trial may close a tripped breaker. A success from
    /// a permit issued before the trip is counted but changes nothing.
    fn on_success(&self, trial: bool) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_circuit_call(&self.name, "success");

        let closed = {
            let mut inner = self.inner.lock();
            inner.success_count += 1;
            match inner.state {
                CircuitState::Closed => {
                    inner.failure_count = 0;
                    false
                }
                _ if trial => {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.trial_in_flight = false;
                    inner.last_failure_at = None;
                    true
                }
                _ => false,
            }
        };

        if closed {
            info!(circuit = %self.name, "Circuit closed after successful trial");
            self.transitioned(CircuitState::Closed);
        }
    }

    fn on_failure(&self, trial: bool) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_circuit_call(&self.name, "failure");

        let opened = {
            let mut inner = self.inner.lock();
            if !trial && inner.state != CircuitState::Closed {
                // Admitted before the trip; from here only the trial decides
                return;
            }
            inner.failure_count = inner.failure_count.saturating_add(1);
            let trip = match inner.state {
                CircuitState::Closed => inner.failure_count >= self.config.failure_threshold,
                CircuitState::HalfOpen | CircuitState::Open => true,
            };
            inner.last_failure_at = Some(Instant::now());
            inner.last_failure_ms = Some(crate::now_millis());
            if trip {
                inner.state = CircuitState::Open;
                inner.trial_in_flight = false;
            }
            trip.then_some(inner.failure_count)
        };

        if let Some(failure_count) = opened {
            warn!(
                circuit = %self.name,
                failure_count,
                cooldown_ms = self.config.cooldown.as_millis() as u64,
                "Circuit opened"
            );
            self.transitioned(CircuitState::Open);
        }
    }

    fn transitioned(&self, to: CircuitState) {
        crate::metrics::set_circuit_state(&self.name, to as u8);
        let Some(events) = &self.events else { return };
        match to {
            CircuitState::Open => events.emit(HandlerEvent::CircuitOpened {
                circuit: self.name.clone(),
            }),
            CircuitState::Closed => events.emit(HandlerEvent::CircuitClosed {
                circuit: self.name.clone(),
            }),
            CircuitState::HalfOpen => {}
        }
    }

    /// Execute an async operation through the circuit breaker
    ///
    /// Takes a closure that returns a Future, allowing lazy evaluation: when
    /// the breaker rejects, the closure is never invoked.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire().ok_or(CircuitError::Rejected)?;
        match f().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                permit.failure();
                Err(CircuitError::Inner(e))
            }
        }
    }

    /// Operator override: force the breaker closed and clear its counters.
    pub fn reset(&self) {
        let was = {
            let mut inner = self.inner.lock();
            let was = inner.state;
            *inner = BreakerState::closed();
            was
        };
        self.reset_metrics();
        info!(circuit = %self.name, from = %was, "Circuit reset by operator");
        if was != CircuitState::Closed {
            self.transitioned(CircuitState::Closed);
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        let state = self.state();
        let inner = self.inner.lock();
        CircuitSnapshot {
            name: self.name.clone(),
            state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            threshold: self.config.failure_threshold,
            cooldown_ms: self.config.cooldown.as_millis() as u64,
            last_failure_at: inner.last_failure_ms,
            calls_total: self.calls_total(),
            failures: self.failures(),
            rejections: self.rejections(),
            failure_rate: self.failure_rate(),
        }
    }

    /// Get total number of calls (admitted or rejected)
    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    /// Get number of successful calls
    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Get number of failed calls (operation errors)
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Get number of rejected calls (circuit open)
    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Failures over admitted calls (0.0 - 1.0)
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let attempted = self.successes() + self.failures();
        if attempted == 0 {
            return 0.0;
        }
        self.failures() as f64 / attempted as f64
    }

    fn reset_metrics(&self) {
        self.calls_total.store(0, Ordering::Relaxed);
        self.successes.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.rejections.store(0, Ordering::Relaxed);
    }
}
