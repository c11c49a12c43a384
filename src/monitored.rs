//! Monitoring by composition.
//!
//! A component that talks to a failure-prone dependency holds a
//! `Monitored<T>` instead of the bare `T`. Every call made through
//! [`Monitored::call`] is guarded by the wrapper's own circuit breaker and
//! timed by its own performance tracker, and [`Monitored::health`] scores
//! the pair.
//!
//! # Example
//!
//! ```
//! use data_handler::monitored::Monitored;
//! use data_handler::resilience::circuit_breaker::CircuitConfig;
//!
//! # tokio_test_block(async {
//! struct Scoreboard { points: u32 }
//!
//! let board = Monitored::new("scoreboard", Scoreboard { points: 3 }, CircuitConfig::default());
//! let points = board
//!     .call("read", |b| async move { Ok::<_, std::io::Error>(b.points) })
//!     .await
//!     .unwrap();
//! assert_eq!(points, 3);
//! assert_eq!(board.performance().operation_count, 1);
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

use std::future::Future;
use std::sync::Arc;

use crate::events::EventBus;
use crate::health::{HealthMonitor, HealthSnapshot};
use crate::performance::{PerformanceMetrics, PerformanceTracker};
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitSnapshot};

const DEFAULT_LATENCY_WINDOW: usize = 256;

pub struct Monitored<T> {
    inner: T,
    breaker: Arc<CircuitBreaker>,
    tracker: Arc<PerformanceTracker>,
    health: HealthMonitor,
}

impl<T> Monitored<T> {
    pub fn new(name: impl Into<String>, inner: T, config: CircuitConfig) -> Self {
        Self::build(name.into(), inner, config, None, DEFAULT_LATENCY_WINDOW)
    }

    /// Same as [`Monitored::new`], with breaker transitions published on
    /// `events` and a custom latency window.
    pub fn with_events(
        name: impl Into<String>,
        inner: T,
        config: CircuitConfig,
        events: EventBus,
        latency_window: usize,
    ) -> Self {
        Self::build(name.into(), inner, config, Some(events), latency_window)
    }

    fn build(
        name: String,
        inner: T,
        config: CircuitConfig,
        events: Option<EventBus>,
        latency_window: usize,
    ) -> Self {
        let mut breaker = CircuitBreaker::new(name.clone(), config);
        if let Some(events) = events {
            breaker = breaker.with_events(events);
        }
        let breaker = Arc::new(breaker);
        let tracker = Arc::new(PerformanceTracker::new("monitored", latency_window));
        let health = HealthMonitor::new(name, breaker.clone(), tracker.clone(), None);
        Self {
            inner,
            breaker,
            tracker,
            health,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.breaker.name()
    }

    /// Direct, unmonitored access to the wrapped component.
    #[must_use]
    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Run `f` against the component behind the breaker, timed as `operation`.
    pub async fn call<'a, F, Fut, R, E>(
        &'a self,
        operation: &'static str,
        f: F,
    ) -> Result<R, CircuitError<E>>
    where
        F: FnOnce(&'a T) -> Fut,
        Fut: Future<Output = Result<R, E>> + 'a,
    {
        let inner = &self.inner;
        self.tracker
            .track(operation, self.breaker.call(|| f(inner)))
            .await
    }

    /// Take a fresh health sample.
    pub fn health(&self) -> Arc<HealthSnapshot> {
        self.health.sample()
    }

    #[must_use]
    pub fn performance(&self) -> PerformanceMetrics {
        self.tracker.snapshot()
    }

    #[must_use]
    pub fn circuit(&self) -> CircuitSnapshot {
        self.breaker.snapshot()
    }

    pub fn reset_circuit(&self) {
        self.breaker.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthStatus;
    use crate::resilience::circuit_breaker::CircuitState;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct Flaky {
        calls: AtomicU32,
        fail: bool,
    }

    impl Flaky {
        async fn fetch(&self) -> Result<u32, &'static str> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                Err("unavailable")
            } else {
                Ok(n)
            }
        }
    }

    #[tokio::test]
    async fn test_call_passes_through() {
        let monitored = Monitored::new(
            "flaky",
            Flaky { calls: AtomicU32::new(0), fail: false },
            CircuitConfig::default(),
        );

        let value = monitored.call("fetch", |f| f.fetch()).await.unwrap();

        assert_eq!(value, 1);
        assert_eq!(monitored.performance().per_operation["fetch"].count, 1);
        assert_eq!(monitored.health().status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_breaker_isolates_failing_component() {
        let monitored = Monitored::new(
            "flaky",
            Flaky { calls: AtomicU32::new(0), fail: true },
            CircuitConfig { failure_threshold: 2, cooldown: Duration::from_secs(60) },
        );

        for _ in 0..5 {
            let _ = monitored.call("fetch", |f| f.fetch()).await;
        }

        // Only the two calls before the trip reached the component
        assert_eq!(monitored.inner().calls.load(Ordering::SeqCst), 2);
        assert_eq!(monitored.circuit().state, CircuitState::Open);
        assert_eq!(monitored.circuit().rejections, 3);
        assert_eq!(monitored.health().status, HealthStatus::Unhealthy);

        monitored.reset_circuit();
        assert_eq!(monitored.circuit().state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_events_published() {
        let events = EventBus::new(8);
        let mut rx = events.subscribe();
        let monitored = Monitored::with_events(
            "flaky",
            Flaky { calls: AtomicU32::new(0), fail: true },
            CircuitConfig { failure_threshold: 1, cooldown: Duration::from_secs(60) },
            events,
            8,
        );

        let _ = monitored.call("fetch", |f| f.fetch()).await;

        assert_eq!(rx.recv().await.unwrap().name(), "circuit-opened");
    }
}
