//! Rolling latency windows per operation.
//!
//! The tracker is purely observational: [`PerformanceTracker::track`] hands
//! back the wrapped future's result untouched, error or not.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Sample {
    latency: Duration,
    ok: bool,
}

#[derive(Debug, Default)]
struct OpWindow {
    samples: VecDeque<Sample>,
    count: u64,
    errors: u64,
}

/// Latency summary of one operation. Percentiles cover the rolling window,
/// counts cover the tracker's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyStats {
    pub count: u64,
    pub errors: u64,
    pub window: usize,
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub operation_count: u64,
    pub per_operation: BTreeMap<String, LatencyStats>,
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Nearest-rank percentile over sorted samples.
fn percentile(sorted: &[Duration], pct: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

pub struct PerformanceTracker {
    /// Label used for the exported metrics
    scope: &'static str,
    window: usize,
    ops: Mutex<HashMap<&'static str, OpWindow>>,
    operation_count: AtomicU64,
}

impl PerformanceTracker {
    #[must_use]
    pub fn new(scope: &'static str, window: usize) -> Self {
        Self {
            scope,
            window: window.max(1),
            ops: Mutex::new(HashMap::new()),
            operation_count: AtomicU64::new(0),
        }
    }

    /// Time `fut` under `operation`; the result passes through unchanged.
    pub async fn track<Fut, T, E>(&self, operation: &'static str, fut: Fut) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let start = Instant::now();
        let result = fut.await;
        self.record(operation, start.elapsed(), result.is_ok());
        result
    }

    pub fn record(&self, operation: &'static str, latency: Duration, ok: bool) {
        self.operation_count.fetch_add(1, Ordering::Relaxed);
        {
            let mut ops = self.ops.lock();
            let window = ops.entry(operation).or_default();
            window.count += 1;
            if !ok {
                window.errors += 1;
            }
            if window.samples.len() == self.window {
                window.samples.pop_front();
            }
            window.samples.push_back(Sample { latency, ok });
        }

        crate::metrics::record_latency(self.scope, operation, latency);
        crate::metrics::record_operation(self.scope, operation, if ok { "success" } else { "error" });
    }

    #[must_use]
    pub fn operation_count(&self) -> u64 {
        self.operation_count.load(Ordering::Relaxed)
    }

    /// Share of failed calls across every operation's window.
    #[must_use]
    pub fn error_rate(&self) -> f64 {
        let ops = self.ops.lock();
        let (total, errors) = ops.values().flat_map(|w| w.samples.iter()).fold(
            (0usize, 0usize),
            |(total, errors), s| (total + 1, errors + usize::from(!s.ok)),
        );
        if total == 0 {
            0.0
        } else {
            errors as f64 / total as f64
        }
    }

    /// Mean latency across every operation's window.
    #[must_use]
    pub fn average_latency_ms(&self) -> f64 {
        let ops = self.ops.lock();
        let (total, sum) = ops
            .values()
            .flat_map(|w| w.samples.iter())
            .fold((0usize, Duration::ZERO), |(n, sum), s| (n + 1, sum + s.latency));
        if total == 0 {
            0.0
        } else {
            millis(sum) / total as f64
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> PerformanceMetrics {
        let ops = self.ops.lock();
        let per_operation = ops
            .iter()
            .map(|(name, window)| {
                let mut sorted: Vec<Duration> = window.samples.iter().map(|s| s.latency).collect();
                sorted.sort_unstable();
                let sum: Duration = sorted.iter().sum();
                let stats = LatencyStats {
                    count: window.count,
                    errors: window.errors,
                    window: sorted.len(),
                    min_ms: sorted.first().copied().map_or(0.0, millis),
                    max_ms: sorted.last().copied().map_or(0.0, millis),
                    avg_ms: if sorted.is_empty() { 0.0 } else { millis(sum) / sorted.len() as f64 },
                    p50_ms: millis(percentile(&sorted, 50.0)),
                    p95_ms: millis(percentile(&sorted, 95.0)),
                    p99_ms: millis(percentile(&sorted, 99.0)),
                };
                ((*name).to_string(), stats)
            })
            .collect();

        PerformanceMetrics {
            operation_count: self.operation_count(),
            per_operation,
        }
    }

    pub fn reset(&self) {
        self.ops.lock().clear();
        self.operation_count.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_track_passes_result_through() {
        let tracker = PerformanceTracker::new("test", 16);

        let ok: Result<i32, &str> = tracker.track("get", async { Ok(7) }).await;
        let err: Result<i32, &str> = tracker.track("get", async { Err("nope") }).await;

        assert_eq!(ok, Ok(7));
        assert_eq!(err, Err("nope"));
        let metrics = tracker.snapshot();
        assert_eq!(metrics.operation_count, 2);
        assert_eq!(metrics.per_operation["get"].errors, 1);
    }

    #[test]
    fn test_percentiles() {
        let tracker = PerformanceTracker::new("test", 100);
        for ms in 1..=100 {
            tracker.record("set", Duration::from_millis(ms), true);
        }

        let stats = &tracker.snapshot().per_operation["set"];
        assert_eq!(stats.count, 100);
        assert!((stats.min_ms - 1.0).abs() < 1e-9);
        assert!((stats.max_ms - 100.0).abs() < 1e-9);
        assert!((stats.p50_ms - 50.0).abs() < 1e-9);
        assert!((stats.p95_ms - 95.0).abs() < 1e-9);
        assert!((stats.p99_ms - 99.0).abs() < 1e-9);
        assert!((stats.avg_ms - 50.5).abs() < 1e-9);
    }

    #[test]
    fn test_window_rolls() {
        let tracker = PerformanceTracker::new("test", 3);
        for ms in [100, 1, 2, 3] {
            tracker.record("get", Duration::from_millis(ms), true);
        }

        let stats = &tracker.snapshot().per_operation["get"];
        assert_eq!(stats.count, 4);
        assert_eq!(stats.window, 3);
        assert!((stats.max_ms - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_error_rate_over_window() {
        let tracker = PerformanceTracker::new("test", 4);
        assert_eq!(tracker.error_rate(), 0.0);

        tracker.record("get", Duration::from_millis(1), false);
        tracker.record("get", Duration::from_millis(1), true);
        tracker.record("set", Duration::from_millis(3), true);
        tracker.record("set", Duration::from_millis(3), false);

        assert!((tracker.error_rate() - 0.5).abs() < 1e-9);
        assert!((tracker.average_latency_ms() - 2.0).abs() < 1e-9);

        tracker.reset();
        assert_eq!(tracker.operation_count(), 0);
        assert!(tracker.snapshot().per_operation.is_empty());
    }
}
