//! Resilience Metrics
//!
//! Lock-free counters for the resilience layer:
//! - Retry outcomes (retries, recoveries, exhaustion, cancellation)
//! - Circuit breaker trips and rejections
//! - Probe runs, failures and latency
//! - Alert and recovery activity

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;

// ============================================================================
// Histogram
// ============================================================================

/// Bucketed distribution of non-negative values
#[derive(Debug)]
pub struct Histogram {
    bounds: Vec<f64>,
    counts: Vec<AtomicU64>,
    total: AtomicU64,
    sum: AtomicU64,
    max: AtomicU64,
}

impl Histogram {
    /// Create with the given upper bucket bounds (ascending)
    #[must_use]
    pub fn new(bounds: Vec<f64>) -> Self {
        let counts = bounds.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            counts,
            total: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            max: AtomicU64::new(0),
        }
    }

    /// Millisecond buckets suited to probe latency
    #[must_use]
    pub fn latency_ms() -> Self {
        Self::new(vec![
            1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
        ])
    }

    /// Record a value; values past the last bound land in the last bucket
    pub fn record(&self, value: f64) {
        if self.bounds.is_empty() {
            return;
        }
        let value = value.max(0.0);
        let idx = self
            .bounds
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(self.bounds.len() - 1);

        self.counts[idx].fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value as u64, Ordering::Relaxed);
        self.max.fetch_max(value as u64, Ordering::Relaxed);
    }

    /// Point-in-time copy
    #[must_use]
    pub fn snapshot(&self) -> HistogramSnapshot {
        let counts: Vec<u64> = self.counts.iter().map(|c| c.load(Ordering::Relaxed)).collect();
        let total = self.total.load(Ordering::Relaxed);
        let sum = self.sum.load(Ordering::Relaxed);
        let mut snap = HistogramSnapshot {
            total,
            mean: if total > 0 { sum as f64 / total as f64 } else { 0.0 },
            max: self.max.load(Ordering::Relaxed),
            p50: 0.0,
            p90: 0.0,
            p99: 0.0,
        };
        snap.p50 = percentile(&self.bounds, &counts, total, 0.50);
        snap.p90 = percentile(&self.bounds, &counts, total, 0.90);
        snap.p99 = percentile(&self.bounds, &counts, total, 0.99);
        snap
    }
}

fn percentile(bounds: &[f64], counts: &[u64], total: u64, p: f64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let target = ((total as f64 * p).ceil() as u64).max(1);
    let mut cumulative = 0u64;
    for (bound, count) in bounds.iter().zip(counts) {
        cumulative += count;
        if cumulative >= target {
            return *bound;
        }
    }
    bounds.last().copied().unwrap_or(0.0)
}

/// Histogram summary
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct HistogramSnapshot {
    /// Sample count
    pub total: u64,
    /// Mean value
    pub mean: f64,
    /// Largest value seen
    pub max: u64,
    /// Median bucket bound
    pub p50: f64,
    /// 90th percentile bucket bound
    pub p90: f64,
    /// 99th percentile bucket bound
    pub p99: f64,
}

// ============================================================================
// Counter / Gauge
// ============================================================================

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Increment by one
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by `n`
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value
    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Value that can go up or down
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    /// Overwrite
    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    /// Current value
    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

// ============================================================================
// ResilienceMetrics
// ============================================================================

/// All counters the resilience layer maintains
#[derive(Debug)]
pub struct ResilienceMetrics {
    /// Backoff waits started
    pub retries: Counter,
    /// Operations that succeeded after at least one retry
    pub retry_recoveries: Counter,
    /// Operations that used every attempt
    pub retry_exhaustions: Counter,
    /// Operations aborted by cancellation
    pub retry_cancellations: Counter,
    /// Operations that ran out of their overall deadline
    pub retry_deadline_exceeded: Counter,
    /// Retries aborted because the health gate said no
    pub retry_health_aborts: Counter,
    /// Closed/half-open to open transitions
    pub breaker_trips: Counter,
    /// Calls rejected by an open breaker
    pub breaker_rejections: Counter,
    /// Probe executions
    pub probe_runs: Counter,
    /// Probes that raised, timed out or reported unhealthy
    pub probe_failures: Counter,
    /// Probe latency in milliseconds
    pub probe_latency: Histogram,
    /// Errors handled by the monitoring service
    pub errors_recorded: Counter,
    /// Alerts dispatched
    pub alerts_sent: Counter,
    /// Alerts withheld by the aggregator
    pub alerts_suppressed: Counter,
    /// Recovery strategies executed
    pub recoveries_attempted: Counter,
    /// Recovery strategies that reported success
    pub recoveries_succeeded: Counter,
    /// Currently unresolved alerts
    pub active_alerts: Gauge,
    per_service_failures: DashMap<String, Counter>,
    started_at: Instant,
}

impl ResilienceMetrics {
    /// Fresh, zeroed metrics
    #[must_use]
    pub fn new() -> Self {
        Self {
            retries: Counter::default(),
            retry_recoveries: Counter::default(),
            retry_exhaustions: Counter::default(),
            retry_cancellations: Counter::default(),
            retry_deadline_exceeded: Counter::default(),
            retry_health_aborts: Counter::default(),
            breaker_trips: Counter::default(),
            breaker_rejections: Counter::default(),
            probe_runs: Counter::default(),
            probe_failures: Counter::default(),
            probe_latency: Histogram::latency_ms(),
            errors_recorded: Counter::default(),
            alerts_sent: Counter::default(),
            alerts_suppressed: Counter::default(),
            recoveries_attempted: Counter::default(),
            recoveries_succeeded: Counter::default(),
            active_alerts: Gauge::default(),
            per_service_failures: DashMap::new(),
            started_at: Instant::now(),
        }
    }

    /// Count a failed probe against `service`
    pub fn record_probe_failure(&self, service: &str) {
        self.probe_failures.inc();
        self.per_service_failures
            .entry(service.to_string())
            .or_default()
            .inc();
    }

    /// Failed probe count for one service
    #[must_use]
    pub fn probe_failures_for(&self, service: &str) -> u64 {
        self.per_service_failures.get(service).map_or(0, |c| c.get())
    }

    /// Serializable copy of every counter
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut probe_failures_by_service: Vec<(String, u64)> = self
            .per_service_failures
            .iter()
            .map(|e| (e.key().clone(), e.value().get()))
            .collect();
        probe_failures_by_service.sort();

        MetricsSnapshot {
            uptime_secs: self.started_at.elapsed().as_secs(),
            retries: self.retries.get(),
            retry_recoveries: self.retry_recoveries.get(),
            retry_exhaustions: self.retry_exhaustions.get(),
            retry_cancellations: self.retry_cancellations.get(),
            retry_deadline_exceeded: self.retry_deadline_exceeded.get(),
            retry_health_aborts: self.retry_health_aborts.get(),
            breaker_trips: self.breaker_trips.get(),
            breaker_rejections: self.breaker_rejections.get(),
            probe_runs: self.probe_runs.get(),
            probe_failures: self.probe_failures.get(),
            probe_failures_by_service,
            probe_latency_ms: self.probe_latency.snapshot(),
            errors_recorded: self.errors_recorded.get(),
            alerts_sent: self.alerts_sent.get(),
            alerts_suppressed: self.alerts_suppressed.get(),
            recoveries_attempted: self.recoveries_attempted.get(),
            recoveries_succeeded: self.recoveries_succeeded.get(),
            active_alerts: self.active_alerts.get(),
        }
    }
}

impl Default for ResilienceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time metrics
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[allow(missing_docs)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub retries: u64,
    pub retry_recoveries: u64,
    pub retry_exhaustions: u64,
    pub retry_cancellations: u64,
    pub retry_deadline_exceeded: u64,
    pub retry_health_aborts: u64,
    pub breaker_trips: u64,
    pub breaker_rejections: u64,
    pub probe_runs: u64,
    pub probe_failures: u64,
    pub probe_failures_by_service: Vec<(String, u64)>,
    pub probe_latency_ms: HistogramSnapshot,
    pub errors_recorded: u64,
    pub alerts_sent: u64,
    pub alerts_suppressed: u64,
    pub recoveries_attempted: u64,
    pub recoveries_succeeded: u64,
    pub active_alerts: u64,
}
