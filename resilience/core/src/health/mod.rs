//! Service Health Monitor
//!
//! Runs named probes and caches each result under its service name.
//!
//! ```text
//!   check_health(name, force=false)
//!        |
//!        +-- cached && age < ttl ----------------> cached result
//!        |
//!        +-- no probe registered ----------------> unknown (not cached)
//!        |
//!        +-- probe (with timeout) --+-- Ok ------> outcome status
//!                                   +-- Err -----> unhealthy
//!                                   +-- timeout -> unhealthy
//! ```
//!
//! `is_available` never probes. It trusts a cached entry up to `2 * ttl` old
//! and treats anything older (or missing) as unavailable.
//!
//! Concurrent refreshes of the same expired key are not deduplicated; two
//! callers may probe at the same time and the last write wins.

mod probe;

pub use probe::{FnProbe, HealthProbe, ProbeOutcome};

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::clock::{duration_to_millis, Clock};
use crate::error::AppError;
use crate::metrics::ResilienceMetrics;

/// Default cache TTL
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

/// Default per-probe timeout
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Health Status
// ============================================================================

/// Health of one dependency
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Fully working
    Healthy,
    /// Working with reduced guarantees; callers proceed
    Degraded,
    /// Down; gated operations fail fast
    Unhealthy,
    /// Never checked or no probe registered
    #[default]
    Unknown,
}

impl HealthStatus {
    /// Whether callers may proceed
    #[must_use]
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        })
    }
}

// ============================================================================
// Health Check Result
// ============================================================================

/// Result of one probe run
///
/// Immutable once produced; the next probe for the same service replaces it.
#[derive(Clone, Debug, Serialize)]
pub struct ServiceHealthCheck {
    /// Service name
    pub service: String,
    /// Observed status
    pub status: HealthStatus,
    /// Probe latency
    pub latency_ms: u64,
    /// Failure reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Probe details
    pub details: BTreeMap<String, Value>,
    /// Wall-clock time of measurement
    pub checked_at: DateTime<Utc>,
    #[serde(skip)]
    observed_at: Instant,
}

impl ServiceHealthCheck {
    fn from_outcome(service: &str, outcome: ProbeOutcome, latency: Duration, now: Instant) -> Self {
        Self {
            service: service.to_string(),
            status: outcome.status,
            latency_ms: duration_to_millis(latency),
            error: outcome.error,
            details: outcome.details,
            checked_at: Utc::now(),
            observed_at: now,
        }
    }

    fn unknown(service: &str, now: Instant) -> Self {
        Self {
            service: service.to_string(),
            status: HealthStatus::Unknown,
            latency_ms: 0,
            error: Some("no health probe registered".to_string()),
            details: BTreeMap::new(),
            checked_at: Utc::now(),
            observed_at: now,
        }
    }

    /// Age of this result according to `clock`
    #[must_use]
    pub fn age(&self, clock: &dyn Clock) -> Duration {
        clock.now().saturating_duration_since(self.observed_at)
    }

    /// Details for an unavailability error
    fn error_details(&self) -> BTreeMap<String, Value> {
        let mut details = self.details.clone();
        details.insert("status".to_string(), Value::from(self.status.to_string()));
        details.insert("latency_ms".to_string(), Value::from(self.latency_ms));
        if let Some(error) = &self.error {
            details.insert("error".to_string(), Value::from(error.clone()));
        }
        details
    }
}

// ============================================================================
// Summary
// ============================================================================

/// Roll-up over every registered service
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct HealthSummary {
    /// Registered services
    pub total: usize,
    /// Healthy count
    pub healthy: usize,
    /// Degraded count
    pub degraded: usize,
    /// Unhealthy count
    pub unhealthy: usize,
    /// Unknown (never checked) count
    pub unknown: usize,
    /// Worst observed status
    pub overall: HealthStatus,
    /// Share of services that are healthy or degraded (0-100)
    pub availability_percentage: f64,
}

impl HealthSummary {
    fn from_statuses(statuses: impl IntoIterator<Item = HealthStatus>) -> Self {
        let mut summary = Self::default();
        for status in statuses {
            summary.total += 1;
            match status {
                HealthStatus::Healthy => summary.healthy += 1,
                HealthStatus::Degraded => summary.degraded += 1,
                HealthStatus::Unhealthy => summary.unhealthy += 1,
                HealthStatus::Unknown => summary.unknown += 1,
            }
        }

        summary.overall = if summary.unhealthy > 0 {
            HealthStatus::Unhealthy
        } else if summary.degraded > 0 || (summary.unknown > 0 && summary.healthy > 0) {
            HealthStatus::Degraded
        } else if summary.healthy > 0 {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unknown
        };

        if summary.total > 0 {
            summary.availability_percentage =
                (summary.healthy + summary.degraded) as f64 / summary.total as f64 * 100.0;
        }
        summary
    }
}

// ============================================================================
// Monitor
// ============================================================================

/// Probe registry plus TTL cache
pub struct ServiceHealthMonitor {
    probes: RwLock<HashMap<String, Arc<dyn HealthProbe>>>,
    cache: DashMap<String, ServiceHealthCheck>,
    ttl: Duration,
    probe_timeout: Duration,
    clock: Arc<dyn Clock>,
    metrics: Arc<ResilienceMetrics>,
}

impl ServiceHealthMonitor {
    /// Create a monitor with the given cache TTL
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            probes: RwLock::new(HashMap::new()),
            cache: DashMap::new(),
            ttl,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            clock,
            metrics: Arc::new(ResilienceMetrics::new()),
        }
    }

    /// Set the per-probe timeout
    #[must_use]
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Report into shared metrics
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<ResilienceMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Soft cache TTL
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Register (or replace) the probe for `service`
    ///
    /// Any cached result for the service is dropped.
    pub fn register_probe(&self, service: impl Into<String>, probe: Arc<dyn HealthProbe>) {
        let service = service.into();
        debug!(service = %service, "Registered health probe");
        self.cache.remove(&service);
        self.probes.write().insert(service, probe);
    }

    /// Remove the probe for `service`
    pub fn unregister_probe(&self, service: &str) -> bool {
        self.cache.remove(service);
        self.probes.write().remove(service).is_some()
    }

    /// Registered service names, sorted
    #[must_use]
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.probes.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Cached result, regardless of age
    #[must_use]
    pub fn cached(&self, service: &str) -> Option<ServiceHealthCheck> {
        self.cache.get(service).map(|entry| entry.value().clone())
    }

    /// Current health of `service`
    ///
    /// Returns the cached result while it is younger than the TTL unless
    /// `force_refresh` is set. Probe failures become `unhealthy` results.
    pub async fn check_health(&self, service: &str, force_refresh: bool) -> ServiceHealthCheck {
        if !force_refresh {
            if let Some(entry) = self.cache.get(service) {
                if entry.age(self.clock.as_ref()) < self.ttl {
                    return entry.value().clone();
                }
            }
        }

        // Clone the Arc out so no lock is held across the probe.
        let probe = self.probes.read().get(service).cloned();
        let Some(probe) = probe else {
            debug!(service = %service, "Health check for service without probe");
            return ServiceHealthCheck::unknown(service, self.clock.now());
        };

        let started = Instant::now();
        let outcome = match tokio::time::timeout(self.probe_timeout, probe.check()).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => ProbeOutcome::unhealthy(format!("{e:#}")),
            Err(_) => ProbeOutcome::unhealthy(format!(
                "probe timed out after {}ms",
                duration_to_millis(self.probe_timeout)
            ))
            .with_detail("timeout_ms", duration_to_millis(self.probe_timeout)),
        };
        let latency = started.elapsed();

        let check = ServiceHealthCheck::from_outcome(service, outcome, latency, self.clock.now());
        self.record(&check);

        let previous = self.cache.insert(service.to_string(), check.clone());
        log_transition(previous.map(|p| p.status), &check);

        check
    }

    fn record(&self, check: &ServiceHealthCheck) {
        self.metrics.probe_runs.inc();
        self.metrics.probe_latency.record(check.latency_ms as f64);
        if check.status == HealthStatus::Unhealthy {
            self.metrics.record_probe_failure(&check.service);
        }
    }

    /// Fail with `ExternalServiceUnavailable` when `service` is unhealthy
    ///
    /// Degraded and unknown services pass the gate.
    pub async fn ensure_available(
        &self,
        service: &str,
        operation: &str,
    ) -> Result<ServiceHealthCheck, AppError> {
        let check = self.check_health(service, false).await;
        match check.status {
            HealthStatus::Unhealthy => {
                warn!(
                    service = %service,
                    operation = %operation,
                    error = check.error.as_deref().unwrap_or(""),
                    "Service unavailable, refusing operation"
                );
                Err(AppError::service_unavailable(service, operation, check.error_details()))
            }
            HealthStatus::Degraded => {
                debug!(service = %service, operation = %operation, "Proceeding against degraded service");
                Ok(check)
            }
            HealthStatus::Healthy | HealthStatus::Unknown => Ok(check),
        }
    }

    /// Cache-only availability check for hot paths
    ///
    /// False when nothing is cached, the entry is older than `2 * ttl`, or the
    /// cached status is not available.
    #[must_use]
    pub fn is_available(&self, service: &str) -> bool {
        let Some(entry) = self.cache.get(service) else {
            return false;
        };
        let ceiling = self.ttl.saturating_mul(2);
        entry.age(self.clock.as_ref()) <= ceiling && entry.status.is_available()
    }

    /// Drop one cached entry, or all of them
    pub fn clear_cache(&self, service: Option<&str>) {
        match service {
            Some(name) => {
                self.cache.remove(name);
                debug!(service = %name, "Cleared health cache entry");
            }
            None => {
                self.cache.clear();
                debug!("Cleared health cache");
            }
        }
    }

    /// Check every registered service concurrently
    pub async fn check_all(&self, force_refresh: bool) -> Vec<ServiceHealthCheck> {
        let services = self.services();
        join_all(services.iter().map(|s| self.check_health(s, force_refresh))).await
    }

    /// Roll-up of the latest cached status for each registered service
    #[must_use]
    pub fn summary(&self) -> HealthSummary {
        HealthSummary::from_statuses(
            self.services()
                .iter()
                .map(|s| self.cache.get(s).map_or(HealthStatus::Unknown, |c| c.status)),
        )
    }
}

impl fmt::Debug for ServiceHealthMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHealthMonitor")
            .field("services", &self.services())
            .field("cached", &self.cache.len())
            .field("ttl", &self.ttl)
            .field("probe_timeout", &self.probe_timeout)
            .finish()
    }
}

fn log_transition(previous: Option<HealthStatus>, check: &ServiceHealthCheck) {
    if previous == Some(check.status) {
        return;
    }
    match check.status {
        HealthStatus::Unhealthy => warn!(
            service = %check.service,
            previous = ?previous,
            error = check.error.as_deref().unwrap_or(""),
            "Service became unhealthy"
        ),
        HealthStatus::Degraded => warn!(
            service = %check.service,
            previous = ?previous,
            "Service degraded"
        ),
        HealthStatus::Healthy if previous.is_some() => info!(
            service = %check.service,
            latency_ms = check.latency_ms,
            "Service recovered"
        ),
        _ => debug!(service = %check.service, status = %check.status, "Initial health result"),
    }
}
