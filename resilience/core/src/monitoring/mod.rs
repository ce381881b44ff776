//! Error Monitoring Service
//!
//! Global error boundary for the resilience layer. For every error it:
//!
//! 1. records it (history ring + counters), always
//! 2. asks the [`ErrorAggregator`] whether to alert and dispatches to handlers
//! 3. drops the cached health of an external service that failed
//! 4. runs the recovery strategy bound to the error's category
//!
//! Steps 3 and 4 run in that order so a recovery re-probe leaves a fresh
//! cache entry behind. With no strategy bound, the entry stays cold.
//!
//! Nothing in `handle` returns an error; handler and strategy failures are
//! logged and reflected in the [`HandlingResult`].

mod aggregator;
mod alerts;
mod recovery;

pub use aggregator::{AlertDecision, ErrorAggregator, DEFAULT_THRESHOLD, DEFAULT_WINDOW};
pub use alerts::{AlertHandler, AlertLevel, ChannelAlertHandler, ErrorAlert, TracingAlertHandler};
pub use recovery::{
    DatabaseRecovery, ExternalServiceRecovery, FileSystemRecovery, NetworkRecovery, ProcessingRecovery,
    RecoveryOutcome, RecoveryStrategy,
};

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{AppError, ErrorCategory, ErrorSeverity};
use crate::health::ServiceHealthMonitor;
use crate::metrics::ResilienceMetrics;

/// Default history ring size
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// Records included in statistics
const RECENT_RECORDS: usize = 10;

// ============================================================================
// Context / Records
// ============================================================================

/// Where an error happened
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ErrorContext {
    /// Correlation id of the originating request
    pub request_id: Option<String>,
    /// Dependency involved
    pub service: Option<String>,
    /// Operation that failed
    pub operation: Option<String>,
    /// File system path involved
    pub path: Option<PathBuf>,
    /// Anything else worth keeping
    pub extra: BTreeMap<String, Value>,
}

impl ErrorContext {
    /// Context naming the service and operation
    pub fn for_operation(service: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            service: Some(service.into()),
            operation: Some(operation.into()),
            ..Self::default()
        }
    }

    /// Set the request id
    #[must_use]
    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    /// Set the path
    #[must_use]
    pub fn with_path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Attach an extra field
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// One recorded error
#[derive(Clone, Debug, Serialize)]
pub struct ErrorRecord {
    /// Record id
    pub id: Uuid,
    /// Error code
    pub code: String,
    /// Category
    pub category: ErrorCategory,
    /// Severity
    pub severity: ErrorSeverity,
    /// Internal message
    pub message: String,
    /// User-safe message
    pub user_message: String,
    /// Structured details
    pub details: BTreeMap<String, Value>,
    /// Recovery suggestions
    pub suggestions: Vec<String>,
    /// Service involved
    pub service: Option<String>,
    /// Where it happened
    pub context: ErrorContext,
    /// When it was recorded
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    fn new(error: &AppError, context: ErrorContext) -> Self {
        let service = context
            .service
            .clone()
            .or_else(|| error.service().map(str::to_string));
        Self {
            id: Uuid::new_v4(),
            code: error.code().to_string(),
            category: error.category(),
            severity: error.severity(),
            message: error.message().to_string(),
            user_message: error.user_message().to_string(),
            details: error.details().clone(),
            suggestions: error.suggestions().to_vec(),
            service,
            context,
            timestamp: Utc::now(),
        }
    }
}

/// What `handle` did
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HandlingResult {
    /// Id of the history record
    pub record_id: Uuid,
    /// Whether an alert was raised
    pub alert_sent: bool,
    /// The raised alert
    pub alert_id: Option<Uuid>,
    /// Whether a recovery strategy ran
    pub recovery_attempted: bool,
    /// Whether it reported success
    pub recovery_successful: bool,
    /// What the strategy did
    pub recovery_action: Option<String>,
}

/// Counters and recent history
#[derive(Clone, Debug, Default, Serialize)]
pub struct ErrorStatistics {
    /// Errors handled since start
    pub total_errors: u64,
    /// Counts by category
    pub by_category: BTreeMap<ErrorCategory, u64>,
    /// Counts by code
    pub by_code: BTreeMap<String, u64>,
    /// Counts by severity
    pub by_severity: BTreeMap<ErrorSeverity, u64>,
    /// Unresolved alerts
    pub active_alerts: usize,
    /// Records currently held in history
    pub history_len: usize,
    /// Newest records, newest first
    pub recent: Vec<ErrorRecord>,
}

// ============================================================================
// Service
// ============================================================================

/// Records errors, raises alerts, runs recovery
pub struct ErrorMonitoringService {
    aggregator: ErrorAggregator,
    history: Mutex<VecDeque<ErrorRecord>>,
    history_limit: usize,
    total: crate::metrics::Counter,
    by_category: DashMap<ErrorCategory, u64>,
    by_code: DashMap<String, u64>,
    by_severity: DashMap<ErrorSeverity, u64>,
    alerts: DashMap<Uuid, ErrorAlert>,
    handlers: RwLock<Vec<Arc<dyn AlertHandler>>>,
    strategies: RwLock<HashMap<ErrorCategory, Arc<dyn RecoveryStrategy>>>,
    health: Option<Arc<ServiceHealthMonitor>>,
    metrics: Arc<ResilienceMetrics>,
}

impl ErrorMonitoringService {
    /// Service with no handlers and no strategies
    pub fn new(aggregator: ErrorAggregator, history_limit: usize, metrics: Arc<ResilienceMetrics>) -> Self {
        Self {
            aggregator,
            history: Mutex::new(VecDeque::with_capacity(history_limit.min(1024))),
            history_limit: history_limit.max(1),
            total: crate::metrics::Counter::default(),
            by_category: DashMap::new(),
            by_code: DashMap::new(),
            by_severity: DashMap::new(),
            alerts: DashMap::new(),
            handlers: RwLock::new(Vec::new()),
            strategies: RwLock::new(HashMap::new()),
            health: None,
            metrics,
        }
    }

    /// Clear external-service health entries through `monitor`
    #[must_use]
    pub fn with_health_monitor(mut self, monitor: Arc<ServiceHealthMonitor>) -> Self {
        self.health = Some(monitor);
        self
    }

    /// Add an alert handler
    pub fn register_alert_handler(&self, handler: Arc<dyn AlertHandler>) {
        debug!(handler = handler.name(), "Registered alert handler");
        self.handlers.write().push(handler);
    }

    /// Bind (or replace) the recovery strategy for `category`
    pub fn register_recovery_strategy(&self, category: ErrorCategory, strategy: Arc<dyn RecoveryStrategy>) {
        self.strategies.write().insert(category, strategy);
    }

    /// Aggregator in use
    #[must_use]
    pub fn aggregator(&self) -> &ErrorAggregator {
        &self.aggregator
    }

    /// Handle one error
    ///
    /// For an external-service error the service's cached health is dropped
    /// before recovery runs, not after. A strategy that re-probes (the
    /// default external-service one does) therefore leaves the cache warm:
    /// [`ServiceHealthMonitor::is_available`] reflects the re-probe right
    /// after `handle` returns instead of reading as unavailable until the
    /// next check.
    pub async fn handle(&self, error: &AppError, context: ErrorContext) -> HandlingResult {
        let record = ErrorRecord::new(error, context);
        let service = record.service.clone();
        let ctx = record.context.clone();
        let mut result = HandlingResult {
            record_id: record.id,
            ..HandlingResult::default()
        };

        self.record(record);

        let decision = self.aggregator.observe(&error.bucket_key());
        let mut raised = None;
        if decision.alert {
            let alert = ErrorAlert::for_error(error, service.clone(), decision.occurrences);
            raised = Some(alert.id);
            result.alert_sent = true;
            result.alert_id = Some(alert.id);
            self.alerts.insert(alert.id, alert.clone());
            self.metrics.alerts_sent.inc();
            self.refresh_active_gauge();
            self.dispatch(&alert).await;
        } else {
            self.metrics.alerts_suppressed.inc();
            debug!(
                code = %error.code(),
                occurrences = decision.occurrences,
                "Alert suppressed by aggregator"
            );
        }

        // Stale health must not outlive a reported failure; a recovery
        // re-probe below repopulates the entry.
        if error.category() == ErrorCategory::ExternalService {
            if let (Some(health), Some(name)) = (&self.health, service.as_deref()) {
                health.clear_cache(Some(name));
            }
        }

        let strategy = self.strategies.read().get(&error.category()).cloned();
        if let Some(strategy) = strategy {
            result.recovery_attempted = true;
            self.metrics.recoveries_attempted.inc();
            match strategy.recover(error, &ctx).await {
                Ok(outcome) => {
                    result.recovery_successful = outcome.succeeded;
                    result.recovery_action = Some(outcome.action);
                }
                Err(e) => {
                    warn!(category = %error.category(), error = %e, "Recovery strategy failed");
                    result.recovery_action = Some(format!("recovery failed: {e}"));
                }
            }
            if result.recovery_successful {
                self.metrics.recoveries_succeeded.inc();
                self.resolve_recovered(error.category(), service.as_deref(), raised);
            }
        }

        result
    }

    fn record(&self, record: ErrorRecord) {
        match record.severity {
            ErrorSeverity::Critical => error!(
                code = %record.code,
                service = record.service.as_deref().unwrap_or("-"),
                "{}", record.message
            ),
            ErrorSeverity::High => warn!(
                code = %record.code,
                service = record.service.as_deref().unwrap_or("-"),
                "{}", record.message
            ),
            ErrorSeverity::Medium | ErrorSeverity::Low => debug!(
                code = %record.code,
                severity = %record.severity,
                "{}", record.message
            ),
        }

        self.total.inc();
        self.metrics.errors_recorded.inc();
        *self.by_category.entry(record.category).or_insert(0) += 1;
        *self.by_code.entry(record.code.clone()).or_insert(0) += 1;
        *self.by_severity.entry(record.severity).or_insert(0) += 1;

        let mut history = self.history.lock();
        history.push_back(record);
        while history.len() > self.history_limit {
            history.pop_front();
        }
    }

    async fn dispatch(&self, alert: &ErrorAlert) {
        // Snapshot so no lock is held while handlers run.
        let handlers: Vec<Arc<dyn AlertHandler>> = self.handlers.read().clone();
        for handler in handlers {
            if let Err(e) = handler.handle(alert).await {
                warn!(handler = handler.name(), alert_id = %alert.id, error = %e, "Alert handler failed");
            }
        }
    }

    /// Resolve earlier open alerts for the same category and service
    fn resolve_recovered(&self, category: ErrorCategory, service: Option<&str>, keep: Option<Uuid>) {
        let mut resolved = 0;
        for mut alert in self.alerts.iter_mut() {
            if Some(alert.id) != keep
                && !alert.resolved
                && alert.category == category
                && alert.service.as_deref() == service
                && alert.resolve()
            {
                resolved += 1;
            }
        }
        if resolved > 0 {
            debug!(category = %category, service, resolved, "Resolved alerts after recovery");
            self.refresh_active_gauge();
        }
    }

    fn refresh_active_gauge(&self) {
        let active = self.alerts.iter().filter(|a| !a.resolved).count();
        self.metrics.active_alerts.set(active as u64);
    }

    /// Mark an alert resolved; false if unknown or already resolved
    pub fn resolve_alert(&self, id: Uuid) -> bool {
        let resolved = self.alerts.get_mut(&id).is_some_and(|mut alert| alert.resolve());
        if resolved {
            self.refresh_active_gauge();
        }
        resolved
    }

    /// Drop resolved alerts
    pub fn prune_resolved(&self) -> usize {
        let before = self.alerts.len();
        self.alerts.retain(|_, alert| !alert.resolved);
        before - self.alerts.len()
    }

    /// Look up any alert
    #[must_use]
    pub fn alert(&self, id: Uuid) -> Option<ErrorAlert> {
        self.alerts.get(&id).map(|a| a.clone())
    }

    /// Unresolved alerts, oldest first
    #[must_use]
    pub fn active_alerts(&self) -> Vec<ErrorAlert> {
        let mut active: Vec<ErrorAlert> = self
            .alerts
            .iter()
            .filter(|a| !a.resolved)
            .map(|a| a.clone())
            .collect();
        active.sort_by_key(|a| a.created_at);
        active
    }

    /// Counters and the newest records
    #[must_use]
    pub fn error_statistics(&self) -> ErrorStatistics {
        let (history_len, recent) = {
            let history = self.history.lock();
            (
                history.len(),
                history.iter().rev().take(RECENT_RECORDS).cloned().collect(),
            )
        };
        ErrorStatistics {
            total_errors: self.total.get(),
            by_category: self.by_category.iter().map(|e| (*e.key(), *e.value())).collect(),
            by_code: self.by_code.iter().map(|e| (e.key().clone(), *e.value())).collect(),
            by_severity: self.by_severity.iter().map(|e| (*e.key(), *e.value())).collect(),
            active_alerts: self.alerts.iter().filter(|a| !a.resolved).count(),
            history_len,
            recent,
        }
    }
}

impl fmt::Debug for ErrorMonitoringService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorMonitoringService")
            .field("aggregator", &self.aggregator)
            .field("history_limit", &self.history_limit)
            .field("alerts", &self.alerts.len())
            .field("handlers", &self.handlers.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<ErrorAlert>>,
    }

    #[async_trait]
    impl AlertHandler for RecordingHandler {
        fn name(&self) -> &str {
            "recording"
        }

        async fn handle(&self, alert: &ErrorAlert) -> anyhow::Result<()> {
            self.seen.lock().push(alert.clone());
            Ok(())
        }
    }

    struct FailingHandler(AtomicUsize);

    #[async_trait]
    impl AlertHandler for FailingHandler {
        fn name(&self) -> &str {
            "failing"
        }

        async fn handle(&self, _alert: &ErrorAlert) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("pager unreachable")
        }
    }

    struct FixedRecovery(bool);

    #[async_trait]
    impl RecoveryStrategy for FixedRecovery {
        async fn recover(&self, _error: &AppError, _ctx: &ErrorContext) -> anyhow::Result<RecoveryOutcome> {
            Ok(if self.0 {
                RecoveryOutcome::recovered("fixed")
            } else {
                RecoveryOutcome::failed("still broken")
            })
        }
    }

    fn service(history_limit: usize) -> ErrorMonitoringService {
        let clock = ManualClock::shared();
        ErrorMonitoringService::new(
            ErrorAggregator::new(DEFAULT_WINDOW, DEFAULT_THRESHOLD, clock),
            history_limit,
            Arc::new(ResilienceMetrics::new()),
        )
    }

    #[tokio::test]
    async fn test_records_even_when_alert_is_suppressed() {
        let svc = service(100);
        let err = AppError::validation("missing field");

        let first = svc.handle(&err, ErrorContext::default()).await;
        let second = svc.handle(&err, ErrorContext::default()).await;

        assert!(first.alert_sent);
        assert!(!second.alert_sent);
        let stats = svc.error_statistics();
        assert_eq!(stats.total_errors, 2);
        assert_eq!(stats.by_category.get(&ErrorCategory::Validation), Some(&2));
        assert_eq!(stats.by_code.get("VALIDATION_400"), Some(&2));
        assert_eq!(stats.recent.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_handles_lose_nothing() {
        const CODES: usize = 4;
        const PER_CODE: usize = 24;
        let metrics = Arc::new(ResilienceMetrics::new());
        let svc = Arc::new(ErrorMonitoringService::new(
            ErrorAggregator::new(DEFAULT_WINDOW, DEFAULT_THRESHOLD, ManualClock::shared()),
            1000,
            metrics.clone(),
        ));

        let tasks: Vec<_> = (0..CODES * PER_CODE)
            .map(|i| {
                let svc = Arc::clone(&svc);
                tokio::spawn(async move {
                    let err = AppError::validation("bad input").with_code(format!("BATCH_{}", i % CODES));
                    svc.handle(&err, ErrorContext::default()).await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let stats = svc.error_statistics();
        assert_eq!(stats.total_errors, (CODES * PER_CODE) as u64);
        assert_eq!(stats.history_len, CODES * PER_CODE);
        assert_eq!(
            stats.by_category.get(&ErrorCategory::Validation),
            Some(&((CODES * PER_CODE) as u64))
        );
        for code in 0..CODES {
            assert_eq!(stats.by_code.get(&format!("BATCH_{code}")), Some(&(PER_CODE as u64)));
        }

        // Occurrences 1, 3, 6, 12, 18 and 24 alert in every bucket.
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.alerts_sent, (CODES * 6) as u64);
        assert_eq!(snapshot.alerts_suppressed, (CODES * (PER_CODE - 6)) as u64);
        assert_eq!(stats.active_alerts, CODES * 6);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let svc = service(3);
        for i in 0..5 {
            svc.handle(&AppError::internal(format!("boom {i}")), ErrorContext::default())
                .await;
        }
        let stats = svc.error_statistics();
        assert_eq!(stats.history_len, 3);
        assert_eq!(stats.total_errors, 5);
        assert_eq!(stats.recent[0].message, "boom 4");
    }

    #[tokio::test]
    async fn test_handler_failure_does_not_stop_others() {
        let svc = service(10);
        let failing = Arc::new(FailingHandler(AtomicUsize::new(0)));
        let recording = Arc::new(RecordingHandler::default());
        svc.register_alert_handler(failing.clone());
        svc.register_alert_handler(recording.clone());

        let result = svc
            .handle(&AppError::configuration("missing key"), ErrorContext::default())
            .await;

        assert!(result.alert_sent);
        assert_eq!(failing.0.load(Ordering::SeqCst), 1);
        let seen = recording.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].level, AlertLevel::Critical);
    }

    #[tokio::test]
    async fn test_resolve_alert() {
        let svc = service(10);
        let result = svc.handle(&AppError::database("down"), ErrorContext::default()).await;
        let id = result.alert_id.unwrap();

        assert_eq!(svc.active_alerts().len(), 1);
        assert!(svc.resolve_alert(id));
        assert!(!svc.resolve_alert(id));
        assert!(svc.active_alerts().is_empty());
        assert!(svc.alert(id).unwrap().resolved_at.is_some());
        assert_eq!(svc.prune_resolved(), 1);
    }

    #[tokio::test]
    async fn test_recovery_outcome_is_reported() {
        let svc = service(10);
        svc.register_recovery_strategy(ErrorCategory::Processing, Arc::new(FixedRecovery(false)));

        let result = svc.handle(&AppError::processing("bad"), ErrorContext::default()).await;
        assert!(result.recovery_attempted);
        assert!(!result.recovery_successful);
        assert_eq!(result.recovery_action.as_deref(), Some("still broken"));

        let untouched = svc.handle(&AppError::auth("nope"), ErrorContext::default()).await;
        assert!(!untouched.recovery_attempted);
    }

    #[tokio::test]
    async fn test_successful_recovery_resolves_earlier_alerts_only() {
        let svc = service(10);
        let ctx = || ErrorContext::for_operation("database", "insert-note");

        let earlier = svc.handle(&AppError::database("down"), ctx()).await;
        assert!(earlier.alert_id.is_some());

        svc.register_recovery_strategy(ErrorCategory::Database, Arc::new(FixedRecovery(true)));
        // Second occurrence is suppressed; third hits the threshold and alerts.
        svc.handle(&AppError::database("down"), ctx()).await;
        let third = svc.handle(&AppError::database("down"), ctx()).await;

        assert!(third.recovery_successful);
        let active = svc.active_alerts();
        assert_eq!(active.len(), 1);
        assert_eq!(Some(active[0].id), third.alert_id);
    }

    #[tokio::test]
    async fn test_external_service_error_clears_health_cache() {
        use crate::health::{FnProbe, ProbeOutcome};

        let clock = ManualClock::shared();
        let monitor = Arc::new(ServiceHealthMonitor::new(Duration::from_secs(30), clock.clone()));
        monitor.register_probe(
            "llm-api",
            Arc::new(FnProbe::new(|| async { Ok::<_, anyhow::Error>(ProbeOutcome::healthy()) })),
        );
        monitor.check_health("llm-api", false).await;
        assert!(monitor.cached("llm-api").is_some());

        let svc = ErrorMonitoringService::new(
            ErrorAggregator::new(DEFAULT_WINDOW, DEFAULT_THRESHOLD, clock),
            10,
            Arc::new(ResilienceMetrics::new()),
        )
        .with_health_monitor(monitor.clone());

        svc.handle(&AppError::external_service("llm-api", "502 from upstream"), ErrorContext::default())
            .await;
        assert!(monitor.cached("llm-api").is_none());
    }

    #[tokio::test]
    async fn test_recovery_recheck_repopulates_cleared_health() {
        use crate::health::{FnProbe, ProbeOutcome};
        use std::sync::atomic::AtomicBool;

        let clock = ManualClock::shared();
        let monitor = Arc::new(ServiceHealthMonitor::new(Duration::from_secs(30), clock.clone()));
        let up = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&up);
        monitor.register_probe(
            "llm-api",
            Arc::new(FnProbe::new(move || {
                let healthy = flag.load(Ordering::SeqCst);
                async move {
                    Ok::<_, anyhow::Error>(if healthy {
                        ProbeOutcome::healthy()
                    } else {
                        ProbeOutcome::unhealthy("502")
                    })
                }
            })),
        );
        monitor.check_health("llm-api", false).await;
        assert!(!monitor.is_available("llm-api"));

        let svc = ErrorMonitoringService::new(
            ErrorAggregator::new(DEFAULT_WINDOW, DEFAULT_THRESHOLD, clock),
            10,
            Arc::new(ResilienceMetrics::new()),
        )
        .with_health_monitor(monitor.clone());
        svc.register_recovery_strategy(
            ErrorCategory::ExternalService,
            Arc::new(ExternalServiceRecovery::new(monitor.clone(), Duration::ZERO)),
        );

        up.store(true, Ordering::SeqCst);
        let result = svc
            .handle(&AppError::external_service("llm-api", "502 from upstream"), ErrorContext::default())
            .await;

        assert!(result.recovery_successful);
        assert!(monitor.is_available("llm-api"));
    }
}
