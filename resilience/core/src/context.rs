//! Resilience context
//!
//! One `ResilienceContext` is built at process start and handed to every
//! component that needs health checks, retries, breakers or error handling.
//! There is no global state; tests build their own context with a
//! [`ManualClock`](crate::clock::ManualClock).

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry};
use crate::clock::{system_clock, Clock};
use crate::config::ResilienceConfig;
use crate::dependency::DependencyClass;
use crate::error::{AppError, ErrorCategory};
use crate::health::{HealthProbe, ServiceHealthCheck, ServiceHealthMonitor};
use crate::metrics::ResilienceMetrics;
use crate::monitoring::{
    AlertHandler, DatabaseRecovery, ErrorAggregator, ErrorAlert, ErrorContext, ErrorMonitoringService,
    ErrorStatistics, ExternalServiceRecovery, FileSystemRecovery, HandlingResult, NetworkRecovery,
    ProcessingRecovery, RecoveryStrategy, TracingAlertHandler,
};
use crate::retry::{RetryExecutor, RetryPolicy};

/// Shared registry of every resilience component
pub struct ResilienceContext {
    config: ResilienceConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<ResilienceMetrics>,
    health: Arc<ServiceHealthMonitor>,
    breakers: CircuitBreakerRegistry,
    monitoring: ErrorMonitoringService,
    shutdown: CancellationToken,
}

impl ResilienceContext {
    /// Context on the system clock
    #[must_use]
    pub fn new(config: ResilienceConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    /// Context on `clock`
    ///
    /// Registers the tracing alert handler and the default recovery
    /// strategies (external service, database, file system, processing,
    /// network).
    #[must_use]
    pub fn with_clock(config: ResilienceConfig, clock: Arc<dyn Clock>) -> Self {
        let metrics = Arc::new(ResilienceMetrics::new());

        let health = Arc::new(
            ServiceHealthMonitor::new(config.health.cache_ttl, Arc::clone(&clock))
                .with_probe_timeout(config.health.probe_timeout)
                .with_metrics(Arc::clone(&metrics)),
        );

        let breakers = CircuitBreakerRegistry::new(config.circuit_breaker, Arc::clone(&clock), Arc::clone(&metrics));

        let aggregator = ErrorAggregator::new(config.alerts.window, config.alerts.threshold, Arc::clone(&clock));
        let monitoring = ErrorMonitoringService::new(aggregator, config.monitoring.history_limit, Arc::clone(&metrics))
            .with_health_monitor(Arc::clone(&health));

        let settle = config.monitoring.recovery_settle;
        monitoring.register_alert_handler(Arc::new(TracingAlertHandler));
        monitoring.register_recovery_strategy(
            ErrorCategory::ExternalService,
            Arc::new(ExternalServiceRecovery::new(Arc::clone(&health), settle)),
        );
        monitoring.register_recovery_strategy(
            ErrorCategory::Database,
            Arc::new(DatabaseRecovery::new(
                Arc::clone(&health),
                DependencyClass::Database.default_service(),
            )),
        );
        monitoring.register_recovery_strategy(
            ErrorCategory::FileSystem,
            Arc::new(FileSystemRecovery::new(
                Arc::clone(&health),
                DependencyClass::Storage.default_service(),
            )),
        );
        monitoring.register_recovery_strategy(ErrorCategory::Processing, Arc::new(ProcessingRecovery));
        monitoring.register_recovery_strategy(ErrorCategory::Network, Arc::new(NetworkRecovery::new(settle)));

        info!(
            cache_ttl_secs = config.health.cache_ttl.as_secs(),
            breaker_threshold = config.circuit_breaker.failure_threshold,
            alert_threshold = config.alerts.threshold,
            production = config.monitoring.production,
            "Resilience context ready"
        );

        Self {
            config,
            clock,
            metrics,
            health,
            breakers,
            monitoring,
            shutdown: CancellationToken::new(),
        }
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register (or replace) the probe for `service`
    pub fn register_probe(&self, service: impl Into<String>, probe: Arc<dyn HealthProbe>) {
        self.health.register_probe(service, probe);
    }

    /// Add an alert handler
    pub fn register_alert_handler(&self, handler: Arc<dyn AlertHandler>) {
        self.monitoring.register_alert_handler(handler);
    }

    /// Bind (or replace) the recovery strategy for `category`
    pub fn register_recovery_strategy(&self, category: ErrorCategory, strategy: Arc<dyn RecoveryStrategy>) {
        self.monitoring.register_recovery_strategy(category, strategy);
    }

    // ------------------------------------------------------------------
    // Call-site surface
    // ------------------------------------------------------------------

    /// Fail fast when `service` is unhealthy
    ///
    /// # Errors
    ///
    /// Returns an `EXTERNAL_SERVICE_UNAVAILABLE` error naming the service
    /// and operation.
    pub async fn ensure_available(&self, service: &str, operation: &str) -> Result<ServiceHealthCheck, AppError> {
        self.health.ensure_available(service, operation).await
    }

    /// Retry executor for `policy`
    ///
    /// With a `service`, every retry is gated on that service's health.
    /// Retries stop when the context shuts down.
    #[must_use]
    pub fn with_retry(&self, policy: RetryPolicy, service: Option<&str>, operation: Option<&str>) -> RetryExecutor {
        let operation = operation.unwrap_or("operation");
        let executor = RetryExecutor::new(policy)
            .with_metrics(Arc::clone(&self.metrics))
            .with_cancellation(self.shutdown.child_token())
            .named(operation);
        match service {
            Some(service) => executor.with_health_gate(Arc::clone(&self.health), service, operation),
            None => executor,
        }
    }

    /// Retry executor using the preset for `class`, gated on its service
    #[must_use]
    pub fn retry_for(&self, class: DependencyClass, operation: &str) -> RetryExecutor {
        self.with_retry(self.retry_policy(class), Some(class.default_service()), Some(operation))
    }

    /// Breaker for `name`, created with the given thresholds if new
    pub fn with_circuit_breaker(&self, name: &str, threshold: u32, recovery_timeout: Duration) -> Arc<CircuitBreaker> {
        self.breakers.get_or_create_with(
            name,
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout,
            },
        )
    }

    /// Breaker for `name` with configured default thresholds
    pub fn circuit_breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers.get_or_create(name)
    }

    /// Record, alert on and try to recover from `error`
    pub async fn handle(&self, error: &AppError, context: ErrorContext) -> HandlingResult {
        self.monitoring.handle(error, context).await
    }

    /// Unresolved alerts, oldest first
    #[must_use]
    pub fn active_alerts(&self) -> Vec<ErrorAlert> {
        self.monitoring.active_alerts()
    }

    /// Error counters and recent history
    #[must_use]
    pub fn error_statistics(&self) -> ErrorStatistics {
        self.monitoring.error_statistics()
    }

    /// Resolve an alert by id; false when unknown or already resolved
    pub fn resolve_alert(&self, id: Uuid) -> bool {
        self.monitoring.resolve_alert(id)
    }

    /// Configured retry policy for `class`
    #[must_use]
    pub fn retry_policy(&self, class: DependencyClass) -> RetryPolicy {
        self.config.retry_policy(class)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Health monitor
    #[must_use]
    pub fn health(&self) -> &Arc<ServiceHealthMonitor> {
        &self.health
    }

    /// Breaker registry
    #[must_use]
    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    /// Error monitoring service
    #[must_use]
    pub fn monitoring(&self) -> &ErrorMonitoringService {
        &self.monitoring
    }

    /// Shared counters
    #[must_use]
    pub fn metrics(&self) -> &Arc<ResilienceMetrics> {
        &self.metrics
    }

    /// Clock in use
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Configuration the context was built from
    #[must_use]
    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// Whether caller-facing errors omit diagnostics
    #[must_use]
    pub fn production(&self) -> bool {
        self.config.monitoring.production
    }

    /// Cancel every retry loop created by this context
    pub fn shutdown(&self) {
        info!("Resilience context shutting down");
        self.shutdown.cancel();
    }

    /// Token cancelled by [`shutdown`](Self::shutdown)
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::health::{FnProbe, HealthStatus, ProbeOutcome};
    use crate::retry::RetryError;

    fn context() -> (ResilienceContext, Arc<ManualClock>) {
        let clock = ManualClock::shared();
        let mut config = ResilienceConfig::default();
        config.monitoring.recovery_settle = Duration::ZERO;
        (ResilienceContext::with_clock(config, clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_ensure_available_through_context() {
        let (ctx, _clock) = context();
        ctx.register_probe(
            "cache-service",
            Arc::new(FnProbe::new(|| async {
                Ok::<_, anyhow::Error>(ProbeOutcome::unhealthy("connection refused"))
            })),
        );

        let err = ctx.ensure_available("cache-service", "warm-lookup").await.unwrap_err();
        assert_eq!(err.code(), "EXTERNAL_SERVICE_UNAVAILABLE");
        assert_eq!(err.detail_str("operation"), Some("warm-lookup"));
    }

    #[tokio::test]
    async fn test_retry_policy_uses_presets() {
        let (ctx, _clock) = context();
        assert_eq!(ctx.retry_policy(DependencyClass::Llm).max_attempts, 6);
        assert_eq!(ctx.retry_for(DependencyClass::Cache, "get").policy().max_attempts, 3);
    }

    #[tokio::test]
    async fn test_with_circuit_breaker_reuses_instance() {
        let (ctx, _clock) = context();
        let a = ctx.with_circuit_breaker("llm.complete", 2, Duration::from_secs(5));
        let b = ctx.with_circuit_breaker("llm.complete", 9, Duration::from_secs(50));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.config().failure_threshold, 2);
        assert_eq!(ctx.breakers().snapshots().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_retries() {
        let (ctx, _clock) = context();
        let executor = ctx.with_retry(
            RetryPolicy::exponential(5, Duration::from_secs(10), Duration::from_secs(60)),
            None,
            Some("upload"),
        );
        ctx.shutdown();

        let result = executor
            .run(|| async { Err::<(), _>(AppError::network("reset")) })
            .await;
        assert!(matches!(result, Err(RetryError::Cancelled { .. })));
    }

    #[tokio::test]
    async fn test_default_strategies_registered() {
        let (ctx, _clock) = context();
        ctx.register_probe(
            "database",
            Arc::new(FnProbe::new(|| async { Ok::<_, anyhow::Error>(ProbeOutcome::healthy()) })),
        );

        let result = ctx
            .handle(&AppError::database("pool exhausted"), ErrorContext::default())
            .await;
        assert!(result.recovery_attempted);
        assert!(result.recovery_successful);

        let result = ctx
            .handle(&AppError::processing("corrupt page"), ErrorContext::default())
            .await;
        assert!(result.recovery_attempted);
        assert!(!result.recovery_successful);

        let stats = ctx.error_statistics();
        assert_eq!(stats.total_errors, 2);
        assert_eq!(ctx.health().cached("database").map(|c| c.status), Some(HealthStatus::Healthy));
    }

    #[tokio::test]
    async fn test_resolve_alert_through_context() {
        let (ctx, _clock) = context();
        let result = ctx.handle(&AppError::validation("bad"), ErrorContext::default()).await;
        let id = result.alert_id.unwrap();

        assert_eq!(ctx.active_alerts().len(), 1);
        assert!(ctx.resolve_alert(id));
        assert!(!ctx.resolve_alert(id));
        assert!(ctx.active_alerts().is_empty());
    }
}
