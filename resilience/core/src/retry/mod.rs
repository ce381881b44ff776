//! Retry Policy Engine
//!
//! Runs an operation up to `max_attempts` times with backoff between
//! attempts. One loop serves both async operations ([`RetryExecutor::run`])
//! and synchronous closures ([`RetryExecutor::run_blocking`]).
//!
//! ```text
//! attempt ──> Ok ─────────────────────────────> return
//!    │
//!    └──> Err ─┬─ not retryable ──────────────> NonRetryable
//!              ├─ last attempt ───────────────> Exhausted
//!              ├─ backoff crosses deadline ───> DeadlineExceeded
//!              │  (an attempt still running at the deadline is dropped too)
//!              └─ backoff (cancellable) ──┬─── cancelled ──> Cancelled
//!                                         └─── health gate ─┬─ down ─> Unavailable
//!                                                           └─ up ───> attempt
//! ```

mod policy;

pub use policy::{RetryPolicy, DEFAULT_RETRYABLE};

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::duration_to_millis;
use crate::error::{AppError, Classify, ErrorCategory, ErrorKind, ErrorSeverity};
use crate::health::ServiceHealthMonitor;
use crate::metrics::ResilienceMetrics;

// ============================================================================
// Errors
// ============================================================================

/// Why a retried operation gave up
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error
    #[error("gave up after {attempts} attempts: {source}")]
    Exhausted {
        /// Attempts made
        attempts: u32,
        /// Last error
        source: E,
    },

    /// The error category is not retryable
    #[error("non-retryable failure on attempt {attempts}: {source}")]
    NonRetryable {
        /// Attempts made
        attempts: u32,
        /// The error
        source: E,
    },

    /// The bound dependency was unhealthy when a retry was due
    #[error("dependency unavailable after {attempts} attempts: {source}")]
    Unavailable {
        /// Attempts made before the gate refused
        attempts: u32,
        /// Health gate error
        source: AppError,
    },

    /// The caller cancelled
    #[error("cancelled after {attempts} attempts")]
    Cancelled {
        /// Attempts started
        attempts: u32,
    },

    /// The overall deadline ran out, mid-attempt or before a backoff
    #[error("deadline of {deadline:?} exceeded after {attempts} attempts")]
    DeadlineExceeded {
        /// Attempts started
        attempts: u32,
        /// Configured deadline
        deadline: Duration,
        /// Last completed attempt's error; `None` when an attempt was cut off
        #[source]
        last_error: Option<E>,
    },
}

impl<E> RetryError<E> {
    /// Attempts made (or started, for cancellation)
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. }
            | Self::NonRetryable { attempts, .. }
            | Self::Unavailable { attempts, .. }
            | Self::Cancelled { attempts }
            | Self::DeadlineExceeded { attempts, .. } => *attempts,
        }
    }

    /// Whether the caller cancelled
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// The operation's own last error, if there was one
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Exhausted { source, .. }
            | Self::NonRetryable { source, .. } => Some(source),
            Self::DeadlineExceeded { last_error, .. } => last_error,
            Self::Unavailable { .. } | Self::Cancelled { .. } => None,
        }
    }
}

impl<E: Classify> Classify for RetryError<E> {
    fn category(&self) -> ErrorCategory {
        match self {
            Self::Exhausted { source, .. } | Self::NonRetryable { source, .. } => source.category(),
            Self::DeadlineExceeded { last_error, .. } => last_error
                .as_ref()
                .map_or(ErrorCategory::ExternalService, Classify::category),
            Self::Unavailable { source, .. } => source.category(),
            Self::Cancelled { .. } => ErrorCategory::Internal,
        }
    }

    fn kind(&self) -> ErrorKind {
        match self {
            Self::Exhausted { source, .. } | Self::NonRetryable { source, .. } => source.kind(),
            Self::Unavailable { source, .. } => source.kind(),
            Self::DeadlineExceeded { .. } => ErrorKind::Timeout,
            Self::Cancelled { .. } => ErrorKind::Other,
        }
    }
}

impl From<RetryError<AppError>> for AppError {
    fn from(err: RetryError<AppError>) -> Self {
        match err {
            RetryError::Exhausted { attempts, source } => source.with_detail("attempts", attempts),
            RetryError::NonRetryable { source, .. } => source,
            RetryError::Unavailable { attempts, source } => source.with_detail("attempts", attempts),
            RetryError::Cancelled { attempts } => AppError::internal("operation cancelled")
                .with_code("OPERATION_CANCELLED")
                .with_severity(ErrorSeverity::Low)
                .with_user_message("The request was cancelled")
                .with_detail("attempts", attempts),
            RetryError::DeadlineExceeded {
                attempts,
                deadline,
                last_error,
            } => {
                let err = AppError::timeout("retried operation", deadline).with_detail("attempts", attempts);
                match last_error {
                    Some(source) => err.with_detail("last_error", source.message().to_string()),
                    None => err,
                }
            }
        }
    }
}

// ============================================================================
// Executor
// ============================================================================

struct HealthGate {
    monitor: Arc<ServiceHealthMonitor>,
    service: String,
    operation: String,
}

/// Applies a [`RetryPolicy`] to operations
pub struct RetryExecutor {
    policy: RetryPolicy,
    gate: Option<HealthGate>,
    cancel: Option<CancellationToken>,
    metrics: Option<Arc<ResilienceMetrics>>,
    label: String,
}

impl RetryExecutor {
    /// Executor with no health gate and no cancellation
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            gate: None,
            cancel: None,
            metrics: None,
            label: "operation".to_string(),
        }
    }

    /// Re-check `service` before every retry
    #[must_use]
    pub fn with_health_gate(
        mut self,
        monitor: Arc<ServiceHealthMonitor>,
        service: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        let operation = operation.into();
        self.label = operation.clone();
        self.gate = Some(HealthGate {
            monitor,
            service: service.into(),
            operation,
        });
        self
    }

    /// Abort waits and in-flight attempts when `token` fires
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Report into shared metrics
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<ResilienceMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Name used in log lines
    #[must_use]
    pub fn named(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Policy in effect
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run an async operation under the policy
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        let deadline_at = self.policy.deadline.map(|budget| (budget, Instant::now() + budget));
        let max_attempts = self.policy.attempts();
        let mut attempt: u32 = 0;

        loop {
            if attempt > 0 {
                if let Some(gate) = &self.gate {
                    if let Err(err) = gate.monitor.ensure_available(&gate.service, &gate.operation).await {
                        warn!(
                            operation = %self.label,
                            service = %gate.service,
                            attempts = attempt,
                            "Dependency still unavailable, abandoning retries"
                        );
                        self.count(|m| &m.retry_health_aborts);
                        return Err(RetryError::Unavailable {
                            attempts: attempt,
                            source: err,
                        });
                    }
                }
            }

            if self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
                self.count(|m| &m.retry_cancellations);
                return Err(RetryError::Cancelled { attempts: attempt });
            }

            attempt += 1;
            let bounded = async {
                match deadline_at {
                    Some((_, at)) => tokio::time::timeout_at(at, op()).await.ok(),
                    None => Some(op().await),
                }
            };
            let outcome = match &self.cancel {
                Some(token) => tokio::select! {
                    biased;
                    () = token.cancelled() => {
                        debug!(operation = %self.label, attempt, "Cancelled during attempt");
                        self.count(|m| &m.retry_cancellations);
                        return Err(RetryError::Cancelled { attempts: attempt });
                    }
                    outcome = bounded => outcome,
                },
                None => bounded.await,
            };

            let Some(result) = outcome else {
                let deadline = deadline_at.map_or(Duration::ZERO, |(budget, _)| budget);
                warn!(
                    operation = %self.label,
                    attempts = attempt,
                    deadline_ms = duration_to_millis(deadline),
                    "Deadline reached during attempt"
                );
                self.count(|m| &m.retry_deadline_exceeded);
                return Err(RetryError::DeadlineExceeded {
                    attempts: attempt,
                    deadline,
                    last_error: None,
                });
            };

            let err = match result {
                Ok(value) => {
                    if attempt > 1 {
                        info!(
                            operation = %self.label,
                            retries = attempt - 1,
                            "Operation succeeded after {} retries",
                            attempt - 1
                        );
                        self.count(|m| &m.retry_recoveries);
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !self.policy.is_retryable(&err) {
                debug!(
                    operation = %self.label,
                    category = %err.category(),
                    error = %err,
                    "Error is not retryable"
                );
                return Err(RetryError::NonRetryable {
                    attempts: attempt,
                    source: err,
                });
            }

            if attempt >= max_attempts {
                warn!(
                    operation = %self.label,
                    attempts = attempt,
                    error = %err,
                    "Retries exhausted"
                );
                self.count(|m| &m.retry_exhaustions);
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    source: err,
                });
            }

            let mut wait = self.policy.delay_for(attempt - 1);
            if let Some(hint) = err.retry_after() {
                wait = wait.max(hint.min(self.policy.max_delay));
            }

            if let Some((deadline, at)) = deadline_at {
                if Instant::now() + wait >= at {
                    warn!(
                        operation = %self.label,
                        attempts = attempt,
                        deadline_ms = duration_to_millis(deadline),
                        "Next retry would exceed deadline"
                    );
                    self.count(|m| &m.retry_deadline_exceeded);
                    return Err(RetryError::DeadlineExceeded {
                        attempts: attempt,
                        deadline,
                        last_error: Some(err),
                    });
                }
            }

            debug!(
                operation = %self.label,
                attempt,
                max_attempts,
                delay_ms = wait.as_millis() as u64,
                error = %err,
                "Retrying after backoff"
            );
            self.count(|m| &m.retries);

            if !self.wait(wait).await {
                self.count(|m| &m.retry_cancellations);
                return Err(RetryError::Cancelled { attempts: attempt });
            }
        }
    }

    /// Run a synchronous operation under the same policy
    ///
    /// The closure runs on the calling task; waits between attempts remain
    /// cooperative.
    pub async fn run_blocking<T, E, F>(&self, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Result<T, E>,
        E: Classify + fmt::Display,
    {
        self.run(|| std::future::ready(op())).await
    }

    /// Sleep unless cancelled; false means cancelled
    async fn wait(&self, delay: Duration) -> bool {
        match &self.cancel {
            Some(token) => tokio::select! {
                () = token.cancelled() => false,
                () = tokio::time::sleep(delay) => true,
            },
            None => {
                tokio::time::sleep(delay).await;
                true
            }
        }
    }

    fn count(&self, pick: impl Fn(&ResilienceMetrics) -> &crate::metrics::Counter) {
        if let Some(metrics) = &self.metrics {
            pick(metrics).inc();
        }
    }
}

impl fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("policy", &self.policy)
            .field("service", &self.gate.as_ref().map(|g| g.service.as_str()))
            .field("label", &self.label)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ErrorCategory;
    use crate::health::{FnProbe, ProbeOutcome};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::exponential(max_attempts, Duration::from_millis(10), Duration::from_millis(50))
            .with_jitter(false)
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_uses_every_attempt() {
        let calls = AtomicU32::new(0);
        let metrics = Arc::new(ResilienceMetrics::new());
        let executor = RetryExecutor::new(fast_policy(4)).with_metrics(metrics.clone());

        let result: Result<(), _> = executor
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(AppError::network("connection reset")) }
            })
            .await;

        let err = result.unwrap_err();
        assert!(matches!(err, RetryError::Exhausted { attempts: 4, .. }));
        assert_eq!(err.attempts(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(metrics.retries.get(), 3);
        assert_eq!(metrics.retry_exhaustions.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_stops_after_one_attempt() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(fast_policy(10));

        let result: Result<(), _> = executor
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(AppError::validation("missing title")) }
            })
            .await;

        assert!(matches!(result, Err(RetryError::NonRetryable { attempts: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_retries() {
        let calls = AtomicU32::new(0);
        let metrics = Arc::new(ResilienceMetrics::new());
        let executor = RetryExecutor::new(fast_policy(5)).with_metrics(metrics.clone());

        let value = executor
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(AppError::database("deadlock detected"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 2);
        assert_eq!(metrics.retry_recoveries.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_blocking_shares_the_loop() {
        let mut calls = 0;
        let executor = RetryExecutor::new(fast_policy(3));

        let result: Result<(), _> = executor
            .run_blocking(|| {
                calls += 1;
                Err(AppError::external_service("object-storage", "503"))
            })
            .await;

        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 3, .. })));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_backoff() {
        let token = CancellationToken::new();
        let policy = RetryPolicy::exponential(5, Duration::from_secs(3600), Duration::from_secs(3600))
            .with_jitter(false);
        let executor = RetryExecutor::new(policy).with_cancellation(token.clone());

        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                token.cancel();
            })
        };

        let started = Instant::now();
        let result: Result<(), _> = executor
            .run(|| async { Err(AppError::network("down")) })
            .await;
        canceller.await.unwrap();

        let err = result.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.attempts(), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_pre_cancelled_token_never_runs() {
        let token = CancellationToken::new();
        token.cancel();
        let ran = AtomicBool::new(false);
        let executor = RetryExecutor::new(fast_policy(3)).with_cancellation(token);

        let result: Result<(), RetryError<AppError>> = executor
            .run(|| {
                ran.store(true, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Cancelled { attempts: 0 })));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_stops_before_long_backoff() {
        let policy = RetryPolicy::exponential(10, Duration::from_secs(2), Duration::from_secs(60))
            .with_jitter(false)
            .with_deadline(Duration::from_secs(1));
        let metrics = Arc::new(ResilienceMetrics::new());
        let executor = RetryExecutor::new(policy).with_metrics(metrics.clone());

        let result: Result<(), _> = executor
            .run(|| async { Err(AppError::network("down")) })
            .await;

        match result {
            Err(RetryError::DeadlineExceeded {
                attempts: 1,
                last_error: Some(err),
                ..
            }) => assert_eq!(err.category(), ErrorCategory::Network),
            other => panic!("expected deadline with last error, got {other:?}"),
        }
        assert_eq!(metrics.retry_deadline_exceeded.get(), 1);
        assert_eq!(metrics.retry_cancellations.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cuts_off_a_hung_attempt() {
        let policy = RetryPolicy::exponential(3, Duration::from_millis(10), Duration::from_millis(50))
            .with_jitter(false)
            .with_deadline(Duration::from_secs(1));
        let metrics = Arc::new(ResilienceMetrics::new());
        let executor = RetryExecutor::new(policy).with_metrics(metrics.clone());
        let calls = AtomicU32::new(0);

        let started = Instant::now();
        let result: Result<(), RetryError<AppError>> = executor
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                }
            })
            .await;

        let err = result.unwrap_err();
        assert!(matches!(
            err,
            RetryError::DeadlineExceeded {
                attempts: 1,
                last_error: None,
                ..
            }
        ));
        assert_eq!(Classify::kind(&err), ErrorKind::Timeout);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() <= Duration::from_secs(2));
        assert_eq!(metrics.retry_deadline_exceeded.get(), 1);

        let app: AppError = err.into();
        assert_eq!(app.kind(), ErrorKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_spans_attempts_and_backoff() {
        let policy = RetryPolicy::exponential(10, Duration::from_millis(100), Duration::from_millis(100))
            .with_jitter(false)
            .with_deadline(Duration::from_secs(1));
        let executor = RetryExecutor::new(policy);
        let calls = AtomicU32::new(0);

        let result: Result<(), RetryError<AppError>> = executor
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Err(AppError::network("slow and down"))
                }
            })
            .await;

        // Attempts start at 0, 400ms and 800ms; the third is cut off at 1s.
        assert!(matches!(
            result,
            Err(RetryError::DeadlineExceeded {
                attempts: 3,
                last_error: None,
                ..
            })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_gate_aborts_with_health_error() {
        let clock = ManualClock::shared();
        let monitor = Arc::new(ServiceHealthMonitor::new(Duration::from_secs(30), clock));
        monitor.register_probe(
            "cache-service",
            Arc::new(FnProbe::new(|| async {
                Ok::<_, anyhow::Error>(ProbeOutcome::unhealthy("connection refused"))
            })),
        );

        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(fast_policy(5)).with_health_gate(
            monitor,
            "cache-service",
            "warm-lookup",
        );

        let result: Result<(), _> = executor
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(AppError::external_service("cache-service", "timeout")) }
            })
            .await;

        match result {
            Err(RetryError::Unavailable { attempts, source }) => {
                assert_eq!(attempts, 1);
                assert_eq!(source.detail_str("operation"), Some("warm-lookup"));
                assert_eq!(source.category(), ErrorCategory::ExternalService);
            }
            other => panic!("expected Unavailable, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retry_error_into_app_error_keeps_attempts() {
        let err: AppError = RetryError::Exhausted {
            attempts: 3,
            source: AppError::network("reset"),
        }
        .into();
        assert_eq!(err.category(), ErrorCategory::Network);
        assert_eq!(err.details().get("attempts"), Some(&serde_json::Value::from(3)));

        let cancelled: AppError = RetryError::<AppError>::Cancelled { attempts: 2 }.into();
        assert_eq!(cancelled.code(), "OPERATION_CANCELLED");
    }
}
