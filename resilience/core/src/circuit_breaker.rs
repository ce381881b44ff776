//! Circuit Breaker
//!
//! Per-operation state machine that stops calling an operation that keeps
//! failing.
//!
//! ```text
//! +--------+   failures >= threshold   +------+   recovery_timeout elapsed   +-----------+
//! | Closed | ------------------------> | Open | ---------------------------> | Half-Open |
//! +--------+                           +------+   (on the next call)         +-----------+
//!     ^                                   ^                                       |
//!     |             trial succeeds        |          trial fails                  |
//!     +-----------------------------------+---------------------------------------+
//! ```
//!
//! Half-open admits exactly one trial call; concurrent callers are rejected
//! until the trial reports. State lives in atomics so the breaker can be
//! shared freely behind an `Arc`.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::{duration_to_millis, Clock};
use crate::error::{AppError, Classify, ErrorCategory, ErrorKind};
use crate::metrics::ResilienceMetrics;

const STATE_CLOSED: u32 = 0;
const STATE_OPEN: u32 = 1;
const STATE_HALF_OPEN: u32 = 2;

const NO_FAILURE: u64 = u64::MAX;

// ============================================================================
// State / Config
// ============================================================================

/// Breaker state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Calls pass through
    #[default]
    Closed,
    /// Calls are rejected without running
    Open,
    /// One trial call is allowed
    HalfOpen,
}

impl CircuitState {
    fn from_raw(raw: u32) -> Self {
        match raw {
            STATE_OPEN => Self::Open,
            STATE_HALF_OPEN => Self::HalfOpen,
            _ => Self::Closed,
        }
    }

    fn raw(self) -> u32 {
        match self {
            Self::Closed => STATE_CLOSED,
            Self::Open => STATE_OPEN,
            Self::HalfOpen => STATE_HALF_OPEN,
        }
    }
}

/// Breaker thresholds
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    /// Time the breaker stays open before admitting a trial call
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Outcome of a guarded call that did not produce a value
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    /// Rejected without running the operation
    #[error("circuit '{name}' is open, retry in {retry_in:?}")]
    Open {
        /// Breaker name
        name: String,
        /// Time until a trial call may be admitted
        retry_in: Duration,
    },

    /// The operation ran and failed
    #[error(transparent)]
    Inner(E),
}

impl<E> CircuitError<E> {
    /// Whether the call was rejected by an open breaker
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

impl<E: Classify> Classify for CircuitError<E> {
    fn category(&self) -> ErrorCategory {
        match self {
            Self::Open { .. } => ErrorCategory::ExternalService,
            Self::Inner(e) => e.category(),
        }
    }

    fn kind(&self) -> ErrorKind {
        match self {
            Self::Open { .. } => ErrorKind::ServiceUnavailable,
            Self::Inner(e) => e.kind(),
        }
    }
}

impl From<CircuitError<AppError>> for AppError {
    fn from(err: CircuitError<AppError>) -> Self {
        match err {
            CircuitError::Open { name, retry_in } => AppError::new(
                ErrorCategory::ExternalService,
                format!("circuit '{name}' is open"),
            )
            .with_kind(ErrorKind::ServiceUnavailable)
            .with_code("CIRCUIT_OPEN")
            .with_user_message("A required service is temporarily unavailable")
            .with_detail("circuit", name)
            .with_detail("retry_in_ms", duration_to_millis(retry_in))
            .with_suggestion("Retry after the recovery window"),
            CircuitError::Inner(inner) => inner,
        }
    }
}

// ============================================================================
// Breaker
// ============================================================================

/// One breaker guarding one operation
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: AtomicU32,
    failure_count: AtomicU32,
    /// Millis since `origin`, or `NO_FAILURE`
    last_failure_ms: AtomicU64,
    trial_in_flight: AtomicBool,
    origin: Instant,
    clock: Arc<dyn Clock>,
    metrics: Option<Arc<ResilienceMetrics>>,
}

impl CircuitBreaker {
    /// Create a closed breaker
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            config,
            state: AtomicU32::new(STATE_CLOSED),
            failure_count: AtomicU32::new(0),
            last_failure_ms: AtomicU64::new(NO_FAILURE),
            trial_in_flight: AtomicBool::new(false),
            origin: clock.now(),
            clock,
            metrics: None,
        }
    }

    /// Report into shared metrics
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<ResilienceMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Breaker name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Thresholds
    #[must_use]
    pub fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> CircuitState {
        CircuitState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Consecutive failures
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Acquire)
    }

    fn now_millis(&self) -> u64 {
        self.clock.millis_since(self.origin)
    }

    fn since_last_failure(&self) -> Option<Duration> {
        let last = self.last_failure_ms.load(Ordering::Acquire);
        (last != NO_FAILURE).then(|| Duration::from_millis(self.now_millis().saturating_sub(last)))
    }

    fn retry_in(&self) -> Duration {
        let elapsed = self.since_last_failure().unwrap_or(Duration::ZERO);
        self.config.recovery_timeout.saturating_sub(elapsed)
    }

    /// Ask to run one call
    ///
    /// Moves an expired open breaker to half-open. The returned permit must
    /// be resolved with [`CallPermit::success`] or [`CallPermit::failure`];
    /// dropping it unresolved releases a half-open trial slot without
    /// changing state.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, Duration> {
        match self.state() {
            CircuitState::Closed => Ok(CallPermit::new(self, false)),
            CircuitState::Open => {
                let retry_in = self.retry_in();
                if !retry_in.is_zero() {
                    return Err(self.reject(retry_in));
                }
                if self
                    .state
                    .compare_exchange(STATE_OPEN, STATE_HALF_OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    info!(circuit = %self.name, "Circuit breaker transitioning to half-open");
                }
                self.acquire_trial()
            }
            CircuitState::HalfOpen => self.acquire_trial(),
        }
    }

    fn acquire_trial(&self) -> Result<CallPermit<'_>, Duration> {
        if self
            .trial_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // State may have moved while we raced for the slot.
            if self.state() == CircuitState::HalfOpen {
                debug!(circuit = %self.name, "Admitting half-open trial call");
                return Ok(CallPermit::new(self, true));
            }
            self.trial_in_flight.store(false, Ordering::Release);
            if self.state() == CircuitState::Closed {
                return Ok(CallPermit::new(self, false));
            }
        }
        Err(self.reject(self.retry_in()))
    }

    fn reject(&self, retry_in: Duration) -> Duration {
        if let Some(metrics) = &self.metrics {
            metrics.breaker_rejections.inc();
        }
        debug!(circuit = %self.name, retry_in_ms = duration_to_millis(retry_in), "Circuit open, call rejected");
        retry_in
    }

    /// Record a successful call made outside a half-open trial
    ///
    /// Resets the failure count while closed. A late success that lands
    /// after the breaker opened leaves the state alone.
    pub fn record_success(&self) {
        self.on_success(false);
    }

    /// Record a failed call made outside a half-open trial
    pub fn record_failure(&self) {
        self.on_failure(false);
    }

    fn on_success(&self, trial: bool) {
        if trial {
            let closed = self
                .state
                .compare_exchange(STATE_HALF_OPEN, STATE_CLOSED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
            if closed {
                self.failure_count.store(0, Ordering::Release);
                info!(circuit = %self.name, "Circuit breaker closed, operation recovered");
            }
            self.trial_in_flight.store(false, Ordering::Release);
            return;
        }

        match self.state() {
            CircuitState::Closed => self.failure_count.store(0, Ordering::Release),
            state => debug!(circuit = %self.name, state = ?state, "Ignoring success from a pre-trip call"),
        }
    }

    fn on_failure(&self, trial: bool) {
        let now = self.now_millis();

        if trial {
            let reopened = self
                .state
                .compare_exchange(STATE_HALF_OPEN, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
            if reopened {
                self.last_failure_ms.store(now, Ordering::Release);
                let failures = self.failure_count.fetch_add(1, Ordering::AcqRel).saturating_add(1);
                self.tripped(failures);
            }
            self.trial_in_flight.store(false, Ordering::Release);
            return;
        }

        if self.state() != CircuitState::Closed {
            debug!(circuit = %self.name, "Ignoring failure from a pre-trip call");
            return;
        }
        self.last_failure_ms.store(now, Ordering::Release);
        let failures = self.failure_count.fetch_add(1, Ordering::AcqRel).saturating_add(1);
        if failures >= self.config.failure_threshold
            && self
                .state
                .compare_exchange(STATE_CLOSED, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.tripped(failures);
        }
    }

    fn tripped(&self, failures: u32) {
        if let Some(metrics) = &self.metrics {
            metrics.breaker_trips.inc();
        }
        warn!(
            circuit = %self.name,
            consecutive_failures = failures,
            recovery_timeout_ms = duration_to_millis(self.config.recovery_timeout),
            "Circuit breaker opened"
        );
    }

    /// Run `op` through the breaker
    ///
    /// Every `Err` from `op` counts as a failure.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire().map_err(|retry_in| CircuitError::Open {
            name: self.name.clone(),
            retry_in,
        })?;

        match op().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(err) => {
                permit.failure();
                Err(CircuitError::Inner(err))
            }
        }
    }

    /// Force a state (operators and tests)
    pub fn force_state(&self, state: CircuitState) {
        match state {
            CircuitState::Closed => self.failure_count.store(0, Ordering::Release),
            CircuitState::Open => self.last_failure_ms.store(self.now_millis(), Ordering::Release),
            CircuitState::HalfOpen => {}
        }
        self.trial_in_flight.store(false, Ordering::Release);
        self.state.store(state.raw(), Ordering::Release);
        info!(circuit = %self.name, state = ?state, "Circuit breaker state forced");
    }

    /// Back to a fresh closed breaker
    pub fn reset(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
        self.failure_count.store(0, Ordering::Release);
        self.last_failure_ms.store(NO_FAILURE, Ordering::Release);
        self.trial_in_flight.store(false, Ordering::Release);
    }

    /// Serializable view
    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            name: self.name.clone(),
            state: self.state(),
            failure_count: self.failure_count(),
            failure_threshold: self.config.failure_threshold,
            recovery_timeout_ms: duration_to_millis(self.config.recovery_timeout),
            since_last_failure_ms: self.since_last_failure().map(duration_to_millis),
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("failure_count", &self.failure_count())
            .field("config", &self.config)
            .finish()
    }
}

/// Admission to run one guarded call
#[must_use = "resolve the permit with success() or failure()"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    resolved: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            resolved: false,
        }
    }

    /// Whether this is the half-open trial call
    #[must_use]
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// The call succeeded
    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.on_success(self.trial);
    }

    /// The call failed
    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.resolved {
            self.breaker.trial_in_flight.store(false, Ordering::Release);
        }
    }
}

/// Serializable breaker state
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    /// Breaker name
    pub name: String,
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures
    pub failure_count: u32,
    /// Failures that open the breaker
    pub failure_threshold: u32,
    /// Open duration before a trial
    pub recovery_timeout_ms: u64,
    /// Time since the last recorded failure
    pub since_last_failure_ms: Option<u64>,
}

// ============================================================================
// Registry
// ============================================================================

/// One breaker per operation key
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    defaults: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<ResilienceMetrics>,
}

impl CircuitBreakerRegistry {
    /// Empty registry
    pub fn new(defaults: CircuitBreakerConfig, clock: Arc<dyn Clock>, metrics: Arc<ResilienceMetrics>) -> Self {
        Self {
            breakers: DashMap::new(),
            defaults,
            clock,
            metrics,
        }
    }

    /// Breaker for `name` with default thresholds
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create_with(name, self.defaults)
    }

    /// Breaker for `name`; `config` applies only when it is first created
    pub fn get_or_create_with(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return Arc::clone(existing.value());
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(
                    CircuitBreaker::new(name, config, Arc::clone(&self.clock))
                        .with_metrics(Arc::clone(&self.metrics)),
                )
            })
            .clone()
    }

    /// Existing breaker
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| Arc::clone(b.value()))
    }

    /// Snapshots sorted by name
    #[must_use]
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut snaps: Vec<CircuitSnapshot> = self.breakers.iter().map(|b| b.snapshot()).collect();
        snaps.sort_by(|a, b| a.name.cmp(&b.name));
        snaps
    }

    /// Reset one breaker
    pub fn reset(&self, name: &str) -> bool {
        self.get(name).map(|b| b.reset()).is_some()
    }

    /// Reset every breaker
    pub fn reset_all(&self) {
        for breaker in &self.breakers {
            breaker.reset();
        }
    }
}

impl fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("breakers", &self.breakers.len())
            .field("defaults", &self.defaults)
            .finish()
    }
}
