//! Resilience Core - Service Health and Failure Handling for the Knowledge Backend
//!
//! Every call the document pipeline makes to an external dependency (cache,
//! task queue, object storage, database, LLM API, graph engine) can be
//! wrapped by the components in this crate.
//!
//! # Architecture
//!
//! ```text
//!   caller
//!     │
//!     ├── ensure_available(service, op) ──> ServiceHealthMonitor (cached probes)
//!     │
//!     ├── operation
//!     │     └─ wrap(retry)     RetryExecutor + Backoff, health-gated
//!     │     └─ wrap(breaker)   CircuitBreaker (closed / open / half-open)
//!     │     └─ wrap(degrade)   Degradation (fallback on whitelisted kinds)
//!     │
//!     └── on error ──> ErrorMonitoringService
//!                        ├─ history + counters
//!                        ├─ ErrorAggregator ──> AlertHandler(s)
//!                        └─ RecoveryStrategy (per category)
//! ```
//!
//! All of it hangs off one [`ResilienceContext`], built at start-up from a
//! [`ResilienceConfig`].
//!
//! # Quick Start
//!
//! ```ignore
//! use resilience_core::{load_config, AppError, DependencyClass, ErrorContext, ResilienceContext};
//!
//! let ctx = ResilienceContext::new(load_config()?);
//! ctx.ensure_available("llm-api", "summarize").await?;
//!
//! let summary = ctx
//!     .retry_for(DependencyClass::Llm, "summarize")
//!     .run(|| client.summarize(&doc))
//!     .await
//!     .map_err(AppError::from);
//!
//! if let Err(err) = &summary {
//!     ctx.handle(err, ErrorContext::for_operation("llm-api", "summarize")).await;
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`backoff`]: Delay calculation (exponential / linear, cap, jitter)
//! - [`circuit_breaker`]: Per-operation breakers and their registry
//! - [`clock`]: Monotonic time source, swappable in tests
//! - [`config`]: TOML / environment / CLI configuration
//! - [`context`]: The shared registry object
//! - [`degradation`]: Fallback wrapper
//! - [`dependency`]: Dependency classes and retry presets
//! - [`error`]: Error taxonomy
//! - [`health`]: Probes and the cached health monitor
//! - [`metrics`]: Counters and latency histograms
//! - [`monitoring`]: Error recording, alert aggregation, recovery
//! - [`retry`]: Retry policies and executor

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backoff;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod context;
pub mod degradation;
pub mod dependency;
pub mod error;
pub mod health;
pub mod metrics;
pub mod monitoring;
pub mod retry;

pub use backoff::BackoffMode;
pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitError, CircuitSnapshot,
    CircuitState,
};
pub use clock::{system_clock, Clock, ManualClock, SystemClock};
pub use context::ResilienceContext;
pub use degradation::Degradation;
pub use dependency::DependencyClass;
pub use error::{AppError, Classify, ErrorCategory, ErrorKind, ErrorResponse, ErrorSeverity};
pub use health::{
    FnProbe, HealthProbe, HealthStatus, HealthSummary, ProbeOutcome, ServiceHealthCheck, ServiceHealthMonitor,
};
pub use metrics::{MetricsSnapshot, ResilienceMetrics};
pub use monitoring::{
    AlertHandler, AlertLevel, ChannelAlertHandler, ErrorAggregator, ErrorAlert, ErrorContext,
    ErrorMonitoringService, ErrorRecord, ErrorStatistics, HandlingResult, RecoveryOutcome, RecoveryStrategy,
    TracingAlertHandler,
};
pub use retry::{RetryError, RetryExecutor, RetryPolicy};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides, ConfigSource,
    DependencyConfig, ProbeKind, ResilienceConfig, ResilienceToml,
};
