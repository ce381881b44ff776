//! Pluggable health probes

use std::collections::BTreeMap;
use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;

use super::HealthStatus;

/// What a probe observed
#[derive(Clone, Debug, PartialEq)]
pub struct ProbeOutcome {
    /// Observed status
    pub status: HealthStatus,
    /// Reason for a non-healthy status
    pub error: Option<String>,
    /// Probe-specific details (versions, queue depth, ...)
    pub details: BTreeMap<String, Value>,
}

impl ProbeOutcome {
    /// Dependency is fully working
    #[must_use]
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            error: None,
            details: BTreeMap::new(),
        }
    }

    /// Dependency works with reduced guarantees
    pub fn degraded(reason: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Degraded,
            error: Some(reason.into()),
            details: BTreeMap::new(),
        }
    }

    /// Dependency is down
    pub fn unhealthy(reason: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            error: Some(reason.into()),
            details: BTreeMap::new(),
        }
    }

    /// Attach a detail
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

/// Health check for one dependency
///
/// Returning `Err` is equivalent to reporting `unhealthy`; the monitor never
/// propagates probe failures.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe the dependency once
    async fn check(&self) -> anyhow::Result<ProbeOutcome>;
}

/// Adapts an async closure into a [`HealthProbe`]
pub struct FnProbe<F> {
    f: F,
}

impl<F> FnProbe<F> {
    /// Wrap `f`
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> HealthProbe for FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<ProbeOutcome>> + Send,
{
    async fn check(&self) -> anyhow::Result<ProbeOutcome> {
        (self.f)().await
    }
}

impl<F> std::fmt::Debug for FnProbe<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FnProbe")
    }
}
