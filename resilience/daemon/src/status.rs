//! Status report written after every watch pass

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use resilience_core::{
    CircuitSnapshot, ErrorAlert, ErrorStatistics, HealthSummary, MetricsSnapshot, ResilienceContext,
    ServiceHealthCheck,
};

/// Everything an operator needs to see about the watched dependencies
#[derive(Debug, Serialize)]
pub struct StatusReport {
    /// When the report was produced
    pub generated_at: DateTime<Utc>,
    /// Daemon version
    pub version: &'static str,
    /// Watch pass number, starting at 1
    pub pass: u64,
    /// Aggregate health
    pub summary: HealthSummary,
    /// Latest check per service
    pub checks: Vec<ServiceHealthCheck>,
    /// Breaker state per dependency
    pub breakers: Vec<CircuitSnapshot>,
    /// Error counters
    pub errors: ErrorStatistics,
    /// Unresolved alerts
    pub alerts: Vec<ErrorAlert>,
    /// Resilience counters
    pub metrics: MetricsSnapshot,
}

impl StatusReport {
    /// Snapshot the context after pass `pass`
    pub fn collect(ctx: &ResilienceContext, pass: u64, checks: Vec<ServiceHealthCheck>) -> Self {
        Self {
            generated_at: Utc::now(),
            version: env!("CARGO_PKG_VERSION"),
            pass,
            summary: ctx.health().summary(),
            checks,
            breakers: ctx.breakers().snapshots(),
            errors: ctx.error_statistics(),
            alerts: ctx.active_alerts(),
            metrics: ctx.metrics().snapshot(),
        }
    }

    /// Write as pretty JSON, replacing `path` atomically
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be created or the file cannot be
    /// written or renamed.
    pub async fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create status directory: {parent:?}"))?;
        }

        let json = serde_json::to_vec_pretty(self).context("Failed to serialize status report")?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write status file: {tmp:?}"))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("Failed to move status file into place: {path:?}"))?;
        Ok(())
    }
}
