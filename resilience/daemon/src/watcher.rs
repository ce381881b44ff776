//! Watch loop
//!
//! ```text
//!   every interval (or once):
//!     check_all(force)          probe every dependency concurrently
//!       └─ per service
//!            healthy/degraded -> breaker success
//!            unhealthy        -> breaker failure + handle(service_unavailable)
//!     StatusReport              log summary, optionally write JSON
//! ```
//!
//! The loop exits when the context's shutdown token fires.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, warn};

use resilience_core::{ErrorContext, HealthStatus, ResilienceContext};

use crate::status::StatusReport;

/// Operation name used for health-check driven errors
const WATCH_OPERATION: &str = "health-watch";

/// Periodically probes every registered dependency
pub struct Watcher {
    ctx: Arc<ResilienceContext>,
    interval: Duration,
    status_file: Option<PathBuf>,
    passes: u64,
}

impl Watcher {
    /// Watcher probing every `interval`
    pub fn new(ctx: Arc<ResilienceContext>, interval: Duration, status_file: Option<PathBuf>) -> Self {
        Self {
            ctx,
            interval,
            status_file,
            passes: 0,
        }
    }

    /// Probe everything once and report
    ///
    /// # Errors
    ///
    /// Fails only if the status file cannot be written.
    pub async fn run_pass(&mut self) -> Result<StatusReport> {
        self.passes += 1;
        let checks = self.ctx.health().check_all(true).await;

        for check in &checks {
            let breaker = self.ctx.circuit_breaker(&format!("probe.{}", check.service));
            // An open breaker still lets the probe result through to handle().
            let permit = breaker.try_acquire().ok();
            match check.status {
                HealthStatus::Unhealthy => {
                    if let Some(permit) = permit {
                        permit.failure();
                    }
                    // Served from the entry check_all just cached.
                    if let Err(err) = self.ctx.ensure_available(&check.service, WATCH_OPERATION).await {
                        let context = ErrorContext::for_operation(check.service.clone(), WATCH_OPERATION)
                            .with_extra("pass", self.passes);
                        let result = self.ctx.handle(&err, context).await;
                        debug!(
                            service = %check.service,
                            alert_sent = result.alert_sent,
                            recovered = result.recovery_successful,
                            "Handled unhealthy dependency"
                        );
                    }
                }
                HealthStatus::Healthy | HealthStatus::Degraded => {
                    if let Some(permit) = permit {
                        permit.success();
                    }
                }
                HealthStatus::Unknown => drop(permit),
            }
        }

        let report = StatusReport::collect(&self.ctx, self.passes, checks);
        info!(
            pass = self.passes,
            total = report.summary.total,
            healthy = report.summary.healthy,
            degraded = report.summary.degraded,
            unhealthy = report.summary.unhealthy,
            availability = report.summary.availability_percentage,
            active_alerts = report.alerts.len(),
            "Health pass complete"
        );

        if let Some(path) = &self.status_file {
            report.write_to(path).await?;
            debug!(path = ?path, "Status file written");
        }

        Ok(report)
    }

    /// Run passes until shutdown (or a single pass when `once`)
    ///
    /// # Errors
    ///
    /// Fails if a status file write fails.
    pub async fn run(&mut self, once: bool) -> Result<()> {
        let shutdown = self.ctx.shutdown_token();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    info!(passes = self.passes, "Watch loop stopping");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            let pass = tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    warn!("Shutdown during health pass");
                    return Ok(());
                }
                result = self.run_pass() => result,
            };
            pass?;

            if once {
                return Ok(());
            }
        }
    }
}
