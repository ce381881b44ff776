//! Automated recovery strategies, one per error category

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::ErrorContext;
use crate::error::{AppError, PATH_KIND_DETAIL, PATH_KIND_DIRECTORY};
use crate::health::{HealthStatus, ServiceHealthMonitor};

/// What a strategy did
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecoveryOutcome {
    /// Whether the dependency is believed healthy again
    pub succeeded: bool,
    /// Short description of the action taken
    pub action: String,
}

impl RecoveryOutcome {
    /// Recovery worked
    pub fn recovered(action: impl Into<String>) -> Self {
        Self {
            succeeded: true,
            action: action.into(),
        }
    }

    /// Recovery did not work (or nothing could be done)
    pub fn failed(action: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            action: action.into(),
        }
    }
}

/// Attempts to restore a dependency after an error
///
/// `Err` is treated as an unsuccessful recovery.
#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    /// Try to recover from `error`
    async fn recover(&self, error: &AppError, ctx: &ErrorContext) -> anyhow::Result<RecoveryOutcome>;
}

/// Resolve which service an error concerns
fn target_service<'a>(error: &'a AppError, ctx: &'a ErrorContext, fallback: &'a str) -> &'a str {
    ctx.service
        .as_deref()
        .or_else(|| error.service())
        .unwrap_or(fallback)
}

/// Force a fresh probe of `service`
async fn reprobe(monitor: &ServiceHealthMonitor, service: &str) -> HealthStatus {
    let check = monitor.check_health(service, true).await;
    debug!(service = %service, status = %check.status, "Recovery re-probe");
    check.status
}

// ============================================================================
// External service
// ============================================================================

/// Clear the service's cached health, wait, probe again
pub struct ExternalServiceRecovery {
    monitor: Arc<ServiceHealthMonitor>,
    settle: Duration,
}

impl ExternalServiceRecovery {
    /// Strategy waiting `settle` before the re-probe
    pub fn new(monitor: Arc<ServiceHealthMonitor>, settle: Duration) -> Self {
        Self { monitor, settle }
    }
}

#[async_trait]
impl RecoveryStrategy for ExternalServiceRecovery {
    async fn recover(&self, error: &AppError, ctx: &ErrorContext) -> anyhow::Result<RecoveryOutcome> {
        let Some(service) = ctx.service.as_deref().or_else(|| error.service()) else {
            return Ok(RecoveryOutcome::failed("no service named in error"));
        };

        self.monitor.clear_cache(Some(service));
        tokio::time::sleep(self.settle).await;

        Ok(match reprobe(&self.monitor, service).await {
            HealthStatus::Healthy | HealthStatus::Degraded => {
                info!(service = %service, "External service recovered");
                RecoveryOutcome::recovered(format!("re-probed {service}: available"))
            }
            status => RecoveryOutcome::failed(format!("re-probed {service}: {status}")),
        })
    }
}

// ============================================================================
// Database
// ============================================================================

/// Re-probe the database dependency
pub struct DatabaseRecovery {
    monitor: Arc<ServiceHealthMonitor>,
    service: String,
}

impl DatabaseRecovery {
    /// Strategy probing `service` when the error names none
    pub fn new(monitor: Arc<ServiceHealthMonitor>, service: impl Into<String>) -> Self {
        Self {
            monitor,
            service: service.into(),
        }
    }
}

#[async_trait]
impl RecoveryStrategy for DatabaseRecovery {
    async fn recover(&self, error: &AppError, ctx: &ErrorContext) -> anyhow::Result<RecoveryOutcome> {
        let service = target_service(error, ctx, &self.service);
        Ok(match reprobe(&self.monitor, service).await {
            HealthStatus::Unhealthy => RecoveryOutcome::failed(format!("{service} still unhealthy")),
            HealthStatus::Unknown => RecoveryOutcome::failed(format!("no probe for {service}")),
            _ => RecoveryOutcome::recovered(format!("{service} reachable")),
        })
    }
}

// ============================================================================
// File system
// ============================================================================

/// Recreate a missing directory, then re-probe storage
///
/// The `path` detail (or the context path) names a file unless the error
/// marks it as a directory with [`AppError::missing_directory`]. For a
/// file only its parent is created; the file itself is never touched.
pub struct FileSystemRecovery {
    monitor: Arc<ServiceHealthMonitor>,
    service: String,
}

impl FileSystemRecovery {
    /// Strategy re-probing `service` after repairing the path
    pub fn new(monitor: Arc<ServiceHealthMonitor>, service: impl Into<String>) -> Self {
        Self {
            monitor,
            service: service.into(),
        }
    }

    fn directory(error: &AppError, ctx: &ErrorContext) -> Option<PathBuf> {
        let path = error
            .detail_str("path")
            .map(PathBuf::from)
            .or_else(|| ctx.path.clone())?;
        if error.detail_str(PATH_KIND_DETAIL) == Some(PATH_KIND_DIRECTORY) {
            return Some(path);
        }
        path.parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(Path::to_path_buf)
    }
}

#[async_trait]
impl RecoveryStrategy for FileSystemRecovery {
    async fn recover(&self, error: &AppError, ctx: &ErrorContext) -> anyhow::Result<RecoveryOutcome> {
        let mut actions = Vec::new();
        let mut repaired = false;

        if let Some(dir) = Self::directory(error, ctx) {
            if !path_exists(&dir).await {
                tokio::fs::create_dir_all(&dir).await?;
                info!(path = %dir.display(), "Recreated missing directory");
                actions.push(format!("created {}", dir.display()));
                repaired = true;
            }
        }

        let service = target_service(error, ctx, &self.service);
        let status = reprobe(&self.monitor, service).await;
        actions.push(format!("{service}: {status}"));

        // Without a probe, only a repair made here counts as recovery.
        let recovered = match status {
            HealthStatus::Healthy | HealthStatus::Degraded => true,
            HealthStatus::Unknown => repaired,
            HealthStatus::Unhealthy => false,
        };
        let action = actions.join(", ");
        Ok(if recovered {
            RecoveryOutcome::recovered(action)
        } else {
            RecoveryOutcome::failed(action)
        })
    }
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

// ============================================================================
// Processing / Network
// ============================================================================

/// Nothing to automate; the caller must retry manually
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessingRecovery;

#[async_trait]
impl RecoveryStrategy for ProcessingRecovery {
    async fn recover(&self, _error: &AppError, _ctx: &ErrorContext) -> anyhow::Result<RecoveryOutcome> {
        Ok(RecoveryOutcome::failed("manual retry required"))
    }
}

/// Wait briefly and assume the transient fault has passed
#[derive(Clone, Copy, Debug)]
pub struct NetworkRecovery {
    settle: Duration,
}

impl NetworkRecovery {
    /// Strategy waiting `settle`
    #[must_use]
    pub fn new(settle: Duration) -> Self {
        Self { settle }
    }
}

#[async_trait]
impl RecoveryStrategy for NetworkRecovery {
    async fn recover(&self, _error: &AppError, _ctx: &ErrorContext) -> anyhow::Result<RecoveryOutcome> {
        tokio::time::sleep(self.settle).await;
        Ok(RecoveryOutcome::recovered("waited for transient network fault"))
    }
}
