//! Alerts and alert handlers

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{AppError, ErrorCategory, ErrorSeverity};

/// Alert urgency
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    /// Low severity
    Info,
    /// Medium severity
    Warning,
    /// High severity
    Error,
    /// Critical severity; pages
    Critical,
}

impl From<ErrorSeverity> for AlertLevel {
    fn from(severity: ErrorSeverity) -> Self {
        match severity {
            ErrorSeverity::Low => Self::Info,
            ErrorSeverity::Medium => Self::Warning,
            ErrorSeverity::High => Self::Error,
            ErrorSeverity::Critical => Self::Critical,
        }
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        })
    }
}

/// An alert raised for a recurring or new error
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorAlert {
    /// Alert id
    pub id: Uuid,
    /// Urgency
    pub level: AlertLevel,
    /// Short title
    pub title: String,
    /// Error message
    pub message: String,
    /// Affected service
    pub service: Option<String>,
    /// Error category
    pub category: ErrorCategory,
    /// Error code
    pub code: String,
    /// Occurrences in the aggregation window when raised
    pub occurrences: usize,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Whether resolved
    pub resolved: bool,
    /// Resolution time
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ErrorAlert {
    /// Build an alert for `error`
    #[must_use]
    pub fn for_error(error: &AppError, service: Option<String>, occurrences: usize) -> Self {
        let title = match &service {
            Some(service) => format!("{} error in {service} ({})", error.category(), error.code()),
            None => format!("{} error ({})", error.category(), error.code()),
        };
        Self {
            id: Uuid::new_v4(),
            level: error.severity().into(),
            title,
            message: error.message().to_string(),
            service,
            category: error.category(),
            code: error.code().to_string(),
            occurrences,
            created_at: Utc::now(),
            resolved: false,
            resolved_at: None,
        }
    }

    /// Stamp resolution; false if already resolved
    pub fn resolve(&mut self) -> bool {
        if self.resolved {
            return false;
        }
        self.resolved = true;
        self.resolved_at = Some(Utc::now());
        true
    }
}

/// Receives alerts
///
/// Handlers run one after another for each alert. A failing handler is
/// logged and skipped.
#[async_trait]
pub trait AlertHandler: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Deliver one alert
    async fn handle(&self, alert: &ErrorAlert) -> anyhow::Result<()>;
}

/// Logs alerts at a level matching their urgency
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAlertHandler;

#[async_trait]
impl AlertHandler for TracingAlertHandler {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn handle(&self, alert: &ErrorAlert) -> anyhow::Result<()> {
        let service = alert.service.as_deref().unwrap_or("-");
        match alert.level {
            AlertLevel::Critical | AlertLevel::Error => error!(
                alert_id = %alert.id,
                level = %alert.level,
                service,
                code = %alert.code,
                occurrences = alert.occurrences,
                "{}", alert.title
            ),
            AlertLevel::Warning => warn!(
                alert_id = %alert.id,
                service,
                code = %alert.code,
                occurrences = alert.occurrences,
                "{}", alert.title
            ),
            AlertLevel::Info => info!(
                alert_id = %alert.id,
                service,
                code = %alert.code,
                "{}", alert.title
            ),
        }
        Ok(())
    }
}

/// Forwards alerts over a channel
#[derive(Clone, Debug)]
pub struct ChannelAlertHandler {
    tx: mpsc::Sender<ErrorAlert>,
}

impl ChannelAlertHandler {
    /// Handler plus the receiving end
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ErrorAlert>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl AlertHandler for ChannelAlertHandler {
    fn name(&self) -> &str {
        "channel"
    }

    async fn handle(&self, alert: &ErrorAlert) -> anyhow::Result<()> {
        self.tx
            .send(alert.clone())
            .await
            .map_err(|_| anyhow::anyhow!("alert channel closed"))
    }
}
