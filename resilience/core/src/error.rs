//! Error Taxonomy
//!
//! Every domain error carries a fixed `(category, severity)` pair chosen where
//! it is constructed, plus a machine-stable code. The code defaults to
//! `CATEGORY_STATUSCODE` (for example `EXTERNAL_SERVICE_503`) and can be
//! overridden per error.
//!
//! Policy engines never downcast. They read [`Classify::category`] and
//! [`Classify::kind`] and compare enum values.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Detail key describing what a `path` detail points at
pub const PATH_KIND_DETAIL: &str = "path_kind";
/// [`PATH_KIND_DETAIL`] value for a directory
pub const PATH_KIND_DIRECTORY: &str = "directory";

// ============================================================================
// Category / Severity / Kind
// ============================================================================

/// Error category
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCategory {
    /// Malformed or rejected input
    Validation,
    /// Authentication or authorization failure
    Auth,
    /// Requested resource does not exist
    NotFound,
    /// Conflicting concurrent modification
    Conflict,
    /// Caller or upstream throttling
    RateLimit,
    /// An external dependency failed or is unavailable
    ExternalService,
    /// Database failure
    Database,
    /// Local file system failure
    FileSystem,
    /// Content processing failure
    Processing,
    /// Transport-level failure
    Network,
    /// Misconfiguration
    Configuration,
    /// Anything else
    Internal,
}

impl ErrorCategory {
    /// All categories, in declaration order
    pub const ALL: [ErrorCategory; 12] = [
        Self::Validation,
        Self::Auth,
        Self::NotFound,
        Self::Conflict,
        Self::RateLimit,
        Self::ExternalService,
        Self::Database,
        Self::FileSystem,
        Self::Processing,
        Self::Network,
        Self::Configuration,
        Self::Internal,
    ];

    /// Stable kebab-case name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Auth => "auth",
            Self::NotFound => "not-found",
            Self::Conflict => "conflict",
            Self::RateLimit => "rate-limit",
            Self::ExternalService => "external-service",
            Self::Database => "database",
            Self::FileSystem => "file-system",
            Self::Processing => "processing",
            Self::Network => "network",
            Self::Configuration => "configuration",
            Self::Internal => "internal",
        }
    }

    /// Prefix used for default error codes
    #[must_use]
    pub fn code_prefix(&self) -> String {
        self.as_str().replace('-', "_").to_uppercase()
    }

    /// Default severity for errors of this category
    #[must_use]
    pub fn default_severity(&self) -> ErrorSeverity {
        match self {
            Self::Validation | Self::NotFound => ErrorSeverity::Low,
            Self::Auth | Self::Conflict | Self::RateLimit | Self::Processing | Self::Network => {
                ErrorSeverity::Medium
            }
            Self::ExternalService | Self::Database | Self::FileSystem => ErrorSeverity::High,
            Self::Configuration | Self::Internal => ErrorSeverity::Critical,
        }
    }

    /// Default HTTP-style status code
    #[must_use]
    pub fn default_status(&self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::Auth => 401,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::RateLimit => 429,
            Self::Processing => 422,
            Self::Network => 502,
            Self::ExternalService => 503,
            Self::Database | Self::FileSystem | Self::Configuration | Self::Internal => 500,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error severity
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Recorded only
    Low,
    /// Recorded, alerts only on recurrence
    Medium,
    /// Logged loudly, never pages
    High,
    /// Pages an operator
    Critical,
}

impl ErrorSeverity {
    /// Lowercase name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Whether this severity should escalate to an operational page
    #[must_use]
    pub fn pages(&self) -> bool {
        matches!(self, Self::Critical)
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Finer-grained shape of an error, used by degradation whitelists
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// A dependency is known to be down (health gate or open breaker)
    ServiceUnavailable,
    /// The operation exceeded its time budget
    Timeout,
    /// A connection could not be established or was dropped
    Connection,
    /// Anything not covered above
    Other,
}

impl ErrorKind {
    /// Kinds that graceful degradation absorbs by default
    pub const DEGRADABLE: [ErrorKind; 3] = [Self::ServiceUnavailable, Self::Timeout, Self::Connection];
}

/// Classification seam read by the retry engine and degradation wrapper
pub trait Classify {
    /// Error category
    fn category(&self) -> ErrorCategory;

    /// Error kind
    fn kind(&self) -> ErrorKind {
        ErrorKind::Other
    }

    /// Server-suggested wait before the next attempt
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

// ============================================================================
// AppError
// ============================================================================

/// Structured domain error
#[derive(Clone, Debug, Error)]
#[error("{message}")]
pub struct AppError {
    category: ErrorCategory,
    severity: ErrorSeverity,
    kind: ErrorKind,
    status: u16,
    code: String,
    message: String,
    user_message: String,
    details: BTreeMap<String, Value>,
    suggestions: Vec<String>,
}

impl AppError {
    /// Create an error with category defaults for severity, status and code
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        let status = category.default_status();
        Self {
            category,
            severity: category.default_severity(),
            kind: ErrorKind::Other,
            status,
            code: format!("{}_{status}", category.code_prefix()),
            message: message.into(),
            user_message: default_user_message(category).to_string(),
            details: BTreeMap::new(),
            suggestions: Vec::new(),
        }
    }

    /// Rejected input
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Validation, message)
            .with_suggestion("Check the request parameters and try again")
    }

    /// Authentication/authorization failure
    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Auth, message)
    }

    /// Missing resource
    pub fn not_found(resource: impl Into<String>) -> Self {
        let resource = resource.into();
        Self::new(ErrorCategory::NotFound, format!("{resource} not found"))
            .with_detail("resource", resource)
    }

    /// Conflicting modification
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Conflict, message)
    }

    /// Throttled, optionally with a server-provided wait
    pub fn rate_limited(service: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let service = service.into();
        let mut err = Self::new(ErrorCategory::RateLimit, format!("{service} rate limit exceeded"))
            .with_detail("service", service)
            .with_suggestion("Wait a moment before retrying");
        if let Some(wait) = retry_after {
            err = err.with_detail("retry_after_ms", wait.as_millis() as u64);
        }
        err
    }

    /// Generic failure of an external dependency
    pub fn external_service(service: impl Into<String>, message: impl Into<String>) -> Self {
        let service = service.into();
        Self::new(ErrorCategory::ExternalService, message).with_detail("service", service)
    }

    /// A dependency is down according to its health probe
    pub fn service_unavailable(
        service: impl Into<String>,
        operation: impl Into<String>,
        health_details: BTreeMap<String, Value>,
    ) -> Self {
        let service = service.into();
        let operation = operation.into();
        let mut err = Self::new(
            ErrorCategory::ExternalService,
            format!("{service} is unavailable for {operation}"),
        )
        .with_kind(ErrorKind::ServiceUnavailable)
        .with_code("EXTERNAL_SERVICE_UNAVAILABLE")
        .with_user_message("A required service is temporarily unavailable")
        .with_detail("service", service)
        .with_detail("operation", operation)
        .with_suggestion("Retry in a few moments")
        .with_suggestion("Check the service status endpoint");
        if !health_details.is_empty() {
            err = err.with_detail("health", Value::Object(health_details.into_iter().collect()));
        }
        err
    }

    /// Operation exceeded its time budget
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        let operation = operation.into();
        Self::new(
            ErrorCategory::ExternalService,
            format!("{operation} timed out after {after:?}"),
        )
        .with_kind(ErrorKind::Timeout)
        .with_severity(ErrorSeverity::Medium)
        .with_status(504)
        .with_detail("operation", operation)
        .with_detail("timeout_ms", after.as_millis() as u64)
        .with_suggestion("Retry the request")
    }

    /// Connection could not be established
    pub fn connection(service: impl Into<String>, message: impl Into<String>) -> Self {
        let service = service.into();
        Self::new(ErrorCategory::Network, message)
            .with_kind(ErrorKind::Connection)
            .with_severity(ErrorSeverity::High)
            .with_detail("service", service)
            .with_suggestion("Check network connectivity")
    }

    /// Database failure
    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Database, message)
    }

    /// File system failure at `path`
    pub fn file_system(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::FileSystem, message).with_detail("path", path.into())
    }

    /// A directory the operation needs does not exist
    ///
    /// Marks `path` itself as a directory, so file-system recovery recreates
    /// it rather than its parent.
    pub fn missing_directory(path: impl Into<String>) -> Self {
        let path = path.into();
        Self::new(ErrorCategory::FileSystem, format!("directory missing: {path}"))
            .with_detail("path", path)
            .with_detail(PATH_KIND_DETAIL, PATH_KIND_DIRECTORY)
    }

    /// Content processing failure
    pub fn processing(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Processing, message)
    }

    /// Transport failure
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Network, message)
    }

    /// Misconfiguration
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Configuration, message)
    }

    /// Unexpected internal failure
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Internal, message)
    }

    // ------------------------------------------------------------------------
    // Builders
    // ------------------------------------------------------------------------

    /// Override severity
    #[must_use]
    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    /// Override kind
    #[must_use]
    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = kind;
        self
    }

    /// Override status code; the default code follows unless it was overridden
    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        let default_code = format!("{}_{}", self.category.code_prefix(), self.status);
        if self.code == default_code {
            self.code = format!("{}_{status}", self.category.code_prefix());
        }
        self.status = status;
        self
    }

    /// Override the machine-stable code
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    /// Override the user-facing message
    #[must_use]
    pub fn with_user_message(mut self, message: impl Into<String>) -> Self {
        self.user_message = message.into();
        self
    }

    /// Attach a structured detail
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Append a recovery suggestion
    #[must_use]
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// Category
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    /// Severity
    #[must_use]
    pub fn severity(&self) -> ErrorSeverity {
        self.severity
    }

    /// Kind
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Status code
    #[must_use]
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Machine-stable code
    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Internal message
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// User-safe message
    #[must_use]
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Structured details
    #[must_use]
    pub fn details(&self) -> &BTreeMap<String, Value> {
        &self.details
    }

    /// Recovery suggestions
    #[must_use]
    pub fn suggestions(&self) -> &[String] {
        &self.suggestions
    }

    /// String detail lookup
    #[must_use]
    pub fn detail_str(&self, key: &str) -> Option<&str> {
        self.details.get(key).and_then(Value::as_str)
    }

    /// Service named in the details, if any
    #[must_use]
    pub fn service(&self) -> Option<&str> {
        self.detail_str("service")
    }

    /// Aggregation bucket key: `category:code`
    #[must_use]
    pub fn bucket_key(&self) -> String {
        format!("{}:{}", self.category, self.code)
    }

    /// Render for a caller
    ///
    /// Production responses omit the internal message and details.
    #[must_use]
    pub fn to_response(&self, production: bool) -> ErrorResponse {
        ErrorResponse {
            code: self.code.clone(),
            category: self.category,
            status: self.status,
            message: self.user_message.clone(),
            suggestions: self.suggestions.clone(),
            debug_message: (!production).then(|| self.message.clone()),
            details: (!production && !self.details.is_empty()).then(|| self.details.clone()),
        }
    }
}

impl Classify for AppError {
    fn category(&self) -> ErrorCategory {
        self.category
    }

    fn kind(&self) -> ErrorKind {
        self.kind
    }

    fn retry_after(&self) -> Option<Duration> {
        self.details
            .get("retry_after_ms")
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        match err.kind() {
            Io::NotFound | Io::PermissionDenied | Io::AlreadyExists => {
                Self::new(ErrorCategory::FileSystem, err.to_string())
            }
            Io::ConnectionRefused | Io::ConnectionReset | Io::ConnectionAborted | Io::NotConnected => {
                Self::new(ErrorCategory::Network, err.to_string())
                    .with_kind(ErrorKind::Connection)
                    .with_severity(ErrorSeverity::High)
            }
            Io::TimedOut => Self::new(ErrorCategory::Network, err.to_string())
                .with_kind(ErrorKind::Timeout)
                .with_status(504),
            _ => Self::internal(err.to_string()),
        }
    }
}

fn default_user_message(category: ErrorCategory) -> &'static str {
    match category {
        ErrorCategory::Validation => "The request was invalid",
        ErrorCategory::Auth => "You are not authorized to perform this action",
        ErrorCategory::NotFound => "The requested resource was not found",
        ErrorCategory::Conflict => "The resource was modified by another request",
        ErrorCategory::RateLimit => "Too many requests, please slow down",
        ErrorCategory::ExternalService => "An upstream service failed",
        ErrorCategory::Database => "A storage error occurred",
        ErrorCategory::FileSystem => "A file could not be accessed",
        ErrorCategory::Processing => "The content could not be processed",
        ErrorCategory::Network => "A network error occurred",
        ErrorCategory::Configuration => "The service is misconfigured",
        ErrorCategory::Internal => "An internal error occurred",
    }
}

// ============================================================================
// Caller-facing response
// ============================================================================

/// Serializable error body for callers
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-stable code
    pub code: String,
    /// Category
    pub category: ErrorCategory,
    /// Status code
    pub status: u16,
    /// User-safe message
    pub message: String,
    /// Recovery suggestions
    pub suggestions: Vec<String>,
    /// Internal message (non-production only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_message: Option<String>,
    /// Structured details (non-production only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<BTreeMap<String, Value>>,
}
