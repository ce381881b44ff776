//! Retry policy values

use std::collections::BTreeSet;
use std::time::Duration;

use crate::backoff::{self, BackoffMode};
use crate::error::{Classify, ErrorCategory};

/// Categories retried unless a policy says otherwise
pub const DEFAULT_RETRYABLE: [ErrorCategory; 4] = [
    ErrorCategory::ExternalService,
    ErrorCategory::Network,
    ErrorCategory::RateLimit,
    ErrorCategory::Database,
];

/// Immutable retry configuration for one call-site or dependency class
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first (at least 1)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Growth factor (exponential) or seconds added per attempt (linear)
    pub factor: f64,
    /// Delay ceiling
    pub max_delay: Duration,
    /// Add +/-10% noise to each delay
    pub jitter: bool,
    /// Growth mode
    pub mode: BackoffMode,
    /// Categories that may be retried
    pub retryable: BTreeSet<ErrorCategory>,
    /// Overall time budget for the whole call, across attempts
    pub deadline: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: true,
            mode: BackoffMode::Exponential,
            retryable: DEFAULT_RETRYABLE.into_iter().collect(),
            deadline: None,
        }
    }
}

impl RetryPolicy {
    /// Exponential policy with jitter and the default retryable set
    #[must_use]
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            ..Self::default()
        }
    }

    /// Single attempt, never retries
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Set the growth factor
    #[must_use]
    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    /// Enable or disable jitter
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the growth mode
    #[must_use]
    pub fn with_mode(mut self, mode: BackoffMode) -> Self {
        self.mode = mode;
        self
    }

    /// Replace the retryable category set
    #[must_use]
    pub fn retry_on(mut self, categories: impl IntoIterator<Item = ErrorCategory>) -> Self {
        self.retryable = categories.into_iter().collect();
        self
    }

    /// Set an overall deadline
    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Whether `err` may be retried under this policy
    pub fn is_retryable<E: Classify + ?Sized>(&self, err: &E) -> bool {
        self.retryable.contains(&err.category())
    }

    /// Wait after the failure of attempt `attempt` (zero-based)
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        backoff::delay(
            attempt,
            self.base_delay,
            self.factor,
            self.max_delay,
            self.jitter,
            self.mode,
        )
    }

    /// Effective attempt budget
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;

    #[test]
    fn test_default_retryable_set() {
        let policy = RetryPolicy::default();
        assert!(policy.is_retryable(&AppError::network("reset")));
        assert!(policy.is_retryable(&AppError::database("deadlock")));
        assert!(policy.is_retryable(&AppError::rate_limited("llm", None)));
        assert!(!policy.is_retryable(&AppError::validation("bad")));
        assert!(!policy.is_retryable(&AppError::processing("corrupt pdf")));
    }

    #[test]
    fn test_delay_for_uses_policy_shape() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_millis(300))
            .with_jitter(false);
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(300));
    }

    #[test]
    fn test_zero_attempts_still_runs_once() {
        let policy = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.attempts(), 1);
    }
}
