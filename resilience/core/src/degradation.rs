//! Graceful degradation
//!
//! Substitutes a fallback when an operation fails with a whitelisted error
//! kind. Everything else propagates unchanged.
//!
//! Composition is explicit at the call site:
//!
//! ```ignore
//! let value = Degradation::default()
//!     .with_value(breaker.call(|| retry.run(fetch)), cached_default)
//!     .await?;
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;

use tracing::{debug, warn};

use crate::error::{Classify, ErrorKind};

/// Fallback wrapper scoped to a set of error kinds
#[derive(Clone, Debug)]
pub struct Degradation {
    whitelist: BTreeSet<ErrorKind>,
    label: String,
}

impl Default for Degradation {
    fn default() -> Self {
        Self::new(ErrorKind::DEGRADABLE)
    }
}

impl Degradation {
    /// Degrade only on `kinds`
    pub fn new(kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        Self {
            whitelist: kinds.into_iter().collect(),
            label: "operation".to_string(),
        }
    }

    /// Name used in log lines
    #[must_use]
    pub fn named(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Whether `err` would be absorbed
    pub fn degrades<E: Classify + ?Sized>(&self, err: &E) -> bool {
        self.whitelist.contains(&err.kind())
    }

    /// Return `fallback` on a whitelisted failure
    ///
    /// # Errors
    ///
    /// Returns the operation's error when its kind is not whitelisted.
    pub async fn with_value<T, E, Fut>(&self, op: Fut, fallback: T) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        match op.await {
            Ok(value) => Ok(value),
            Err(err) if self.degrades(&err) => {
                warn!(operation = %self.label, kind = ?err.kind(), error = %err, "Degrading to fallback value");
                Ok(fallback)
            }
            Err(err) => Err(err),
        }
    }

    /// Run `fallback` on a whitelisted failure
    ///
    /// # Errors
    ///
    /// Returns the operation's error when its kind is not whitelisted, or
    /// when the fallback itself fails. The fallback's own error is only
    /// logged.
    pub async fn with_operation<T, E, Fut, F, FFut, FE>(&self, op: Fut, fallback: F) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
        F: FnOnce() -> FFut,
        FFut: Future<Output = Result<T, FE>>,
        FE: fmt::Display,
    {
        let err = match op.await {
            Ok(value) => return Ok(value),
            Err(err) if self.degrades(&err) => err,
            Err(err) => return Err(err),
        };

        debug!(operation = %self.label, kind = ?err.kind(), error = %err, "Running fallback operation");
        match fallback().await {
            Ok(value) => {
                warn!(operation = %self.label, error = %err, "Degraded to fallback operation");
                Ok(value)
            }
            Err(fallback_err) => {
                warn!(
                    operation = %self.label,
                    error = %err,
                    fallback_error = %fallback_err,
                    "Fallback failed, propagating original error"
                );
                Err(err)
            }
        }
    }
}
