//! Alert deduplication
//!
//! Each `category:code` bucket holds the timestamps of recent occurrences
//! inside a sliding window. A bucket is pruned when it is touched; every
//! bucket is pruned once per window on whichever call happens to come first
//! after the window rolls over.
//!
//! With threshold `t`, occurrence `n` (within the window) alerts when:
//!
//! ```text
//! n == 1              first sighting
//! n == t              now a pattern
//! n > t && n % 2t == 0   still happening
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::clock::Clock;
use crate::error::AppError;

/// Default aggregation window
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(300);

/// Default pattern threshold
pub const DEFAULT_THRESHOLD: u32 = 3;

/// Result of observing one occurrence
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AlertDecision {
    /// Whether to raise an alert
    pub alert: bool,
    /// Occurrences in the window, including this one
    pub occurrences: usize,
}

struct Buckets {
    entries: HashMap<String, VecDeque<Instant>>,
    last_sweep: Instant,
}

/// Sliding-window alert deduplicator
pub struct ErrorAggregator {
    window: Duration,
    threshold: u32,
    state: Mutex<Buckets>,
    clock: Arc<dyn Clock>,
}

impl ErrorAggregator {
    /// Create with explicit window and threshold (threshold of 0 is treated as 1)
    pub fn new(window: Duration, threshold: u32, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            window,
            threshold: threshold.max(1),
            state: Mutex::new(Buckets {
                entries: HashMap::new(),
                last_sweep: now,
            }),
            clock,
        }
    }

    /// Whether `error` should raise an alert
    pub fn should_alert(&self, error: &AppError) -> bool {
        self.observe(&error.bucket_key()).alert
    }

    /// Record one occurrence under `key` and decide
    pub fn observe(&self, key: &str) -> AlertDecision {
        let now = self.clock.now();
        let window = self.window;
        let mut state = self.state.lock();

        if now.saturating_duration_since(state.last_sweep) >= window {
            state.entries.retain(|_, bucket| {
                prune(bucket, now, window);
                !bucket.is_empty()
            });
            state.last_sweep = now;
        }

        let bucket = state.entries.entry(key.to_string()).or_default();
        bucket.push_back(now);
        prune(bucket, now, window);
        let occurrences = bucket.len();

        AlertDecision {
            alert: self.decide(occurrences),
            occurrences,
        }
    }

    fn decide(&self, occurrences: usize) -> bool {
        let threshold = self.threshold as usize;
        occurrences == 1
            || occurrences == threshold
            || (occurrences > threshold && occurrences % (2 * threshold) == 0)
    }

    /// Occurrences currently in `key`'s window (without recording one)
    #[must_use]
    pub fn occurrences(&self, key: &str) -> usize {
        let now = self.clock.now();
        let state = self.state.lock();
        state.entries.get(key).map_or(0, |bucket| {
            bucket
                .iter()
                .filter(|t| now.saturating_duration_since(**t) <= self.window)
                .count()
        })
    }

    /// Number of live buckets
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Forget everything
    pub fn clear(&self) {
        self.state.lock().entries.clear();
    }
}

fn prune(bucket: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while bucket
        .front()
        .is_some_and(|t| now.saturating_duration_since(*t) > window)
    {
        bucket.pop_front();
    }
}

impl fmt::Debug for ErrorAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorAggregator")
            .field("window", &self.window)
            .field("threshold", &self.threshold)
            .field("buckets", &self.bucket_count())
            .finish()
    }
}
