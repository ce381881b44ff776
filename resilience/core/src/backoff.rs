//! Backoff Calculator
//!
//! Pure delay computation for the retry engine.
//!
//! ```text
//! exponential:  base * factor^attempt      (capped)
//! linear:       base + factor*attempt secs (capped)
//! jitter:       +/- 10% uniform noise, clamped to >= 0
//! ```
//!
//! `attempt` is zero-based: attempt 0 is the wait after the first failure.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponent ceiling applied before the cap so huge attempt numbers cannot
/// overflow to infinity or NaN
const MAX_EXPONENT: u32 = 64;

/// Fraction of the computed delay used as the jitter band
const JITTER_FRACTION: f64 = 0.10;

/// How the delay grows between attempts
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffMode {
    /// `base * factor^attempt`
    #[default]
    Exponential,
    /// `base + factor * attempt` (factor in seconds)
    Linear,
}

/// Compute the delay before retry `attempt` (zero-based)
///
/// With `jitter == false` the result is deterministic.
#[must_use]
pub fn delay(
    attempt: u32,
    base: Duration,
    factor: f64,
    cap: Duration,
    jitter: bool,
    mode: BackoffMode,
) -> Duration {
    let computed = raw_delay_nanos(attempt, base, factor, cap, mode);

    let nanos = if jitter && computed > 0.0 {
        let noise = rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
        (computed + computed * noise).max(0.0)
    } else {
        computed
    };

    Duration::from_nanos(nanos.round() as u64)
}

fn raw_delay_nanos(attempt: u32, base: Duration, factor: f64, cap: Duration, mode: BackoffMode) -> f64 {
    let base = base.as_nanos() as f64;
    let cap = cap.as_nanos() as f64;
    let factor = if factor.is_finite() { factor.max(0.0) } else { 0.0 };

    let grown = match mode {
        BackoffMode::Exponential => {
            let exponent = attempt.min(MAX_EXPONENT);
            base * factor.powi(exponent as i32)
        }
        BackoffMode::Linear => base + factor * 1e9 * f64::from(attempt),
    };

    if grown.is_finite() {
        grown.clamp(0.0, cap)
    } else {
        cap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_millis(100);
    const CAP: Duration = Duration::from_millis(1_000);

    fn exp(attempt: u32) -> Duration {
        delay(attempt, BASE, 2.0, CAP, false, BackoffMode::Exponential)
    }

    #[test]
    fn test_exponential_growth_and_cap() {
        assert_eq!(exp(0), Duration::from_millis(100));
        assert_eq!(exp(1), Duration::from_millis(200));
        assert_eq!(exp(2), Duration::from_millis(400));
        assert_eq!(exp(3), Duration::from_millis(800));
        assert_eq!(exp(4), CAP);
    }

    #[test]
    fn test_exponential_monotonic_until_cap_then_flat() {
        let mut previous = Duration::ZERO;
        let mut capped_at = None;
        for attempt in 0..40 {
            let d = exp(attempt);
            assert!(d >= previous, "delay decreased at attempt {attempt}");
            if capped_at.is_some() {
                assert_eq!(d, CAP);
            } else if d == CAP {
                capped_at = Some(attempt);
            }
            previous = d;
        }
        assert_eq!(capped_at, Some(4));
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        assert_eq!(exp(u32::MAX), CAP);
        let d = delay(u32::MAX, Duration::ZERO, 10.0, CAP, false, BackoffMode::Exponential);
        assert_eq!(d, Duration::ZERO);
    }

    #[test]
    fn test_linear_growth() {
        let linear = |a| delay(a, BASE, 0.25, Duration::from_secs(1), false, BackoffMode::Linear);
        assert_eq!(linear(0), Duration::from_millis(100));
        assert_eq!(linear(1), Duration::from_millis(350));
        assert_eq!(linear(2), Duration::from_millis(600));
        assert_eq!(linear(10), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        for _ in 0..200 {
            let d = delay(2, BASE, 2.0, CAP, true, BackoffMode::Exponential);
            assert!(d >= Duration::from_millis(360), "too small: {d:?}");
            assert!(d <= Duration::from_millis(440), "too large: {d:?}");
        }
    }

    #[test]
    fn test_negative_factor_is_treated_as_zero() {
        let d = delay(3, BASE, -2.0, CAP, false, BackoffMode::Exponential);
        assert_eq!(d, Duration::ZERO);
    }
}
