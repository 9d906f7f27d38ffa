use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Default first retry delay for the exponential policy (seconds).
pub const DEFAULT_BACKOFF_BASE_SECS: u64 = 10;
/// Default ceiling for the exponential policy (seconds).
pub const DEFAULT_BACKOFF_MAX_SECS: u64 = 3_600; // 1 hour
/// Upper bound accepted for any configured delay (30 days).
pub const MAX_BACKOFF_SECS: u64 = 30 * 24 * 3_600;

/// Delay inserted before a failed job becomes eligible again.
///
/// Every variant yields a strictly positive delay that never decreases as
/// the attempt count grows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Same delay after every failure.
    Fixed { secs: u64 },

    /// `base_secs * 2^(attempt - 1)`, capped at `max_secs`.
    ///
    /// Schedule with defaults: 10 s → 20 s → 40 s → … → 3600 s (cap).
    Exponential { base_secs: u64, max_secs: u64 },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base_secs: DEFAULT_BACKOFF_BASE_SECS,
            max_secs: DEFAULT_BACKOFF_MAX_SECS,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the next attempt, given how many attempts have run.
    ///
    /// `attempt` is clamped to at least 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        let secs = match *self {
            BackoffPolicy::Fixed { secs } => secs,
            BackoffPolicy::Exponential {
                base_secs,
                max_secs,
            } => {
                let exp = attempt.max(1) - 1;
                // 2^exp overflows long before any sane cap; saturate instead.
                let factor = 1u64.checked_shl(exp).unwrap_or(u64::MAX);
                base_secs.saturating_mul(factor).min(max_secs)
            }
        };
        Duration::from_secs(secs)
    }

    pub fn validate(&self) -> Result<()> {
        match *self {
            BackoffPolicy::Fixed { secs } if secs == 0 => Err(ConfigError::invalid(
                "queue.backoff.secs",
                "must be positive",
            )),
            BackoffPolicy::Exponential { base_secs, .. } if base_secs == 0 => Err(
                ConfigError::invalid("queue.backoff.base_secs", "must be positive"),
            ),
            BackoffPolicy::Exponential {
                base_secs,
                max_secs,
            } if max_secs < base_secs => Err(ConfigError::invalid(
                "queue.backoff.max_secs",
                "must not be smaller than base_secs",
            )),
            BackoffPolicy::Fixed { secs } if secs > MAX_BACKOFF_SECS => Err(
                ConfigError::invalid("queue.backoff.secs", "must be at most 30 days"),
            ),
            BackoffPolicy::Exponential { max_secs, .. } if max_secs > MAX_BACKOFF_SECS => Err(
                ConfigError::invalid("queue.backoff.max_secs", "must be at most 30 days"),
            ),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_until_cap() {
        let policy = BackoffPolicy::Exponential {
            base_secs: 5,
            max_secs: 60,
        };
        let delays: Vec<u64> = (1..=6).map(|n| policy.delay(n).as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 60, 60]);
    }

    #[test]
    fn exponential_is_non_decreasing_for_huge_attempts() {
        let policy = BackoffPolicy::default();
        let mut last = Duration::ZERO;
        for n in 0..200 {
            let d = policy.delay(n);
            assert!(d > Duration::ZERO);
            assert!(d >= last);
            last = d;
        }
        assert_eq!(last.as_secs(), DEFAULT_BACKOFF_MAX_SECS);
    }

    #[test]
    fn fixed_ignores_attempt() {
        let policy = BackoffPolicy::Fixed { secs: 7 };
        assert_eq!(policy.delay(1), policy.delay(9));
    }

    #[test]
    fn zero_delays_rejected() {
        assert!(BackoffPolicy::Fixed { secs: 0 }.validate().is_err());
        assert!(BackoffPolicy::Exponential {
            base_secs: 0,
            max_secs: 10
        }
        .validate()
        .is_err());
        assert!(BackoffPolicy::Exponential {
            base_secs: 10,
            max_secs: 5
        }
        .validate()
        .is_err());
        assert!(BackoffPolicy::default().validate().is_ok());
    }

    #[test]
    fn oversized_delays_rejected() {
        assert!(BackoffPolicy::Fixed {
            secs: MAX_BACKOFF_SECS + 1
        }
        .validate()
        .is_err());
        assert!(BackoffPolicy::Exponential {
            base_secs: 10,
            max_secs: u64::MAX
        }
        .validate()
        .is_err());
    }
}
