//! Explicit retry policies.
//!
//! Stages that call upstream services take a [`RetryPolicy`] value instead
//! of relying on client-library defaults. The policy only computes delays;
//! the async runtime that sleeps between attempts lives in the app crate.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// One attempt, no retries.
    None,
    /// Up to `retries` additional attempts with exponential backoff
    /// starting at `base_delay_ms` and capped at `max_delay_ms`.
    Backoff {
        retries: u32,
        base_delay_ms: u64,
        max_delay_ms: u64,
    },
}

impl RetryPolicy {
    /// Exponential backoff with a 1s base capped at 32s.
    pub fn backoff(retries: u32) -> Self {
        if retries == 0 {
            RetryPolicy::None
        } else {
            RetryPolicy::Backoff {
                retries,
                base_delay_ms: 1000,
                max_delay_ms: 32_000,
            }
        }
    }

    /// Total attempts, including the first.
    pub fn max_attempts(&self) -> u32 {
        match self {
            RetryPolicy::None => 1,
            RetryPolicy::Backoff { retries, .. } => retries.saturating_add(1),
        }
    }

    /// Delay before attempt `attempt` (0-based). The first attempt never waits.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        match self {
            RetryPolicy::None => Duration::ZERO,
            RetryPolicy::Backoff {
                base_delay_ms,
                max_delay_ms,
                ..
            } => {
                if attempt == 0 {
                    return Duration::ZERO;
                }
                let factor = 1u64 << (attempt - 1).min(16);
                Duration::from_millis(base_delay_ms.saturating_mul(factor).min(*max_delay_ms))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_is_single_attempt() {
        let p = RetryPolicy::backoff(0);
        assert_eq!(p, RetryPolicy::None);
        assert_eq!(p.max_attempts(), 1);
    }

    #[test]
    fn test_backoff_delays() {
        let p = RetryPolicy::backoff(7);
        assert_eq!(p.max_attempts(), 8);
        assert_eq!(p.delay_before(0), Duration::ZERO);
        assert_eq!(p.delay_before(1), Duration::from_secs(1));
        assert_eq!(p.delay_before(2), Duration::from_secs(2));
        assert_eq!(p.delay_before(4), Duration::from_secs(8));
        assert_eq!(p.delay_before(7), Duration::from_secs(32));
    }
}
