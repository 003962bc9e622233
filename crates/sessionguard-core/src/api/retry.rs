//! Failure classification and exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

use super::error::PipelineError;

/// Default number of attempts a call may make.
pub const DEFAULT_RETRY_BUDGET: u32 = 3;

/// Initial backoff delay. Doubled for every attempt already made.
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;

/// Upper bound of the uniform jitter added to each delay.
pub const DEFAULT_MAX_JITTER_MS: u64 = 1000;

/// Hard cap on any single delay.
pub const DEFAULT_MAX_DELAY_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts allowed, counting the first.
    pub budget: u32,
    pub base_delay: Duration,
    pub max_jitter: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            budget: DEFAULT_RETRY_BUDGET,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_jitter: Duration::from_millis(DEFAULT_MAX_JITTER_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    Stop,
}

impl RetryPolicy {
    /// Decide what to do after attempt number `attempt_count` (1-based) failed.
    ///
    /// Only transient failures are retried: no response at all, or a 5xx.
    pub fn should_retry(&self, err: &PipelineError, attempt_count: u32) -> RetryDecision {
        if attempt_count >= self.budget || !err.is_transient() {
            return RetryDecision::Stop;
        }
        RetryDecision::Retry(self.delay_for(attempt_count, self.sample_jitter()))
    }

    /// `min(base * 2^attempt_count + jitter, max_delay)`
    pub fn delay_for(&self, attempt_count: u32, jitter: Duration) -> Duration {
        // Attempts >= 32 saturate instead of overflowing the shift.
        let multiplier = 1u32.checked_shl(attempt_count).unwrap_or(u32::MAX);
        let exp_delay = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay);
        exp_delay.saturating_add(jitter).min(self.max_delay)
    }

    fn sample_jitter(&self) -> Duration {
        let max_ms = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_error() -> PipelineError {
        PipelineError::from_status(503, "unavailable")
    }

    #[test]
    fn test_delay_growth_and_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0, Duration::ZERO), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(1, Duration::ZERO), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(2, Duration::from_millis(500)), Duration::from_millis(4500));
        assert_eq!(policy.delay_for(3, Duration::from_millis(1000)), Duration::from_millis(9000));
        assert_eq!(policy.delay_for(4, Duration::ZERO), Duration::from_millis(10_000));
        assert_eq!(policy.delay_for(40, Duration::ZERO), Duration::from_millis(10_000));
    }

    #[test]
    fn test_sampled_delays_stay_in_jitter_range() {
        let policy = RetryPolicy {
            budget: 10,
            ..Default::default()
        };
        for attempt in 1..5u32 {
            for _ in 0..50 {
                let RetryDecision::Retry(delay) = policy.should_retry(&server_error(), attempt) else {
                    panic!("5xx within budget should retry");
                };
                let floor = Duration::from_millis(1000 * 2u64.pow(attempt)).min(policy.max_delay);
                let ceiling = (floor + Duration::from_millis(1000)).min(policy.max_delay);
                assert!(delay >= floor && delay <= ceiling, "attempt {attempt}: {delay:?}");
            }
        }
    }

    #[test]
    fn test_budget_exhaustion_stops() {
        let policy = RetryPolicy::default();
        assert!(matches!(policy.should_retry(&PipelineError::Timeout, 1), RetryDecision::Retry(_)));
        assert!(matches!(policy.should_retry(&PipelineError::Timeout, 2), RetryDecision::Retry(_)));
        assert_eq!(policy.should_retry(&PipelineError::Timeout, 3), RetryDecision::Stop);
        assert_eq!(policy.should_retry(&PipelineError::Timeout, 4), RetryDecision::Stop);
    }

    #[test]
    fn test_non_transient_failures_never_retry() {
        let policy = RetryPolicy::default();
        for status in [400, 401, 403, 404, 409, 422, 429] {
            let err = PipelineError::from_status(status, "");
            assert_eq!(policy.should_retry(&err, 1), RetryDecision::Stop, "status {status}");
        }
        assert_eq!(policy.should_retry(&PipelineError::Unauthenticated, 1), RetryDecision::Stop);
        assert_eq!(policy.should_retry(&PipelineError::SessionExpired, 1), RetryDecision::Stop);
        assert!(matches!(
            policy.should_retry(&PipelineError::NetworkError("reset".into()), 1),
            RetryDecision::Retry(_)
        ));
    }

    #[test]
    fn test_zero_jitter_is_deterministic() {
        let policy = RetryPolicy {
            max_jitter: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(
            policy.should_retry(&server_error(), 1),
            RetryDecision::Retry(Duration::from_millis(2000))
        );
    }
}
