//! Delay between attempts of one firing.

use std::time::Duration;

use cadence_core::types::RetryStrategy;

/// Longest wait ever scheduled between attempts.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(3600);

/// Wait before the attempt that follows failed attempt `attempt` (1-based).
pub fn retry_delay(strategy: RetryStrategy, attempt: i32) -> Duration {
    let attempt = attempt.max(1) as u64;
    let delay = match strategy {
        RetryStrategy::Exponential => Duration::from_secs(1u64 << attempt.min(12)),
        RetryStrategy::Linear => Duration::from_secs(attempt.saturating_mul(10)),
        RetryStrategy::Fixed => Duration::from_secs(30),
        RetryStrategy::Other => Duration::from_secs(10),
    };
    delay.min(MAX_RETRY_DELAY)
}

/// Whether failed attempt `attempt` may be followed by another one.
/// `max_retries = 0` allows only the first attempt.
pub fn has_retry_budget(attempt: i32, max_retries: i32) -> bool {
    attempt < max_retries.max(0) + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_per_attempt() {
        assert_eq!(retry_delay(RetryStrategy::Exponential, 1), Duration::from_secs(2));
        assert_eq!(retry_delay(RetryStrategy::Exponential, 2), Duration::from_secs(4));
        assert_eq!(retry_delay(RetryStrategy::Exponential, 3), Duration::from_secs(8));
        assert_eq!(retry_delay(RetryStrategy::Exponential, 40), MAX_RETRY_DELAY);
    }

    #[test]
    fn linear_fixed_and_unknown() {
        assert_eq!(retry_delay(RetryStrategy::Linear, 3), Duration::from_secs(30));
        assert_eq!(retry_delay(RetryStrategy::Fixed, 7), Duration::from_secs(30));
        assert_eq!(retry_delay(RetryStrategy::Other, 2), Duration::from_secs(10));
    }

    #[test]
    fn budget_counts_the_first_attempt() {
        assert!(!has_retry_budget(1, 0));
        assert!(has_retry_budget(1, 2));
        assert!(has_retry_budget(2, 2));
        assert!(!has_retry_budget(3, 2));
        assert!(!has_retry_budget(1, -1));
    }
}
