//! Retry backoff for activity tasks

use std::time::Duration;

/// Seconds the backoff is capped at.
const MAX_DELAY_SECS: u64 = 60;

/// Delay before retrying a task that has already run `attempts` times.
///
/// Exponential in the attempt count and capped: `min(60, 2^attempts)`
/// seconds. The dispatcher schedules the retry at `now + retry_delay`.
pub fn retry_delay(attempts: i64) -> Duration {
    let attempts = attempts.clamp(0, 32) as u32;
    let secs = 1u64
        .checked_shl(attempts)
        .unwrap_or(MAX_DELAY_SECS)
        .min(MAX_DELAY_SECS);
    Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth() {
        assert_eq!(retry_delay(0), Duration::from_secs(1));
        assert_eq!(retry_delay(1), Duration::from_secs(2));
        assert_eq!(retry_delay(2), Duration::from_secs(4));
        assert_eq!(retry_delay(3), Duration::from_secs(8));
        assert_eq!(retry_delay(5), Duration::from_secs(32));
    }

    #[test]
    fn test_capped_at_sixty_seconds() {
        assert_eq!(retry_delay(6), Duration::from_secs(60));
        assert_eq!(retry_delay(10), Duration::from_secs(60));
        assert_eq!(retry_delay(100), Duration::from_secs(60));
    }

    #[test]
    fn test_negative_attempts_treated_as_zero() {
        assert_eq!(retry_delay(-3), Duration::from_secs(1));
    }
}
