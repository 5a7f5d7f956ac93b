//! Fixed-delay retry policy.

use std::time::Duration;

/// Stateless retry policy: a fixed delay between attempts, bounded budget.
///
/// A budget of `max_retries` allows `max_retries + 1` attempts in total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (not counting the first try).
    pub max_retries: u32,
    /// Delay before every retry.
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    /// Returns the delay before the `attempt`-th retry (1-based).
    /// Returns `None` if `attempt` exceeds `max_retries`.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        self.should_retry(attempt).then_some(self.delay)
    }

    /// Returns `true` if any retries remain after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }

    /// Total attempts this policy allows.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_delay_until_budget() {
        let policy = RetryPolicy::fixed(2, Duration::from_millis(50));
        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(50)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_millis(50)));
        assert!(policy.next_delay(3).is_none());
        assert_eq!(policy.max_attempts(), 3);
    }

    #[test]
    fn zero_budget_never_retries() {
        let policy = RetryPolicy::fixed(0, Duration::ZERO);
        assert!(!policy.should_retry(1));
        assert_eq!(policy.max_attempts(), 1);
    }
}
