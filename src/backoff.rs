//! Reconnection backoff policy.
//!
//! The policy is pure: the attempt counter and the single pending timer
//! are owned by the connection manager.

use std::time::Duration;

/// Cap on the delay between reconnection attempts.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Default base delay for the first reconnection attempt.
pub const DEFAULT_RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default reconnect budget per subscription.
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;

/// Exponential backoff capped at [`MAX_RECONNECT_DELAY`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base_delay: Duration,
}

impl BackoffPolicy {
    /// Create a policy with the given base delay.
    #[must_use]
    pub const fn new(base_delay: Duration) -> Self {
        Self { base_delay }
    }

    /// Delay before retry number `attempt` (zero-based): `base * 2^attempt`,
    /// capped at 30 seconds.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let factor = 2_u64.saturating_pow(attempt);
        Duration::from_millis(base_ms.saturating_mul(factor)).min(MAX_RECONNECT_DELAY)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RECONNECT_BASE_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_per_attempt() {
        let policy = BackoffPolicy::new(Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
    }

    #[test]
    fn delay_caps_at_thirty_seconds() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(16));
        assert_eq!(policy.delay_for_attempt(5), MAX_RECONNECT_DELAY);
        assert_eq!(policy.delay_for_attempt(20), MAX_RECONNECT_DELAY);
    }

    #[test]
    fn delay_saturates_on_extreme_attempts() {
        let policy = BackoffPolicy::new(Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(u32::MAX), MAX_RECONNECT_DELAY);
    }
}
