use std::time::Duration;

/// Exponential backoff policy shared by the stream driver and the command
/// queue delivery loop.
///
/// The first attempt is never delayed; attempt `k >= 1` waits
/// `base * 2^k` milliseconds, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
        }
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    pub fn delay_for_attempt(&self, attempt: u32, retry_after_hint_ms: Option<u64>) -> Duration {
        let calculated = if attempt == 0 {
            0
        } else {
            let shift = attempt.min(20);
            self.base_delay_ms.saturating_mul(1_u64 << shift)
        };
        let hinted = retry_after_hint_ms.unwrap_or(0);
        let bounded = calculated.max(hinted).min(self.max_delay_ms);
        Duration::from_millis(bounded)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(500, 30_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_is_immediate() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0, None), Duration::ZERO);
    }

    #[test]
    fn doubles_per_consecutive_failure() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.delay_for_attempt(1, None),
            Duration::from_millis(1_000)
        );
        assert_eq!(
            policy.delay_for_attempt(2, None),
            Duration::from_millis(2_000)
        );
        assert_eq!(
            policy.delay_for_attempt(5, None),
            Duration::from_millis(16_000)
        );
    }

    #[test]
    fn caps_delay_at_max() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.delay_for_attempt(6, None),
            Duration::from_millis(30_000)
        );
        assert_eq!(
            policy.delay_for_attempt(19, None),
            Duration::from_millis(30_000)
        );
    }

    #[test]
    fn honors_retry_after_hint_when_larger() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.delay_for_attempt(0, Some(10_000)),
            Duration::from_millis(10_000)
        );
        assert_eq!(
            policy.delay_for_attempt(1, Some(250)),
            Duration::from_millis(1_000)
        );
    }
}
