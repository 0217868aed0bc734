//! Exponential backoff shared by the realtime reconnect loop and the REST
//! client's retry loop.

use crate::constants::{
    DEFAULT_API_MAX_RETRIES, DEFAULT_API_RETRY_BASE_MS, DEFAULT_API_RETRY_CAP_MS,
    DEFAULT_RECONNECT_BASE_MS, DEFAULT_RECONNECT_CAP_MS,
};

/// `min(base * 2^attempt, cap)` in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub base_ms: u32,
    pub cap_ms: u32,
}

impl ExponentialBackoff {
    pub const fn new(base_ms: u32, cap_ms: u32) -> Self {
        Self { base_ms, cap_ms }
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn delay_ms(&self, attempt: u32) -> u32 {
        // Anything past 2^31 saturates anyway; clamp the shift so it cannot
        // overflow.
        let factor = 1u64 << attempt.min(31);
        let delay = (self.base_ms as u64).saturating_mul(factor);
        delay.min(self.cap_ms as u64) as u32
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_RECONNECT_BASE_MS, DEFAULT_RECONNECT_CAP_MS)
    }
}

/// Outcome of a single REST attempt as seen by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    /// The request never produced an HTTP response.
    NetworkError,
    HttpStatus(u16),
    /// Failed in a way another attempt cannot fix (bad payload).
    Fatal,
}

/// Retry rules for REST calls: transient failures (5xx, 408, network) are
/// retried up to `max_retries` times with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: ExponentialBackoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_API_MAX_RETRIES,
            backoff: ExponentialBackoff::new(DEFAULT_API_RETRY_BASE_MS, DEFAULT_API_RETRY_CAP_MS),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn is_retryable(outcome: AttemptOutcome) -> bool {
        match outcome {
            AttemptOutcome::Success | AttemptOutcome::Fatal => false,
            AttemptOutcome::NetworkError => true,
            AttemptOutcome::HttpStatus(status) => status == 408 || (500..=599).contains(&status),
        }
    }

    /// How long to wait before the next attempt, or `None` when the loop
    /// should stop. `attempt` counts attempts already made (1 after the
    /// first request).
    pub fn next_delay_ms(&self, attempt: u32, outcome: AttemptOutcome) -> Option<u32> {
        if !Self::is_retryable(outcome) || attempt > self.max_retries {
            return None;
        }
        Some(self.backoff.delay_ms(attempt - 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let backoff = ExponentialBackoff::new(1000, 30000);
        let delays: Vec<u32> = (0..7).map(|n| backoff.delay_ms(n)).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
    }

    #[test]
    fn backoff_survives_huge_attempt_counts() {
        let backoff = ExponentialBackoff::new(u32::MAX, u32::MAX);
        assert_eq!(backoff.delay_ms(200), u32::MAX);
        assert_eq!(ExponentialBackoff::new(1, 5).delay_ms(u32::MAX), 5);
    }

    #[test]
    fn retryable_outcomes() {
        assert!(RetryPolicy::is_retryable(AttemptOutcome::NetworkError));
        assert!(RetryPolicy::is_retryable(AttemptOutcome::HttpStatus(503)));
        assert!(RetryPolicy::is_retryable(AttemptOutcome::HttpStatus(408)));
        assert!(!RetryPolicy::is_retryable(AttemptOutcome::HttpStatus(404)));
        assert!(!RetryPolicy::is_retryable(AttemptOutcome::HttpStatus(429)));
        assert!(!RetryPolicy::is_retryable(AttemptOutcome::Success));
        assert!(!RetryPolicy::is_retryable(AttemptOutcome::Fatal));
    }

    #[test]
    fn retry_loop_stops_after_max_retries() {
        let policy = RetryPolicy::default();
        let server_error = AttemptOutcome::HttpStatus(500);
        assert_eq!(policy.next_delay_ms(1, server_error), Some(500));
        assert_eq!(policy.next_delay_ms(2, server_error), Some(1000));
        assert_eq!(policy.next_delay_ms(3, server_error), Some(2000));
        assert_eq!(policy.next_delay_ms(4, server_error), None);
        assert_eq!(policy.next_delay_ms(1, AttemptOutcome::HttpStatus(400)), None);
        assert_eq!(policy.next_delay_ms(1, AttemptOutcome::Fatal), None);
        assert_eq!(RetryPolicy::no_retry().next_delay_ms(1, server_error), None);
    }
}
