//! Runtime tuning knobs.

use std::time::Duration;

/// Backoff for activities that fail transiently (or panic), also used for
/// orchestrator-level retries via `schedule_activity_with_retry`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total executions allowed for one scheduled activity, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Backoff multiplier applied per further retry.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// No retry starts later than this after the first execution.
    pub timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            multiplier: 2.0,
            max_delay: Duration::from_secs(1),
            timeout: None,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay after `attempts` failed executions (1-indexed):
    /// `base_delay * multiplier^(attempts - 1)`, capped at `max_delay`.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exp);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Whether another execution is allowed after `attempts` failures.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Configuration for `Runtime`.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub activity_retry: RetryPolicy,
    /// Deadline for one activity execution. Expiry records a timeout failure.
    pub activity_timeout: Option<Duration>,
    /// How many times a replay cycle is recomputed after a conflicting append.
    pub max_conflict_retries: u32,
    /// Ceiling for the polling backoff of `wait_for_orchestration`.
    pub wait_poll_max: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            activity_retry: RetryPolicy::default(),
            activity_timeout: None,
            max_conflict_retries: 8,
            wait_poll_max: Duration::from_millis(100),
        }
    }
}

impl RuntimeOptions {
    pub fn with_activity_retry(mut self, policy: RetryPolicy) -> Self {
        self.activity_retry = policy;
        self
    }

    pub fn with_activity_timeout(mut self, timeout: Duration) -> Self {
        self.activity_timeout = Some(timeout);
        self
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    pub fn with_wait_poll_max(mut self, max: Duration) -> Self {
        self.wait_poll_max = max;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(10));
        assert_eq!(policy.multiplier, 2.0);
        assert_eq!(policy.timeout, None);
    }

    #[test]
    fn exponential_backoff_increases() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_delay(1), Duration::from_millis(10));
        assert_eq!(policy.next_delay(2), Duration::from_millis(20));
        assert_eq!(policy.next_delay(3), Duration::from_millis(40));
        // attempts=0 behaves like the first retry
        assert_eq!(policy.next_delay(0), Duration::from_millis(10));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy {
            max_delay: Duration::from_millis(50),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.next_delay(4), Duration::from_millis(50));
        assert_eq!(policy.next_delay(u32::MAX), Duration::from_millis(50));
    }

    #[test]
    fn attempts_are_bounded() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::no_retry().should_retry(1));
    }

    #[test]
    fn options_builders() {
        let opts = RuntimeOptions::default()
            .with_activity_timeout(Duration::from_millis(5))
            .with_max_conflict_retries(2);
        assert_eq!(opts.activity_timeout, Some(Duration::from_millis(5)));
        assert_eq!(opts.max_conflict_retries, 2);
        assert_eq!(opts.wait_poll_max, Duration::from_millis(100));
    }
}
