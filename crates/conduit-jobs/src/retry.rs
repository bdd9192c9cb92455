//! Retry policy: whether a failed attempt is retried, and when.

use std::time::Duration;

use rand::Rng;

use conduit_core::defaults;
use conduit_core::{DeadLetterReason, FailureKind, Job};

/// What to do with a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueue at the original priority, visible after `delay`.
    Retry { delay: Duration },
    /// Route to the dead-letter store.
    DeadLetter(DeadLetterReason),
}

/// Exponential backoff with multiplicative jitter.
///
/// `delay = min(initial_delay * base^attempt, max_delay)`, then scaled by a
/// uniform factor in `[0.75, 1.25]` when jitter is enabled.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(defaults::RETRY_INITIAL_DELAY_MS),
            max_delay: Duration::from_millis(defaults::RETRY_MAX_DELAY_MS),
            exponential_base: defaults::RETRY_EXPONENTIAL_BASE,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Create policy from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `RETRY_INITIAL_DELAY_MS` | `1000` | Delay unit |
    /// | `RETRY_MAX_DELAY_MS` | `60000` | Cap before jitter |
    /// | `RETRY_EXPONENTIAL_BASE` | `2.0` | Growth factor |
    /// | `RETRY_JITTER` | `true` | Randomize delays |
    pub fn from_env() -> Self {
        let env_u64 = |key: &str| std::env::var(key).ok().and_then(|v| v.parse::<u64>().ok());
        Self {
            initial_delay: Duration::from_millis(
                env_u64("RETRY_INITIAL_DELAY_MS").unwrap_or(defaults::RETRY_INITIAL_DELAY_MS),
            ),
            max_delay: Duration::from_millis(
                env_u64("RETRY_MAX_DELAY_MS").unwrap_or(defaults::RETRY_MAX_DELAY_MS),
            ),
            exponential_base: std::env::var("RETRY_EXPONENTIAL_BASE")
                .ok()
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|b| *b >= 1.0)
                .unwrap_or(defaults::RETRY_EXPONENTIAL_BASE),
            jitter: std::env::var("RETRY_JITTER")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_exponential_base(mut self, base: f64) -> Self {
        self.exponential_base = base;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Whether `job`, having just failed with `kind`, gets another attempt.
    pub fn should_retry(&self, job: &Job, kind: FailureKind) -> bool {
        kind.is_retryable() && job.attempt_count < job.max_attempts
    }

    /// Un-jittered delay after `attempt` failed attempts.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.exponential_base.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// Delay before the next attempt, jittered when enabled.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt);
        if !self.jitter {
            return delay;
        }
        let factor =
            rand::thread_rng().gen_range(defaults::RETRY_JITTER_MIN..=defaults::RETRY_JITTER_MAX);
        delay.mul_f64(factor)
    }

    pub fn decide(&self, job: &Job, kind: FailureKind) -> RetryDecision {
        if !kind.is_retryable() {
            RetryDecision::DeadLetter(DeadLetterReason::NonRetryable)
        } else if self.should_retry(job, kind) {
            RetryDecision::Retry {
                delay: self.next_delay(job.attempt_count),
            }
        } else {
            RetryDecision::DeadLetter(DeadLetterReason::RetriesExhausted)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::{JobDefaults, JobKind, SubmitRequest};
    use serde_json::json;

    fn job_with_attempts(attempt_count: u32, max_attempts: u32) -> Job {
        let request = SubmitRequest::new("t", JobKind::Inference, "llm", json!({}))
            .with_max_attempts(max_attempts);
        let mut job = Job::from_request(request, &JobDefaults::default());
        job.attempt_count = attempt_count;
        job
    }

    #[test]
    fn test_backoff_sequence_is_capped() {
        let policy = RetryPolicy::default()
            .with_initial_delay(Duration::from_secs(1))
            .with_exponential_base(2.0)
            .with_max_delay(Duration::from_secs(30))
            .with_jitter(false);

        let delays: Vec<u64> = (1..=5).map(|a| policy.base_delay(a).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 30]);
        assert_eq!(policy.next_delay(3), Duration::from_secs(8));
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let policy = RetryPolicy::default().with_jitter(false);
        assert_eq!(policy.base_delay(u32::MAX), policy.max_delay);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::default()
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(100));
        for _ in 0..200 {
            let delay = policy.next_delay(2).as_secs_f64();
            assert!((3.0..=5.0).contains(&delay), "delay {} out of range", delay);
        }
    }

    #[test]
    fn test_should_retry_respects_kind_and_budget() {
        let policy = RetryPolicy::default();
        let job = job_with_attempts(1, 3);
        assert!(policy.should_retry(&job, FailureKind::Timeout));
        assert!(policy.should_retry(&job, FailureKind::RateLimited));
        assert!(policy.should_retry(&job, FailureKind::CircuitOpen));
        assert!(!policy.should_retry(&job, FailureKind::Unauthorized));

        let exhausted = job_with_attempts(3, 3);
        assert!(!policy.should_retry(&exhausted, FailureKind::ServerError));
    }

    #[test]
    fn test_decide_routes_dead_letters_by_reason() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(&job_with_attempts(1, 3), FailureKind::MalformedInput),
            RetryDecision::DeadLetter(DeadLetterReason::NonRetryable)
        );
        assert_eq!(
            policy.decide(&job_with_attempts(3, 3), FailureKind::Connection),
            RetryDecision::DeadLetter(DeadLetterReason::RetriesExhausted)
        );
        assert!(matches!(
            policy.decide(&job_with_attempts(1, 3), FailureKind::Connection),
            RetryDecision::Retry { .. }
        ));
    }
}
