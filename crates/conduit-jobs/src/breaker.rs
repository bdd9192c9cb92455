//! Per-dependency circuit breakers.
//!
//! ```text
//! CLOSED --[failure_threshold failures]--> OPEN --[open_timeout, next call]--> HALF_OPEN
//!   ^                                        ^                                    |
//!   |                                        +------------[any failure]-----------+
//!   +---------------------[success_threshold successes]---------------------------+
//! ```
//!
//! Every check and every recorded outcome is a single transition applied
//! under the registry lock, so concurrent workers never observe a
//! half-applied state change.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, trace, warn};

use conduit_core::defaults;

/// Current state of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are short-circuited.
    Open,
    /// A limited number of probe calls is allowed.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Configuration shared by every breaker in a registry.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open a closed breaker.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the breaker.
    pub success_threshold: u32,
    /// Time an open breaker waits before admitting a probe.
    pub open_timeout: Duration,
    /// Concurrent probes allowed while half-open.
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: defaults::BREAKER_FAILURE_THRESHOLD,
            success_threshold: defaults::BREAKER_SUCCESS_THRESHOLD,
            open_timeout: Duration::from_secs(defaults::BREAKER_OPEN_TIMEOUT_SECS),
            half_open_max_calls: defaults::BREAKER_HALF_OPEN_PROBES,
        }
    }
}

impl BreakerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `CIRCUIT_BREAKER_FAILURE_THRESHOLD` | `5` | Failures before opening |
    /// | `CIRCUIT_BREAKER_SUCCESS_THRESHOLD` | `2` | Probe successes before closing |
    /// | `CIRCUIT_BREAKER_TIMEOUT_SECONDS` | `60` | Open duration |
    /// | `CIRCUIT_BREAKER_HALF_OPEN_MAX_CALLS` | `3` | Concurrent probes |
    pub fn from_env() -> Self {
        let env_u32 = |key: &str| std::env::var(key).ok().and_then(|v| v.parse::<u32>().ok());
        Self {
            failure_threshold: env_u32("CIRCUIT_BREAKER_FAILURE_THRESHOLD")
                .unwrap_or(defaults::BREAKER_FAILURE_THRESHOLD)
                .max(1),
            success_threshold: env_u32("CIRCUIT_BREAKER_SUCCESS_THRESHOLD")
                .unwrap_or(defaults::BREAKER_SUCCESS_THRESHOLD)
                .max(1),
            open_timeout: Duration::from_secs(
                std::env::var("CIRCUIT_BREAKER_TIMEOUT_SECONDS")
                    .ok()
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(defaults::BREAKER_OPEN_TIMEOUT_SECS),
            ),
            half_open_max_calls: env_u32("CIRCUIT_BREAKER_HALF_OPEN_MAX_CALLS")
                .unwrap_or(defaults::BREAKER_HALF_OPEN_PROBES)
                .max(1),
        }
    }

    pub fn with_failure_threshold(mut self, n: u32) -> Self {
        self.failure_threshold = n;
        self
    }

    pub fn with_success_threshold(mut self, n: u32) -> Self {
        self.success_threshold = n;
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    pub fn with_half_open_max_calls(mut self, n: u32) -> Self {
        self.half_open_max_calls = n;
        self
    }
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    opened_at_utc: Option<DateTime<Utc>>,
    probes_in_flight: u32,
    last_error: Option<String>,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            opened_at_utc: None,
            probes_in_flight: 0,
            last_error: None,
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.failure_count = 0;
        self.success_count = 0;
        self.probes_in_flight = 0;
        self.opened_at = Some(Instant::now());
        self.opened_at_utc = Some(Utc::now());
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.success_count = 0;
        self.probes_in_flight = 0;
        self.opened_at = None;
        self.opened_at_utc = None;
        self.last_error = None;
    }

    fn time_until_half_open(&self, open_timeout: Duration) -> Option<Duration> {
        match (self.state, self.opened_at) {
            (CircuitState::Open, Some(at)) => Some(open_timeout.saturating_sub(at.elapsed())),
            _ => None,
        }
    }
}

/// Point-in-time view of one breaker, for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub dependency: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub time_until_half_open: Option<Duration>,
    pub probes_in_flight: u32,
    pub last_error: Option<String>,
}

/// One breaker per dependency, created lazily in the CLOSED state.
pub struct CircuitBreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Breaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Breaker>> {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a call to `dependency` may proceed now.
    ///
    /// An OPEN breaker whose timeout has elapsed moves to HALF_OPEN on this
    /// call. A `true` answer while HALF_OPEN reserves one probe slot, which
    /// the caller returns through `record_success`, `record_failure` or
    /// `release`.
    pub fn is_available(&self, dependency: &str) -> bool {
        let mut breakers = self.lock();
        let breaker = breakers
            .entry(dependency.to_string())
            .or_insert_with(Breaker::new);

        if breaker.state == CircuitState::Open {
            let elapsed = breaker.opened_at.map(|at| at.elapsed()).unwrap_or_default();
            if elapsed < self.config.open_timeout {
                trace!(
                    subsystem = "jobs",
                    component = "breaker",
                    dependency,
                    "Call short-circuited"
                );
                return false;
            }
            breaker.state = CircuitState::HalfOpen;
            breaker.success_count = 0;
            breaker.failure_count = 0;
            breaker.probes_in_flight = 0;
            info!(
                subsystem = "jobs",
                component = "breaker",
                dependency,
                breaker_state = %CircuitState::HalfOpen,
                "Circuit breaker half-open, probing dependency"
            );
        }

        match breaker.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => {
                if breaker.probes_in_flight < self.config.half_open_max_calls {
                    breaker.probes_in_flight += 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::Open => false,
        }
    }

    /// [`is_available`](Self::is_available), returning the reservation as a guard.
    pub fn admit<'a>(&'a self, dependency: &'a str) -> Option<CallPermit<'a>> {
        self.is_available(dependency).then(|| CallPermit {
            breakers: self,
            dependency,
            settled: false,
        })
    }

    /// Record a successful call. Returns the new state if it changed.
    pub fn record_success(&self, dependency: &str) -> Option<CircuitState> {
        let mut breakers = self.lock();
        let breaker = breakers
            .entry(dependency.to_string())
            .or_insert_with(Breaker::new);

        match breaker.state {
            CircuitState::Closed => {
                breaker.failure_count = 0;
                None
            }
            CircuitState::HalfOpen => {
                breaker.probes_in_flight = breaker.probes_in_flight.saturating_sub(1);
                breaker.success_count += 1;
                if breaker.success_count >= self.config.success_threshold {
                    breaker.close();
                    info!(
                        subsystem = "jobs",
                        component = "breaker",
                        dependency,
                        breaker_state = %CircuitState::Closed,
                        "Circuit breaker closed after successful probes"
                    );
                    Some(CircuitState::Closed)
                } else {
                    None
                }
            }
            // A late result from a call admitted before the breaker opened.
            CircuitState::Open => None,
        }
    }

    /// Record a failed call. Returns the new state if it changed.
    pub fn record_failure(&self, dependency: &str, error: &str) -> Option<CircuitState> {
        let mut breakers = self.lock();
        let breaker = breakers
            .entry(dependency.to_string())
            .or_insert_with(Breaker::new);
        breaker.last_error = Some(error.to_string());

        match breaker.state {
            CircuitState::Closed => {
                breaker.failure_count += 1;
                if breaker.failure_count >= self.config.failure_threshold {
                    breaker.open();
                    warn!(
                        subsystem = "jobs",
                        component = "breaker",
                        dependency,
                        breaker_state = %CircuitState::Open,
                        threshold = self.config.failure_threshold,
                        error,
                        "Circuit breaker opened"
                    );
                    Some(CircuitState::Open)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                breaker.open();
                warn!(
                    subsystem = "jobs",
                    component = "breaker",
                    dependency,
                    breaker_state = %CircuitState::Open,
                    error,
                    "Probe failed, circuit breaker re-opened"
                );
                Some(CircuitState::Open)
            }
            CircuitState::Open => None,
        }
    }

    /// Return a probe slot without counting an outcome.
    ///
    /// Used when a half-open call ends in a way that says nothing about
    /// dependency health (permanent error, cancellation).
    pub fn release(&self, dependency: &str) {
        let mut breakers = self.lock();
        if let Some(breaker) = breakers.get_mut(dependency) {
            if breaker.state == CircuitState::HalfOpen {
                breaker.probes_in_flight = breaker.probes_in_flight.saturating_sub(1);
            }
        }
    }

    /// Current state without triggering the OPEN -> HALF_OPEN transition.
    pub fn state(&self, dependency: &str) -> CircuitState {
        self.lock()
            .get(dependency)
            .map(|b| b.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Force a breaker back to CLOSED.
    pub fn reset(&self, dependency: &str) {
        let mut breakers = self.lock();
        breakers
            .entry(dependency.to_string())
            .or_insert_with(Breaker::new)
            .close();
        info!(
            subsystem = "jobs",
            component = "breaker",
            dependency,
            "Circuit breaker manually reset"
        );
    }

    pub fn snapshot(&self, dependency: &str) -> BreakerSnapshot {
        let breakers = self.lock();
        match breakers.get(dependency) {
            Some(breaker) => self.describe(dependency, breaker),
            None => self.describe(dependency, &Breaker::new()),
        }
    }

    /// Snapshots of every known breaker, sorted by dependency.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers = self.lock();
        let mut all: Vec<_> = breakers
            .iter()
            .map(|(dep, breaker)| self.describe(dep, breaker))
            .collect();
        all.sort_by(|a, b| a.dependency.cmp(&b.dependency));
        all
    }

    fn describe(&self, dependency: &str, breaker: &Breaker) -> BreakerSnapshot {
        BreakerSnapshot {
            dependency: dependency.to_string(),
            state: breaker.state,
            failure_count: breaker.failure_count,
            success_count: breaker.success_count,
            opened_at: breaker.opened_at_utc,
            time_until_half_open: breaker.time_until_half_open(self.config.open_timeout),
            probes_in_flight: breaker.probes_in_flight,
            last_error: breaker.last_error.clone(),
        }
    }
}

/// A call admitted by [`CircuitBreakerRegistry::admit`].
///
/// Dropped without [`settle`](Self::settle), e.g. when the task running the
/// call is aborted, it returns its probe slot.
#[must_use]
pub struct CallPermit<'a> {
    breakers: &'a CircuitBreakerRegistry,
    dependency: &'a str,
    settled: bool,
}

impl CallPermit<'_> {
    /// The outcome has been recorded; keep the slot accounting as is.
    pub fn settle(mut self) {
        self.settled = true;
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breakers.release(self.dependency);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(failure_threshold: u32) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(
            BreakerConfig::default()
                .with_failure_threshold(failure_threshold)
                .with_success_threshold(2)
                .with_open_timeout(Duration::from_secs(30))
                .with_half_open_max_calls(1),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_breaker_cycle() {
        let breakers = registry(3);

        for _ in 0..3 {
            assert!(breakers.is_available("llm"));
            breakers.record_failure("llm", "503");
        }
        assert_eq!(breakers.state("llm"), CircuitState::Open);
        assert!(!breakers.is_available("llm"));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breakers.is_available("llm"));
        assert_eq!(breakers.state("llm"), CircuitState::HalfOpen);

        // A failed probe re-opens immediately.
        assert_eq!(
            breakers.record_failure("llm", "still down"),
            Some(CircuitState::Open)
        );
        assert!(!breakers.is_available("llm"));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breakers.is_available("llm"));
        assert_eq!(breakers.record_success("llm"), None);
        assert!(breakers.is_available("llm"));
        assert_eq!(breakers.record_success("llm"), Some(CircuitState::Closed));
        assert_eq!(breakers.state("llm"), CircuitState::Closed);
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let breakers = registry(3);
        breakers.record_failure("llm", "a");
        breakers.record_failure("llm", "b");
        breakers.record_success("llm");
        breakers.record_failure("llm", "c");
        assert_eq!(breakers.state("llm"), CircuitState::Closed);
        assert_eq!(breakers.snapshot("llm").failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_limits_concurrent_probes() {
        let breakers = registry(1);
        breakers.record_failure("search", "timeout");
        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(breakers.is_available("search"));
        assert!(!breakers.is_available("search"));

        breakers.release("search");
        assert!(breakers.is_available("search"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_call_permit_returns_probe_slot() {
        let breakers = registry(1);
        breakers.record_failure("search", "timeout");
        tokio::time::advance(Duration::from_secs(31)).await;

        let probe = breakers.admit("search").unwrap();
        assert!(breakers.admit("search").is_none());
        drop(probe);
        assert_eq!(breakers.snapshot("search").probes_in_flight, 0);

        let probe = breakers.admit("search").unwrap();
        breakers.record_success("search");
        probe.settle();
        assert_eq!(breakers.snapshot("search").probes_in_flight, 0);
        assert_eq!(breakers.snapshot("search").success_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_reports_time_until_half_open() {
        let breakers = registry(1);
        breakers.record_failure("embedder", "connection refused");
        tokio::time::advance(Duration::from_secs(10)).await;

        let snapshot = breakers.snapshot("embedder");
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.time_until_half_open, Some(Duration::from_secs(20)));
        assert_eq!(snapshot.last_error.as_deref(), Some("connection refused"));
        assert!(snapshot.opened_at.is_some());
    }

    #[test]
    fn test_breakers_are_isolated_per_dependency() {
        let breakers = registry(1);
        breakers.record_failure("llm", "down");
        assert!(!breakers.is_available("llm"));
        assert!(breakers.is_available("search"));
        assert_eq!(breakers.snapshots().len(), 2);
    }

    #[test]
    fn test_manual_reset_closes() {
        let breakers = registry(1);
        breakers.record_failure("llm", "down");
        breakers.reset("llm");
        assert_eq!(breakers.state("llm"), CircuitState::Closed);
        assert!(breakers.is_available("llm"));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
        assert_eq!(CircuitState::Open.to_string(), "open");
    }
}
