//! Core data models for conduit.
//!
//! The [`Job`] record and its lifecycle state machine, the dependency failure
//! taxonomy, terminal outcomes, and the persisted dead-letter and quota rows.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error as ThisError;
use uuid::Uuid;

use crate::defaults;
use crate::error::{Error, Result};
use crate::ids::new_v7;

/// Serialize `Duration` as integer milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

// =============================================================================
// JOB KIND / PRIORITY / STATUS
// =============================================================================

/// Capability category of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Text generation / completion.
    Inference,
    /// Vector embedding generation.
    Embedding,
    /// Retrieval against a search backend.
    Search,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Inference => "inference",
            JobKind::Embedding => "embedding",
            JobKind::Search => "search",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "inference" => Ok(Self::Inference),
            "embedding" => Ok(Self::Embedding),
            "search" => Ok(Self::Search),
            _ => Err(Error::InvalidInput(format!("Invalid job kind: {}", s))),
        }
    }
}

/// Job priority. Higher value is dequeued first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
}

impl Priority {
    /// All priorities, highest first.
    pub const DESCENDING: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    /// Numeric value (HIGH=3, NORMAL=2, LOW=1).
    pub fn value(&self) -> u8 {
        *self as u8
    }

    /// Priority for a numeric value, clamped into the valid range.
    pub fn from_value(value: u8) -> Self {
        match value {
            0 | 1 => Priority::Low,
            2 => Priority::Normal,
            _ => Priority::High,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "low" | "1" => Ok(Self::Low),
            "normal" | "2" => Ok(Self::Normal),
            "high" | "3" => Ok(Self::High),
            _ => Err(Error::InvalidInput(format!("Invalid priority: {}", s))),
        }
    }
}

/// Lifecycle state of a job.
///
/// ```text
/// PENDING -> QUEUED -> RUNNING -> COMPLETED | CANCELLED | TIMED_OUT
///              ^          |
///              +-(retry)--+--> FAILED -> DEAD_LETTER
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Completed,
    /// Momentary: selects the dead-letter transition, never observed at rest.
    Failed,
    Cancelled,
    TimedOut,
    DeadLetter,
}

impl JobStatus {
    /// Terminal statuses are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Cancelled | JobStatus::TimedOut | JobStatus::DeadLetter
        )
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, Cancelled)
                | (Queued, Running)
                | (Queued, Cancelled)
                | (Queued, TimedOut)
                | (Queued, DeadLetter)
                | (Running, Queued)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, TimedOut)
                | (Failed, DeadLetter)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::TimedOut => "timed_out",
            JobStatus::DeadLetter => "dead_letter",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "timed_out" => Ok(Self::TimedOut),
            "dead_letter" => Ok(Self::DeadLetter),
            _ => Err(Error::InvalidInput(format!("Invalid job status: {}", s))),
        }
    }
}

// =============================================================================
// FAILURE TAXONOMY
// =============================================================================

/// Coarse failure class reported by a dependency capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureClass {
    Transient,
    Permanent,
    Timeout,
}

/// Detailed failure kind of a dependency attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Call exceeded its attempt timeout.
    Timeout,
    /// Dependency rejected the call with a rate limit (429).
    RateLimited,
    /// 5xx-equivalent dependency failure.
    ServerError,
    /// Connection could not be established or was reset.
    Connection,
    /// Breaker short-circuited the call without invoking the dependency.
    CircuitOpen,
    /// Payload rejected as malformed.
    MalformedInput,
    /// Authentication or authorization failure.
    Unauthorized,
    /// Any other 4xx-equivalent rejection.
    ClientError,
}

impl FailureKind {
    /// Map an HTTP-style status code to a failure kind.
    pub fn from_status(status: u16) -> Self {
        match status {
            408 | 504 => Self::Timeout,
            429 => Self::RateLimited,
            401 | 403 => Self::Unauthorized,
            400 | 413 | 422 => Self::MalformedInput,
            500..=599 => Self::ServerError,
            _ => Self::ClientError,
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            Self::Timeout => FailureClass::Timeout,
            Self::RateLimited | Self::ServerError | Self::Connection | Self::CircuitOpen => {
                FailureClass::Transient
            }
            Self::MalformedInput | Self::Unauthorized | Self::ClientError => {
                FailureClass::Permanent
            }
        }
    }

    /// Whether another attempt could change the outcome.
    pub fn is_retryable(&self) -> bool {
        self.class() != FailureClass::Permanent
    }

    /// Whether the failure says something about dependency health.
    pub fn counts_against_breaker(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::RateLimited | Self::ServerError | Self::Connection
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::ServerError => "server_error",
            Self::Connection => "connection",
            Self::CircuitOpen => "circuit_open",
            Self::MalformedInput => "malformed_input",
            Self::Unauthorized => "unauthorized",
            Self::ClientError => "client_error",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure returned by a dependency capability.
#[derive(ThisError, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct InvokeError {
    pub kind: FailureKind,
    pub message: String,
}

impl InvokeError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// A retryable 5xx-equivalent failure.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::ServerError, message)
    }

    /// A non-retryable malformed-input failure.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(FailureKind::MalformedInput, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    pub fn class(&self) -> FailureClass {
        self.kind.class()
    }
}

/// Result of a single dependency invocation.
pub type InvokeResult = std::result::Result<JsonValue, InvokeError>;

// =============================================================================
// JOB
// =============================================================================

/// Defaults applied to submissions that leave budgets unset.
#[derive(Debug, Clone)]
pub struct JobDefaults {
    pub max_attempts: u32,
    pub timeout: Duration,
    pub attempt_timeout: Duration,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            max_attempts: defaults::JOB_MAX_ATTEMPTS,
            timeout: Duration::from_secs(defaults::JOB_TIMEOUT_SECS),
            attempt_timeout: Duration::from_secs(defaults::JOB_ATTEMPT_TIMEOUT_SECS),
        }
    }
}

impl JobDefaults {
    /// Create defaults from environment variables.
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `RETRY_MAX_ATTEMPTS` | `3` | Attempts per job |
    /// | `JOB_TIMEOUT_SECS` | `60` | Whole-job budget |
    /// | `JOB_ATTEMPT_TIMEOUT_SECS` | `30` | Per-call budget |
    pub fn from_env() -> Self {
        let env_u64 = |key: &str| std::env::var(key).ok().and_then(|v| v.parse::<u64>().ok());
        Self {
            max_attempts: std::env::var("RETRY_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(defaults::JOB_MAX_ATTEMPTS)
                .max(1),
            timeout: Duration::from_secs(
                env_u64("JOB_TIMEOUT_SECS").unwrap_or(defaults::JOB_TIMEOUT_SECS),
            ),
            attempt_timeout: Duration::from_secs(
                env_u64("JOB_ATTEMPT_TIMEOUT_SECS").unwrap_or(defaults::JOB_ATTEMPT_TIMEOUT_SECS),
            ),
        }
    }
}

/// Intake request for a new job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub tenant_id: String,
    pub job_kind: JobKind,
    pub payload: JsonValue,
    #[serde(default)]
    pub priority: Priority,
    pub target_dependency: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default, with = "option_duration_ms")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub request_id: Option<String>,
}

mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

impl SubmitRequest {
    pub fn new(
        tenant_id: impl Into<String>,
        job_kind: JobKind,
        target_dependency: impl Into<String>,
        payload: JsonValue,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            job_kind,
            payload,
            priority: Priority::Normal,
            target_dependency: target_dependency.into(),
            idempotency_key: None,
            max_attempts: None,
            timeout: None,
            request_id: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Reject requests that can never be processed.
    pub fn validate(&self) -> Result<()> {
        if self.tenant_id.trim().is_empty() {
            return Err(Error::InvalidInput("tenant_id must not be empty".into()));
        }
        if self.target_dependency.trim().is_empty() {
            return Err(Error::InvalidInput(
                "target_dependency must not be empty".into(),
            ));
        }
        if self.max_attempts == Some(0) {
            return Err(Error::InvalidInput("max_attempts must be at least 1".into()));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(Error::InvalidInput("timeout must be positive".into()));
        }
        Ok(())
    }
}

/// Handle returned to submitters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: Uuid,
    pub status: JobStatus,
}

/// The durable unit of work.
///
/// Invariants: `attempt_count <= max_attempts`; a job in a terminal status is
/// never mutated again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub tenant_id: String,
    pub job_kind: JobKind,
    pub priority: Priority,
    pub payload: JsonValue,
    pub target_dependency: String,
    pub idempotency_key: Option<String>,
    pub status: JobStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Wall-clock budget for all attempts combined.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    /// Budget for a single dependency call.
    #[serde(with = "duration_ms")]
    pub attempt_timeout: Duration,
    /// Time spent in attempts so far.
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
    /// Admission order, used for FIFO within a priority level.
    pub arrival_seq: u64,
    /// Earliest dequeue time of a deferred retry.
    pub visible_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub request_id: Option<String>,
    /// Dead-lettered job this one was requeued from.
    pub requeued_from: Option<Uuid>,
}

impl Job {
    /// Build a `PENDING` job from an intake request.
    pub fn from_request(request: SubmitRequest, defaults: &JobDefaults) -> Self {
        let timeout = request.timeout.unwrap_or(defaults.timeout);
        Self {
            job_id: new_v7(),
            tenant_id: request.tenant_id,
            job_kind: request.job_kind,
            priority: request.priority,
            payload: request.payload,
            target_dependency: request.target_dependency,
            idempotency_key: request.idempotency_key,
            status: JobStatus::Pending,
            attempt_count: 0,
            max_attempts: request.max_attempts.unwrap_or(defaults.max_attempts).max(1),
            created_at: Utc::now(),
            queued_at: None,
            started_at: None,
            completed_at: None,
            timeout,
            attempt_timeout: defaults.attempt_timeout.min(timeout),
            elapsed: Duration::ZERO,
            arrival_seq: 0,
            visible_at: None,
            error: None,
            request_id: request.request_id,
            requeued_from: None,
        }
    }

    pub fn handle(&self) -> JobHandle {
        JobHandle {
            job_id: self.job_id,
            status: self.status,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next`, stamping lifecycle timestamps.
    pub fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        let now = Utc::now();
        match next {
            JobStatus::Queued => self.queued_at = Some(now),
            JobStatus::Running => {
                self.started_at.get_or_insert(now);
            }
            s if s.is_terminal() => self.completed_at = Some(now),
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    /// Claim the job for one attempt: `QUEUED -> RUNNING`, bumping the count.
    pub fn begin_attempt(&mut self) -> Result<u32> {
        if self.attempt_count >= self.max_attempts {
            return Err(Error::Internal(format!(
                "job {} has no attempts left ({}/{})",
                self.job_id, self.attempt_count, self.max_attempts
            )));
        }
        self.transition(JobStatus::Running)?;
        self.attempt_count += 1;
        self.visible_at = None;
        Ok(self.attempt_count)
    }

    /// Budget left for further attempts.
    pub fn remaining_budget(&self) -> Duration {
        self.timeout.saturating_sub(self.elapsed)
    }

    pub fn budget_exhausted(&self) -> bool {
        self.elapsed >= self.timeout
    }

    /// Budget for the next dependency call.
    pub fn next_call_budget(&self) -> Duration {
        self.attempt_timeout.min(self.remaining_budget())
    }

    /// A fresh `PENDING` copy for manual replay of a dead-lettered job.
    pub fn replay(&self) -> Job {
        Job {
            job_id: new_v7(),
            status: JobStatus::Pending,
            attempt_count: 0,
            created_at: Utc::now(),
            queued_at: None,
            started_at: None,
            completed_at: None,
            elapsed: Duration::ZERO,
            arrival_seq: 0,
            visible_at: None,
            error: None,
            // The key stays bound to the original job.
            idempotency_key: None,
            requeued_from: Some(self.job_id),
            ..self.clone()
        }
    }
}

// =============================================================================
// OUTCOMES
// =============================================================================

/// Terminal outcome of a job, as exposed to polling clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed {
        result: JsonValue,
    },
    /// Dead-lettered after a permanent error or exhausted retries.
    Failed {
        kind: Option<FailureKind>,
        error: String,
        attempts: u32,
    },
    Cancelled,
    TimedOut {
        attempts: u32,
    },
}

impl JobOutcome {
    /// Status a job holds once this outcome is recorded.
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Completed { .. } => JobStatus::Completed,
            JobOutcome::Failed { .. } => JobStatus::DeadLetter,
            JobOutcome::Cancelled => JobStatus::Cancelled,
            JobOutcome::TimedOut { .. } => JobStatus::TimedOut,
        }
    }
}

/// Answer to a result poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ResultLookup {
    Ready { outcome: JobOutcome },
    Pending,
    NotFound,
}

// =============================================================================
// QUOTAS
// =============================================================================

/// Machine-readable quota rejection reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuotaRejectReason {
    DailyQuotaExceeded,
    RateLimitExceeded,
}

impl QuotaRejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            QuotaRejectReason::DailyQuotaExceeded => "DAILY_QUOTA_EXCEEDED",
            QuotaRejectReason::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
        }
    }
}

/// Rejection produced by the quota manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRejection {
    pub reason: QuotaRejectReason,
    /// When the caller may try again.
    #[serde(with = "option_duration_ms")]
    pub retry_after: Option<Duration>,
}

impl fmt::Display for QuotaRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.retry_after {
            Some(after) => write!(
                f,
                "{} (retry after {}ms)",
                self.reason.code(),
                after.as_millis()
            ),
            None => f.write_str(self.reason.code()),
        }
    }
}

/// Persisted daily counter keyed by `(tenant_id, window_start)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub tenant_id: String,
    /// UTC midnight opening the daily window.
    pub window_start: DateTime<Utc>,
    pub daily_used: u32,
}

// =============================================================================
// DEAD LETTERS
// =============================================================================

/// Why a job was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Retryable failures used up `max_attempts`.
    RetriesExhausted,
    /// A permanent failure; retrying could not change the outcome.
    NonRetryable,
    /// Cancelled while a dependency call was in flight.
    CancelledInFlight,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::RetriesExhausted => "retries_exhausted",
            DeadLetterReason::NonRetryable => "non_retryable",
            DeadLetterReason::CancelledInFlight => "cancelled_in_flight",
        }
    }
}

impl FromStr for DeadLetterReason {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "retries_exhausted" => Ok(Self::RetriesExhausted),
            "non_retryable" => Ok(Self::NonRetryable),
            "cancelled_in_flight" => Ok(Self::CancelledInFlight),
            _ => Err(Error::InvalidInput(format!("Invalid dead letter reason: {}", s))),
        }
    }
}

/// A job held for inspection and manual replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job: Job,
    pub reason: DeadLetterReason,
    pub failure_kind: Option<FailureKind>,
    pub last_error: Option<String>,
    pub dead_lettered_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_job() -> Job {
        let request = SubmitRequest::new("tenant-a", JobKind::Inference, "llm", json!({"q": 1}))
            .with_max_attempts(2);
        Job::from_request(request, &JobDefaults::default())
    }

    #[test]
    fn test_priority_ordering_and_values() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::High.value(), 3);
        assert_eq!(Priority::Low.value(), 1);
        assert_eq!(Priority::from_value(9), Priority::High);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_job_kind_from_str() {
        assert_eq!("Embedding".parse::<JobKind>().unwrap(), JobKind::Embedding);
        assert!("translate".parse::<JobKind>().is_err());
    }

    #[test]
    fn test_status_terminality() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::DeadLetter.is_terminal());
        assert!(JobStatus::TimedOut.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
    }

    #[test]
    fn test_status_roundtrip_str() {
        for status in [
            JobStatus::Pending,
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
            JobStatus::TimedOut,
            JobStatus::DeadLetter,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_terminal_job_is_immutable() {
        let mut job = test_job();
        job.transition(JobStatus::Queued).unwrap();
        job.begin_attempt().unwrap();
        job.transition(JobStatus::Completed).unwrap();

        for next in [JobStatus::Queued, JobStatus::Running, JobStatus::Cancelled] {
            let err = job.transition(next).unwrap_err();
            assert!(matches!(err, Error::InvalidTransition { .. }));
        }
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_failed_only_leads_to_dead_letter() {
        let mut job = test_job();
        job.transition(JobStatus::Queued).unwrap();
        job.begin_attempt().unwrap();
        job.transition(JobStatus::Failed).unwrap();
        assert!(job.transition(JobStatus::Queued).is_err());
        job.transition(JobStatus::DeadLetter).unwrap();
    }

    #[test]
    fn test_begin_attempt_respects_max_attempts() {
        let mut job = test_job();
        job.transition(JobStatus::Queued).unwrap();
        assert_eq!(job.begin_attempt().unwrap(), 1);
        job.transition(JobStatus::Queued).unwrap();
        assert_eq!(job.begin_attempt().unwrap(), 2);
        job.transition(JobStatus::Queued).unwrap();
        assert!(job.begin_attempt().is_err());
        assert_eq!(job.attempt_count, 2);
    }

    #[test]
    fn test_started_at_is_first_start() {
        let mut job = test_job();
        job.transition(JobStatus::Queued).unwrap();
        job.begin_attempt().unwrap();
        let first = job.started_at;
        job.transition(JobStatus::Queued).unwrap();
        job.begin_attempt().unwrap();
        assert_eq!(job.started_at, first);
    }

    #[test]
    fn test_call_budget_is_capped_by_remaining_budget() {
        let mut job = test_job();
        job.timeout = Duration::from_secs(10);
        job.attempt_timeout = Duration::from_secs(4);
        assert_eq!(job.next_call_budget(), Duration::from_secs(4));
        job.elapsed = Duration::from_secs(8);
        assert_eq!(job.next_call_budget(), Duration::from_secs(2));
        job.elapsed = Duration::from_secs(11);
        assert!(job.budget_exhausted());
        assert_eq!(job.next_call_budget(), Duration::ZERO);
    }

    #[test]
    fn test_replay_resets_attempts() {
        let mut job = test_job();
        job.attempt_count = 2;
        job.status = JobStatus::DeadLetter;
        job.error = Some("boom".into());

        let fresh = job.replay();
        assert_ne!(fresh.job_id, job.job_id);
        assert_eq!(fresh.attempt_count, 0);
        assert_eq!(fresh.status, JobStatus::Pending);
        assert_eq!(fresh.requeued_from, Some(job.job_id));
        assert_eq!(fresh.payload, job.payload);
        assert!(fresh.error.is_none());
        assert!(fresh.idempotency_key.is_none());
    }

    #[test]
    fn test_failure_kind_classification() {
        assert_eq!(FailureKind::from_status(429), FailureKind::RateLimited);
        assert_eq!(FailureKind::from_status(503), FailureKind::ServerError);
        assert_eq!(FailureKind::from_status(401), FailureKind::Unauthorized);
        assert_eq!(FailureKind::from_status(422), FailureKind::MalformedInput);
        assert_eq!(FailureKind::from_status(404), FailureKind::ClientError);

        assert!(FailureKind::CircuitOpen.is_retryable());
        assert!(FailureKind::Timeout.is_retryable());
        assert!(!FailureKind::Unauthorized.is_retryable());
        assert!(!FailureKind::ClientError.is_retryable());
        assert!(!FailureKind::CircuitOpen.counts_against_breaker());
        assert_eq!(FailureKind::Timeout.class(), FailureClass::Timeout);
    }

    #[test]
    fn test_job_serde_uses_millis() {
        let job = test_job();
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["timeout"], json!(60_000));
        assert_eq!(value["status"], json!("pending"));
        let back: Job = serde_json::from_value(value).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn test_submit_request_validation() {
        let ok = SubmitRequest::new("t", JobKind::Search, "index", json!({}));
        assert!(ok.validate().is_ok());
        assert!(ok.clone().with_max_attempts(0).validate().is_err());
        let empty = SubmitRequest::new("", JobKind::Search, "index", json!({}));
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_quota_rejection_display() {
        let rejection = QuotaRejection {
            reason: QuotaRejectReason::DailyQuotaExceeded,
            retry_after: None,
        };
        assert_eq!(rejection.to_string(), "DAILY_QUOTA_EXCEEDED");
    }
}
