//! Centralized default constants for conduit.
//!
//! **This module is the single source of truth** for shared default values.
//! Component configs fall back to these when an environment variable is
//! missing or unparsable.

// =============================================================================
// JOBS
// =============================================================================

/// Default maximum attempts (first try plus retries) for a job.
pub const JOB_MAX_ATTEMPTS: u32 = 3;

/// Default wall-clock budget for the whole job, in seconds.
pub const JOB_TIMEOUT_SECS: u64 = 60;

/// Default budget for a single dependency call, in seconds.
pub const JOB_ATTEMPT_TIMEOUT_SECS: u64 = 30;

// =============================================================================
// WORKER POOL
// =============================================================================

/// Default number of workers in the pool.
pub const WORKER_COUNT: usize = 4;

/// Default in-flight dependency calls a single worker may hold.
pub const WORKER_MAX_INFLIGHT: usize = 4;

/// Default global cap of concurrent calls to any one dependency.
pub const DEPENDENCY_MAX_INFLIGHT: usize = 16;

/// Default cap of concurrently in-flight jobs per tenant.
pub const TENANT_MAX_INFLIGHT: usize = 8;

/// Safety-net poll interval while a worker waits for work, in milliseconds.
///
/// Workers are woken by enqueue notifications; the interval only covers
/// capacity released by other tenants.
pub const WORKER_POLL_INTERVAL_MS: u64 = 250;

/// Default grace period for in-flight attempts at shutdown, in milliseconds.
pub const SHUTDOWN_GRACE_MS: u64 = 10_000;

/// Interval of the result/record janitor, in seconds.
pub const JANITOR_INTERVAL_SECS: u64 = 60;

/// Default worker event broadcast channel capacity.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// QUEUE
// =============================================================================

/// Default maximum queue size (ready plus deferred entries).
pub const QUEUE_MAX_SIZE: usize = 10_000;

// =============================================================================
// BATCHING
// =============================================================================

/// Default maximum jobs per micro-batch.
pub const BATCH_MAX_SIZE: usize = 10;

/// Default micro-batch window in milliseconds.
pub const BATCH_WINDOW_MS: u64 = 100;

// =============================================================================
// CIRCUIT BREAKER
// =============================================================================

/// Consecutive failures that open a closed breaker.
pub const BREAKER_FAILURE_THRESHOLD: u32 = 5;

/// Consecutive half-open successes that close the breaker.
pub const BREAKER_SUCCESS_THRESHOLD: u32 = 2;

/// Time an open breaker waits before allowing a probe, in seconds.
pub const BREAKER_OPEN_TIMEOUT_SECS: u64 = 60;

/// Concurrent probe calls allowed while half-open.
pub const BREAKER_HALF_OPEN_PROBES: u32 = 3;

// =============================================================================
// RETRY
// =============================================================================

/// Initial retry delay in milliseconds.
pub const RETRY_INITIAL_DELAY_MS: u64 = 1_000;

/// Maximum retry delay in milliseconds.
pub const RETRY_MAX_DELAY_MS: u64 = 60_000;

/// Exponential backoff base.
pub const RETRY_EXPONENTIAL_BASE: f64 = 2.0;

/// Lower bound of the jitter factor.
pub const RETRY_JITTER_MIN: f64 = 0.75;

/// Upper bound of the jitter factor.
pub const RETRY_JITTER_MAX: f64 = 1.25;

// =============================================================================
// QUOTAS
// =============================================================================

/// Default daily admissions per tenant.
pub const QUOTA_DEFAULT_DAILY: u32 = 1_000;

/// Default admissions per minute per tenant.
pub const QUOTA_DEFAULT_RATE_PER_MINUTE: u32 = 60;

/// Length of the sliding rate window in seconds.
pub const QUOTA_RATE_WINDOW_SECS: i64 = 60;

// =============================================================================
// RESULTS
// =============================================================================

/// Time-to-live for terminal results, in seconds (24 hours).
pub const RESULT_TTL_SECS: u64 = 86_400;
