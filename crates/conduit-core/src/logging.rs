//! Structured logging schema and field name constants for conduit.
//!
//! Every crate uses these names for structured `tracing` fields so log
//! aggregation can query the same field across the queue, the workers and
//! the persistence layer.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue (breaker opened, job dead-lettered) |
//! | INFO  | Lifecycle events (startup, shutdown, completions, manual requeue) |
//! | DEBUG | Decision points (admission, retry scheduling, batch flushes) |
//! | TRACE | Per-item iteration (queue scans, probe accounting) |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Correlation ID propagated from the submitting request.
pub const REQUEST_ID: &str = "request_id";

/// Subsystem originating the log event.
/// Values: "jobs", "db"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "quota", "queue", "batcher", "breaker", "worker", "pool"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "admit", "enqueue", "flush", "invoke", "requeue"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Job UUID being processed.
pub const JOB_ID: &str = "job_id";

/// Job kind enum variant.
pub const JOB_KIND: &str = "job_kind";

/// Tenant owning the job.
pub const TENANT_ID: &str = "tenant_id";

/// Downstream dependency a job targets.
pub const DEPENDENCY: &str = "dependency";

/// Batch UUID.
pub const BATCH_ID: &str = "batch_id";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Attempt number (1-based) of a dependency call.
pub const ATTEMPT: &str = "attempt";

/// Backoff delay before the next attempt, in milliseconds.
pub const DELAY_MS: &str = "delay_ms";

/// Number of jobs in a batch.
pub const BATCH_SIZE: &str = "batch_size";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Failure kind reported by a dependency.
pub const FAILURE_KIND: &str = "failure_kind";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";

/// Breaker state after a transition.
pub const BREAKER_STATE: &str = "breaker_state";

/// Every field name in the schema, for validation of log pipelines.
pub const ALL_FIELDS: &[&str] = &[
    REQUEST_ID,
    SUBSYSTEM,
    COMPONENT,
    OPERATION,
    JOB_ID,
    JOB_KIND,
    TENANT_ID,
    DEPENDENCY,
    BATCH_ID,
    DURATION_MS,
    ATTEMPT,
    DELAY_MS,
    BATCH_SIZE,
    FAILURE_KIND,
    ERROR_MSG,
    BREAKER_STATE,
];
