//! # conduit-jobs
//!
//! Job orchestration runtime for conduit.
//!
//! This crate provides:
//! - Per-tenant daily quotas and sliding-window rate limits at intake
//! - A bounded priority queue with FIFO order inside each level
//! - Micro-batching of compatible jobs per dependency
//! - Circuit breakers and exponential-backoff retries around dependency calls
//! - A worker pool with per-dependency and per-tenant concurrency caps
//! - Result and dead-letter stores with write-through persistence
//!
//! ## Example
//!
//! ```ignore
//! use conduit_jobs::{EchoCapability, JobKind, JobOrchestrator, SubmitRequest};
//! use serde_json::json;
//!
//! let orchestrator = JobOrchestrator::builder()
//!     .with_capability(EchoCapability::new("llm"))
//!     .build();
//!
//! // Start workers and get handle
//! let handle = orchestrator.start();
//!
//! let job = orchestrator
//!     .submit(SubmitRequest::new("tenant-a", JobKind::Inference, "llm", json!({"prompt": "hi"})))
//!     .await?;
//!
//! // Listen for events
//! let mut events = handle.events();
//! while let Ok(event) = events.recv().await {
//!     println!("Event: {:?}", event);
//! }
//!
//! // Graceful shutdown
//! handle.shutdown().await?;
//! ```

pub mod batcher;
pub mod breaker;
pub mod capability;
pub mod limits;
pub mod memory_store;
pub mod orchestrator;
pub mod queue;
pub mod quota;
pub mod registry;
pub mod retry;
pub mod store;
pub mod worker;

// Re-export core types
pub use conduit_core::*;

// Re-export orchestration types
pub use batcher::{Batch, BatchConfig, BatchKey, BatcherStats, FlushTrigger, MicroBatcher, Offer};
pub use breaker::{BreakerConfig, BreakerSnapshot, CallPermit, CircuitBreakerRegistry, CircuitState};
pub use capability::{Capability, CapabilityRegistry, EchoCapability, HttpCapability};
pub use memory_store::MemoryJobStore;
pub use orchestrator::{
    JobOrchestrator, OrchestratorBuilder, OrchestratorConfig, OrchestratorStats, RestoreReport,
};
pub use queue::{PriorityQueue, QueueConfig, QueueEntry};
pub use quota::{Admission, QuotaConfig, QuotaManager, QuotaSnapshot, QuotaTier, TenantLimits};
pub use retry::{RetryDecision, RetryPolicy};
pub use store::{DeadLetterStore, ResultStore};
pub use worker::{WorkerConfig, WorkerEvent, WorkerHandle};

/// Default number of worker tasks.
pub const DEFAULT_WORKER_COUNT: usize = conduit_core::defaults::WORKER_COUNT;

/// Default polling interval for idle workers (milliseconds).
pub const DEFAULT_POLL_INTERVAL_MS: u64 = conduit_core::defaults::WORKER_POLL_INTERVAL_MS;
