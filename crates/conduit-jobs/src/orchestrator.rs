//! The job orchestrator facade.
//!
//! [`JobOrchestrator`] is what the API layer talks to: intake, status and
//! result polling, cancellation, and the administrative surface over
//! breakers, dead letters and quotas. Processing happens in the worker pool
//! started with [`JobOrchestrator::start`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use conduit_core::defaults;
use conduit_core::{
    DeadLetterEntry, DeadLetterFilter, Error, Job, JobDefaults, JobHandle, JobStatus, JobStore,
    Result, ResultLookup, SubmitRequest,
};

use crate::batcher::{BatchConfig, BatcherStats, MicroBatcher};
use crate::breaker::{BreakerConfig, BreakerSnapshot, CircuitBreakerRegistry};
use crate::capability::{Capability, CapabilityRegistry};
use crate::limits::ConcurrencyLimits;
use crate::memory_store::MemoryJobStore;
use crate::queue::{PriorityQueue, QueueConfig, QueueEntry};
use crate::quota::{QuotaConfig, QuotaManager, QuotaSnapshot, QuotaTier, TenantLimits};
use crate::registry::{Insert, JobRegistry};
use crate::retry::RetryPolicy;
use crate::store::{DeadLetterStore, ResultStore};
use crate::worker::{self, Shared, WorkerConfig, WorkerEvent, WorkerHandle};

/// Configuration for every orchestrator component.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub worker: WorkerConfig,
    pub queue: QueueConfig,
    pub batch: BatchConfig,
    pub breaker: BreakerConfig,
    pub retry: RetryPolicy,
    pub quota: QuotaConfig,
    pub jobs: JobDefaults,
    /// How long terminal outcomes stay pollable.
    pub result_ttl: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            queue: QueueConfig::default(),
            batch: BatchConfig::default(),
            breaker: BreakerConfig::default(),
            retry: RetryPolicy::default(),
            quota: QuotaConfig::default(),
            jobs: JobDefaults::default(),
            result_ttl: Duration::from_secs(defaults::RESULT_TTL_SECS),
        }
    }
}

impl OrchestratorConfig {
    /// Compose every component's `from_env`.
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `RESULT_TTL_SECS` | `86400` | Retention of terminal outcomes |
    pub fn from_env() -> Self {
        Self {
            worker: WorkerConfig::from_env(),
            queue: QueueConfig::from_env(),
            batch: BatchConfig::from_env(),
            breaker: BreakerConfig::from_env(),
            retry: RetryPolicy::from_env(),
            quota: QuotaConfig::from_env(),
            jobs: JobDefaults::from_env(),
            result_ttl: Duration::from_secs(
                std::env::var("RESULT_TTL_SECS")
                    .ok()
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(defaults::RESULT_TTL_SECS),
            ),
        }
    }

    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_quota(mut self, quota: QuotaConfig) -> Self {
        self.quota = quota;
        self
    }

    pub fn with_job_defaults(mut self, jobs: JobDefaults) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn with_result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = ttl;
        self
    }
}

/// Point-in-time counters for dashboards and health checks.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStats {
    pub queue_size: usize,
    pub queue_ready: usize,
    pub queue_deferred: usize,
    pub open_batches: usize,
    pub batched_jobs: usize,
    pub jobs_by_status: HashMap<JobStatus, usize>,
    pub dead_letters: usize,
    pub results: usize,
    pub accepting: bool,
}

/// What [`JobOrchestrator::restore`] brought back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub jobs: usize,
    pub interrupted: usize,
    pub dead_letters: usize,
    pub quota_tenants: usize,
}

/// Builder for creating an orchestrator with capabilities and a store.
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    capabilities: CapabilityRegistry,
    store: Option<Arc<dyn JobStore>>,
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            config: OrchestratorConfig::default(),
            capabilities: CapabilityRegistry::new(),
            store: None,
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a dependency capability.
    pub fn with_capability<C: Capability + 'static>(mut self, capability: C) -> Self {
        self.capabilities.register(Arc::new(capability));
        self
    }

    pub fn with_shared_capability(mut self, capability: Arc<dyn Capability>) -> Self {
        self.capabilities.register(capability);
        self
    }

    /// Persist through `store` instead of the in-memory default.
    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> JobOrchestrator {
        let config = self.config;
        let queue = PriorityQueue::new(config.queue.clone());
        let waker = queue.waker();
        let limits = ConcurrencyLimits::new(
            config.worker.dependency_max_inflight,
            config.worker.tenant_max_inflight,
            waker.clone(),
        );
        let batcher = MicroBatcher::new(config.batch.clone(), waker);
        let (events, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);
        let store: Arc<dyn JobStore> = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryJobStore::new()),
        };

        let shared = Shared {
            config: config.worker.clone(),
            result_ttl: config.result_ttl,
            queue,
            limits,
            batcher,
            breakers: CircuitBreakerRegistry::new(config.breaker.clone()),
            retry: config.retry.clone(),
            quota: QuotaManager::new(config.quota.clone()),
            registry: JobRegistry::new(),
            results: ResultStore::new(config.result_ttl),
            dead_letters: DeadLetterStore::new(),
            store,
            capabilities: self.capabilities,
            events,
            accepting: AtomicBool::new(true),
        };

        JobOrchestrator {
            shared: Arc::new(shared),
            jobs: config.jobs,
        }
    }
}

/// Intake, polling and admin surface over the worker pool.
#[derive(Clone)]
pub struct JobOrchestrator {
    shared: Arc<Shared>,
    jobs: JobDefaults,
}

impl JobOrchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    // =========================================================================
    // INTAKE
    // =========================================================================

    /// Admit a job.
    ///
    /// Fails with `QUOTA_EXCEEDED` or `QUEUE_SATURATED`; neither leaves any
    /// trace. A resubmission under an idempotency key held by a non-terminal
    /// job returns that job's handle.
    pub async fn submit(&self, request: SubmitRequest) -> Result<JobHandle> {
        let shared = &self.shared;
        if !shared.accepting.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        request.validate()?;
        if !shared.capabilities.contains(&request.target_dependency) {
            return Err(Error::InvalidInput(format!(
                "Unknown target dependency '{}'",
                request.target_dependency
            )));
        }

        if let Some(key) = &request.idempotency_key {
            if let Some(handle) = self.find_active(&request.tenant_id, key).await? {
                debug!(
                    subsystem = "jobs",
                    component = "intake",
                    job_id = %handle.job_id,
                    tenant_id = %request.tenant_id,
                    "Duplicate submission, returning existing job"
                );
                return Ok(handle);
            }
        }

        let admission = shared
            .quota
            .admit(&request.tenant_id, request.job_kind)
            .await
            .map_err(Error::QuotaExceeded)?;

        if shared.queue.is_saturated() {
            shared.quota.refund(&admission).await;
            return Err(Error::QueueSaturated {
                capacity: shared.queue.config().max_size,
            });
        }

        let mut job = Job::from_request(request, &self.jobs);
        job.arrival_seq = shared.queue.next_arrival_seq();
        job.transition(JobStatus::Queued)?;

        if let Insert::Existing(handle) = shared.registry.insert(job.clone()) {
            // Lost a race with a concurrent submission of the same key.
            shared.quota.refund(&admission).await;
            return Ok(handle);
        }

        // Persisted before it becomes visible to workers, so the store never
        // regresses a job a worker has already advanced.
        shared.persist(&job).await;

        if let Err(e) = shared.queue.enqueue(QueueEntry::for_job(&job)) {
            // Filled up since the check above; the caller never saw this id.
            shared.registry.remove(job.job_id);
            shared.quota.refund(&admission).await;
            if let Err(err) = shared.store.delete_job(job.job_id).await {
                warn!(
                    subsystem = "jobs",
                    component = "intake",
                    job_id = %job.job_id,
                    error = %err,
                    "Failed to delete rejected job record"
                );
            }
            return Err(e);
        }

        info!(
            subsystem = "jobs",
            component = "intake",
            job_id = %job.job_id,
            tenant_id = %job.tenant_id,
            job_kind = %job.job_kind,
            priority = %job.priority,
            dependency = %job.target_dependency,
            "Job queued"
        );
        Ok(job.handle())
    }

    async fn find_active(&self, tenant_id: &str, key: &str) -> Result<Option<JobHandle>> {
        if let Some(handle) = self.shared.registry.find_active(tenant_id, key) {
            return Ok(Some(handle));
        }
        let stored = self
            .shared
            .store
            .find_by_idempotency_key(tenant_id, key)
            .await?;
        Ok(stored.filter(|job| !job.is_terminal()).map(|job| job.handle()))
    }

    // =========================================================================
    // POLLING
    // =========================================================================

    pub async fn get_status(&self, job_id: Uuid) -> Result<JobStatus> {
        self.get_job(job_id).await.map(|job| job.status)
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Job> {
        if let Some(job) = self.shared.registry.get(job_id) {
            return Ok(job);
        }
        self.shared
            .store
            .get_job(job_id)
            .await?
            .ok_or(Error::JobNotFound(job_id))
    }

    /// Terminal outcome, `Pending` while the job is still live, or `NotFound`.
    pub async fn get_result(&self, job_id: Uuid) -> Result<ResultLookup> {
        if let Some(outcome) = self.shared.results.get(job_id) {
            return Ok(ResultLookup::Ready { outcome });
        }
        if let Some(status) = self.shared.registry.status(job_id) {
            if !status.is_terminal() {
                return Ok(ResultLookup::Pending);
            }
        }
        if let Some(outcome) = self.shared.store.get_result(job_id).await? {
            return Ok(ResultLookup::Ready { outcome });
        }
        match self.shared.store.get_job(job_id).await? {
            Some(job) if !job.is_terminal() => Ok(ResultLookup::Pending),
            _ => Ok(ResultLookup::NotFound),
        }
    }

    /// Cancel a job.
    ///
    /// A queued job is removed and becomes `CANCELLED` immediately. A running
    /// job is signalled; it ends `CANCELLED` once its worker observes the
    /// signal. Returns false for unknown or terminal jobs.
    pub async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        let shared = &self.shared;
        let Some(status) = shared.registry.status(job_id) else {
            return Ok(false);
        };
        match status {
            JobStatus::Queued if shared.queue.remove(job_id) => {
                let cancelled = shared
                    .registry
                    .update(job_id, |job| job.transition(JobStatus::Cancelled).map(|_| job.clone()));
                if let Some(Ok(job)) = cancelled {
                    shared.finish_cancelled(job).await;
                }
                Ok(true)
            }
            s if s.is_terminal() => Ok(false),
            _ => {
                // Dequeued or in flight: the worker finishes the cancellation.
                let signalled = shared.registry.request_cancel(job_id);
                if signalled {
                    info!(
                        subsystem = "jobs",
                        component = "intake",
                        job_id = %job_id,
                        status = %status,
                        "Cancellation requested"
                    );
                }
                Ok(signalled)
            }
        }
    }

    // =========================================================================
    // ADMIN: BREAKERS
    // =========================================================================

    pub fn breaker_snapshot(&self, dependency: &str) -> BreakerSnapshot {
        self.shared.breakers.snapshot(dependency)
    }

    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        self.shared.breakers.snapshots()
    }

    /// Force a dependency's breaker back to CLOSED.
    pub fn reset_breaker(&self, dependency: &str) {
        self.shared.breakers.reset(dependency);
        // Jobs deferred behind the open breaker may be worth another look.
        self.shared.queue.waker().notify_waiters();
    }

    // =========================================================================
    // ADMIN: DEAD LETTERS
    // =========================================================================

    pub fn list_dead_letters(&self, filter: &DeadLetterFilter) -> Vec<DeadLetterEntry> {
        self.shared.dead_letters.list(filter)
    }

    pub fn dead_letter(&self, job_id: Uuid) -> Option<DeadLetterEntry> {
        self.shared.dead_letters.get(job_id)
    }

    /// Re-admit a dead-lettered job as a fresh `QUEUED` job.
    ///
    /// The new job gets a new id and `attempt_count == 0`, and records the
    /// original in `requeued_from`. Quota is not charged again.
    pub async fn requeue_dead_letter(&self, job_id: Uuid) -> Result<JobHandle> {
        let shared = &self.shared;
        if !shared.accepting.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        let entry = shared
            .dead_letters
            .take(job_id)
            .ok_or_else(|| Error::NotFound(format!("Dead letter {}", job_id)))?;
        if shared.queue.is_saturated() {
            let capacity = shared.queue.config().max_size;
            shared.dead_letters.put(entry);
            return Err(Error::QueueSaturated { capacity });
        }

        let mut job = entry.job.replay();
        job.arrival_seq = shared.queue.next_arrival_seq();
        job.transition(JobStatus::Queued)?;
        shared.registry.insert(job.clone());
        shared.persist(&job).await;

        if let Err(e) = shared.queue.enqueue(QueueEntry::for_job(&job)) {
            shared.registry.remove(job.job_id);
            if let Err(err) = shared.store.delete_job(job.job_id).await {
                warn!(
                    subsystem = "jobs",
                    component = "admin",
                    job_id = %job.job_id,
                    error = %err,
                    "Failed to delete rejected replay record"
                );
            }
            shared.dead_letters.put(entry);
            return Err(e);
        }

        if let Err(e) = shared.store.remove_dead_letter(job_id).await {
            warn!(
                subsystem = "jobs",
                component = "admin",
                job_id = %job_id,
                error = %e,
                "Failed to remove stored dead letter after requeue"
            );
        }
        info!(
            subsystem = "jobs",
            component = "admin",
            op = "requeue",
            job_id = %job.job_id,
            requeued_from = %job_id,
            tenant_id = %job.tenant_id,
            reason = entry.reason.as_str(),
            "Dead letter requeued"
        );
        Ok(job.handle())
    }

    // =========================================================================
    // ADMIN: QUOTAS
    // =========================================================================

    pub async fn quota_snapshot(&self, tenant_id: &str) -> QuotaSnapshot {
        self.shared.quota.snapshot(tenant_id).await
    }

    pub async fn quota_snapshots(&self) -> Vec<QuotaSnapshot> {
        self.shared.quota.snapshots().await
    }

    pub async fn set_quota_tier(&self, tenant_id: &str, tier: QuotaTier) {
        self.shared.quota.set_tier(tenant_id, tier).await;
    }

    pub async fn set_quota_limits(&self, tenant_id: &str, limits: TenantLimits) {
        self.shared.quota.set_limits(tenant_id, limits).await;
    }

    pub async fn reset_quota(&self, tenant_id: &str) {
        self.shared.quota.reset(tenant_id).await;
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    pub fn stats(&self) -> OrchestratorStats {
        let shared = &self.shared;
        let BatcherStats {
            open_batches,
            flushed_waiting,
        } = shared.batcher.stats();
        OrchestratorStats {
            queue_size: shared.queue.size(),
            queue_ready: shared.queue.ready_len(),
            queue_deferred: shared.queue.deferred_len(),
            open_batches: open_batches.len() + flushed_waiting,
            batched_jobs: shared.batcher.pending_items(),
            jobs_by_status: shared.registry.counts(),
            dead_letters: shared.dead_letters.len(),
            results: shared.results.len(),
            accepting: shared.accepting.load(Ordering::SeqCst),
        }
    }

    pub fn batcher_stats(&self) -> BatcherStats {
        self.shared.batcher.stats()
    }

    pub fn is_accepting(&self) -> bool {
        self.shared.accepting.load(Ordering::SeqCst)
    }

    /// Reload persisted work: queued and interrupted jobs, dead letters and
    /// today's quota counters. Call before [`JobOrchestrator::start`].
    pub async fn restore(&self) -> Result<RestoreReport> {
        let shared = &self.shared;
        let mut report = RestoreReport::default();
        let now = Utc::now();

        for mut job in shared.store.load_recoverable().await? {
            if shared.registry.contains(job.job_id) {
                continue;
            }
            if job.status == JobStatus::Running {
                // The interrupted attempt never finished; it does not count.
                job.transition(JobStatus::Queued)?;
                job.attempt_count = job.attempt_count.saturating_sub(1);
                report.interrupted += 1;
            }
            let delay = job
                .visible_at
                .and_then(|at| (at - now).to_std().ok())
                .unwrap_or(Duration::ZERO);
            if let Insert::Existing(handle) = shared.registry.insert(job.clone()) {
                warn!(
                    subsystem = "jobs",
                    component = "restore",
                    job_id = %job.job_id,
                    existing = %handle.job_id,
                    "Skipping recovered job whose idempotency key is already active"
                );
                continue;
            }
            shared.queue.observe_arrival_seq(job.arrival_seq);
            shared.queue.enqueue_deferred(QueueEntry::for_job(&job), delay);
            shared.persist(&job).await;
            report.jobs += 1;
        }

        for entry in shared
            .store
            .list_dead_letters(&DeadLetterFilter::default())
            .await?
        {
            if shared.dead_letters.put(entry) {
                report.dead_letters += 1;
            }
        }

        let usage = shared
            .store
            .load_quota_usage(QuotaManager::window_start(now))
            .await?;
        report.quota_tenants = usage.len();
        shared.quota.restore_usage(usage).await;

        info!(
            subsystem = "jobs",
            component = "restore",
            jobs = report.jobs,
            interrupted = report.interrupted,
            dead_letters = report.dead_letters,
            quota_tenants = report.quota_tenants,
            "Restored persisted state"
        );
        Ok(report)
    }

    /// Start the worker pool and return a handle for control.
    pub fn start(&self) -> WorkerHandle {
        self.shared.accepting.store(true, Ordering::SeqCst);
        worker::start(self.shared.clone())
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.shared.events.subscribe()
    }

    /// Run one janitor pass now.
    pub async fn sweep(&self) {
        self.shared.sweep().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::EchoCapability;
    use conduit_core::{JobKind, JobOutcome, Priority};
    use serde_json::json;

    fn orchestrator(config: OrchestratorConfig) -> JobOrchestrator {
        JobOrchestrator::builder()
            .with_config(config)
            .with_capability(EchoCapability::new("echo"))
            .build()
    }

    fn request(tenant: &str) -> SubmitRequest {
        SubmitRequest::new(tenant, JobKind::Inference, "echo", json!({"prompt": "hi"}))
    }

    #[tokio::test]
    async fn test_submit_queues_job() {
        let orch = orchestrator(OrchestratorConfig::default());
        let handle = orch
            .submit(request("t").with_priority(Priority::High))
            .await
            .unwrap();
        assert_eq!(handle.status, JobStatus::Queued);
        assert_eq!(orch.get_status(handle.job_id).await.unwrap(), JobStatus::Queued);
        assert_eq!(orch.get_result(handle.job_id).await.unwrap(), ResultLookup::Pending);
        assert_eq!(orch.stats().queue_size, 1);
    }

    #[tokio::test]
    async fn test_unknown_dependency_is_rejected() {
        let orch = orchestrator(OrchestratorConfig::default());
        let err = orch
            .submit(SubmitRequest::new("t", JobKind::Search, "nope", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_saturated_queue_refunds_quota() {
        let config = OrchestratorConfig::default()
            .with_queue(QueueConfig::default().with_max_size(1))
            .with_quota(QuotaConfig::default().with_default_limits(100, 100));
        let store = Arc::new(MemoryJobStore::new());
        let orch = JobOrchestrator::builder()
            .with_config(config)
            .with_capability(EchoCapability::new("echo"))
            .with_store(store.clone())
            .build();
        orch.submit(request("t")).await.unwrap();

        let err = orch.submit(request("t")).await.unwrap_err();
        assert_eq!(err.code(), "QUEUE_SATURATED");
        assert_eq!(orch.quota_snapshot("t").await.daily_used, 1);
        // The rejected submission left no record behind.
        assert_eq!(store.job_count(), 1);
        assert_eq!(orch.stats().jobs_by_status.values().sum::<usize>(), 1);
    }

    #[tokio::test]
    async fn test_cancel_queued_job() {
        let orch = orchestrator(OrchestratorConfig::default());
        let handle = orch.submit(request("t")).await.unwrap();

        assert!(orch.cancel(handle.job_id).await.unwrap());
        assert_eq!(orch.get_status(handle.job_id).await.unwrap(), JobStatus::Cancelled);
        assert_eq!(
            orch.get_result(handle.job_id).await.unwrap(),
            ResultLookup::Ready {
                outcome: JobOutcome::Cancelled
            }
        );
        assert_eq!(orch.stats().queue_size, 0);
        // Already terminal.
        assert!(!orch.cancel(handle.job_id).await.unwrap());
        assert!(!orch.cancel(Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_job_lookups() {
        let orch = orchestrator(OrchestratorConfig::default());
        let id = Uuid::new_v4();
        assert!(matches!(orch.get_status(id).await, Err(Error::JobNotFound(_))));
        assert_eq!(orch.get_result(id).await.unwrap(), ResultLookup::NotFound);
    }

    #[tokio::test]
    async fn test_restore_requeues_interrupted_attempt() {
        let store = Arc::new(MemoryJobStore::new());
        let mut job = Job::from_request(request("t"), &JobDefaults::default());
        job.arrival_seq = 42;
        job.transition(JobStatus::Queued).unwrap();
        job.begin_attempt().unwrap();
        store.save_job(&job).await.unwrap();

        let orch = JobOrchestrator::builder()
            .with_capability(EchoCapability::new("echo"))
            .with_store(store)
            .build();
        let report = orch.restore().await.unwrap();
        assert_eq!(report.jobs, 1);
        assert_eq!(report.interrupted, 1);

        let restored = orch.get_job(job.job_id).await.unwrap();
        assert_eq!(restored.status, JobStatus::Queued);
        assert_eq!(restored.attempt_count, 0);
        assert_eq!(orch.stats().queue_ready, 1);
    }
}
