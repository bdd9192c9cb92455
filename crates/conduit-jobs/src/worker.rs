//! Worker pool: dequeue, batch, gate, invoke and route jobs.
//!
//! Each of the N workers loops over: take a window-flushed batch, or claim
//! the next queue entry whose tenant is under its in-flight cap and offer it
//! to the micro-batcher. Dispatchable batches run as tasks on the worker's
//! `JoinSet`, bounded by a per-worker semaphore. A batch task claims its jobs
//! for an attempt, consults the dependency's circuit breaker, waits for a
//! dependency slot, invokes the capability and routes every job to the
//! result store, a deferred retry, or the dead-letter store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use futures::FutureExt;
use serde_json::Value as JsonValue;
use tokio::sync::{broadcast, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use conduit_core::defaults;
use conduit_core::{
    DeadLetterEntry, DeadLetterReason, Error, FailureKind, InvokeError, InvokeResult, Job,
    JobKind, JobOutcome, JobStatus, JobStore, Result,
};

use crate::batcher::{Batch, BatchKey, MicroBatcher, Offer};
use crate::breaker::{CircuitBreakerRegistry, CircuitState};
use crate::capability::{Capability, CapabilityRegistry};
use crate::limits::{ConcurrencyLimits, TenantPermit};
use crate::queue::{PriorityQueue, QueueEntry};
use crate::quota::QuotaManager;
use crate::registry::{Claim, JobRegistry};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::store::{DeadLetterStore, ResultStore};

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of concurrent workers.
    pub worker_count: usize,
    /// In-flight dependency calls per worker.
    pub max_inflight_per_worker: usize,
    /// In-flight calls to any one dependency, across all workers.
    pub dependency_max_inflight: usize,
    /// In-flight jobs per tenant, across all workers.
    pub tenant_max_inflight: usize,
    /// Idle re-check interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Time in-flight attempts get to finish on shutdown.
    pub shutdown_grace_ms: u64,
    /// Interval of the result/record purge task.
    pub janitor_interval_secs: u64,
    /// Whether to start workers at all.
    pub enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: defaults::WORKER_COUNT,
            max_inflight_per_worker: defaults::WORKER_MAX_INFLIGHT,
            dependency_max_inflight: defaults::DEPENDENCY_MAX_INFLIGHT,
            tenant_max_inflight: defaults::TENANT_MAX_INFLIGHT,
            poll_interval_ms: defaults::WORKER_POLL_INTERVAL_MS,
            shutdown_grace_ms: defaults::SHUTDOWN_GRACE_MS,
            janitor_interval_secs: defaults::JANITOR_INTERVAL_SECS,
            enabled: true,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_WORKER_ENABLED` | `true` | Enable/disable job processing |
    /// | `JOB_WORKER_COUNT` | `4` | Concurrent workers |
    /// | `JOB_WORKER_MAX_INFLIGHT` | `4` | In-flight calls per worker |
    /// | `JOB_DEPENDENCY_MAX_INFLIGHT` | `16` | In-flight calls per dependency |
    /// | `JOB_TENANT_MAX_INFLIGHT` | `8` | In-flight jobs per tenant |
    /// | `JOB_POLL_INTERVAL_MS` | `250` | Idle re-check interval |
    /// | `JOB_SHUTDOWN_GRACE_MS` | `10000` | Grace period for in-flight attempts |
    pub fn from_env() -> Self {
        let env_usize = |key: &str, default: usize| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(default)
                .max(1)
        };
        let env_u64 = |key: &str, default: u64| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(default)
        };

        Self {
            worker_count: env_usize("JOB_WORKER_COUNT", defaults::WORKER_COUNT),
            max_inflight_per_worker: env_usize(
                "JOB_WORKER_MAX_INFLIGHT",
                defaults::WORKER_MAX_INFLIGHT,
            ),
            dependency_max_inflight: env_usize(
                "JOB_DEPENDENCY_MAX_INFLIGHT",
                defaults::DEPENDENCY_MAX_INFLIGHT,
            ),
            tenant_max_inflight: env_usize(
                "JOB_TENANT_MAX_INFLIGHT",
                defaults::TENANT_MAX_INFLIGHT,
            ),
            poll_interval_ms: env_u64("JOB_POLL_INTERVAL_MS", defaults::WORKER_POLL_INTERVAL_MS),
            shutdown_grace_ms: env_u64("JOB_SHUTDOWN_GRACE_MS", defaults::SHUTDOWN_GRACE_MS),
            janitor_interval_secs: defaults::JANITOR_INTERVAL_SECS,
            enabled: std::env::var("JOB_WORKER_ENABLED")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
        }
    }

    pub fn with_worker_count(mut self, n: usize) -> Self {
        self.worker_count = n;
        self
    }

    pub fn with_max_inflight(mut self, n: usize) -> Self {
        self.max_inflight_per_worker = n;
        self
    }

    pub fn with_dependency_max_inflight(mut self, n: usize) -> Self {
        self.dependency_max_inflight = n;
        self
    }

    pub fn with_tenant_max_inflight(mut self, n: usize) -> Self {
        self.tenant_max_inflight = n;
        self
    }

    /// Create a new config with custom poll interval.
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn with_shutdown_grace(mut self, ms: u64) -> Self {
        self.shutdown_grace_ms = ms;
        self
    }

    pub fn with_janitor_interval(mut self, secs: u64) -> Self {
        self.janitor_interval_secs = secs;
        self
    }

    /// Enable or disable job processing.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Event emitted by the worker pool.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A worker entered its loop.
    WorkerStarted { worker_id: usize },
    /// An attempt was dispatched.
    JobStarted {
        job_id: Uuid,
        job_kind: JobKind,
        attempt: u32,
    },
    JobCompleted {
        job_id: Uuid,
        job_kind: JobKind,
        duration_ms: u64,
    },
    /// A failed attempt was re-enqueued behind a delay.
    JobRetryScheduled {
        job_id: Uuid,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    JobDeadLettered {
        job_id: Uuid,
        reason: DeadLetterReason,
        error: String,
    },
    JobCancelled { job_id: Uuid },
    JobTimedOut { job_id: Uuid },
    /// A dependency's circuit breaker tripped.
    BreakerOpened { dependency: String },
    /// A worker left its loop.
    WorkerStopped { worker_id: usize },
}

/// A dequeued job, holding its tenant slot until routed.
pub(crate) struct Claimed {
    pub(crate) entry: QueueEntry,
    tenant: TenantPermit,
}

/// State shared by the orchestrator facade and every worker.
pub(crate) struct Shared {
    pub(crate) config: WorkerConfig,
    pub(crate) result_ttl: Duration,
    pub(crate) queue: PriorityQueue,
    pub(crate) limits: ConcurrencyLimits,
    pub(crate) batcher: MicroBatcher<Claimed>,
    pub(crate) breakers: CircuitBreakerRegistry,
    pub(crate) retry: RetryPolicy,
    pub(crate) quota: QuotaManager,
    pub(crate) registry: JobRegistry,
    pub(crate) results: ResultStore,
    pub(crate) dead_letters: DeadLetterStore,
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) capabilities: CapabilityRegistry,
    pub(crate) events: broadcast::Sender<WorkerEvent>,
    pub(crate) accepting: AtomicBool,
}

fn timeout_error(budget: Duration) -> InvokeError {
    InvokeError::timeout(format!("Attempt exceeded {}ms", budget.as_millis()))
}

impl Shared {
    pub(crate) fn emit(&self, event: WorkerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Write the job through to the store. Failures are logged; the
    /// in-memory copy stays authoritative.
    pub(crate) async fn persist(&self, job: &Job) {
        if let Err(e) = self.store.save_job(job).await {
            error!(
                subsystem = "jobs",
                component = "worker",
                op = "persist",
                job_id = %job.job_id,
                status = %job.status,
                error = %e,
                "Failed to persist job"
            );
        }
    }

    /// Record a terminal outcome and persist the job.
    pub(crate) async fn record_outcome(&self, job: &Job, outcome: JobOutcome) {
        self.results.put(job.job_id, outcome.clone());
        let ttl = ChronoDuration::from_std(self.result_ttl).unwrap_or_else(|_| ChronoDuration::zero());
        if let Err(e) = self
            .store
            .save_result(job.job_id, &outcome, Utc::now() + ttl)
            .await
        {
            error!(
                subsystem = "jobs",
                component = "worker",
                op = "save_result",
                job_id = %job.job_id,
                error = %e,
                "Failed to persist job outcome"
            );
        }
        self.persist(job).await;
    }

    async fn put_dead_letter(&self, entry: DeadLetterEntry) {
        if !self.dead_letters.put(entry.clone()) {
            return;
        }
        if let Err(e) = self.store.save_dead_letter(&entry).await {
            error!(
                subsystem = "jobs",
                component = "worker",
                op = "dead_letter",
                job_id = %entry.job.job_id,
                error = %e,
                "Failed to persist dead letter"
            );
        }
    }

    /// Finish a job that was cancelled before its attempt started.
    pub(crate) async fn finish_cancelled(&self, job: Job) {
        info!(
            subsystem = "jobs",
            component = "worker",
            job_id = %job.job_id,
            tenant_id = %job.tenant_id,
            "Job cancelled"
        );
        self.record_outcome(&job, JobOutcome::Cancelled).await;
        self.emit(WorkerEvent::JobCancelled { job_id: job.job_id });
    }

    async fn finish_timed_out(&self, job: Job) {
        warn!(
            subsystem = "jobs",
            component = "worker",
            job_id = %job.job_id,
            attempt = job.attempt_count,
            budget_ms = job.timeout.as_millis() as u64,
            "Job exceeded its total time budget"
        );
        self.record_outcome(
            &job,
            JobOutcome::TimedOut {
                attempts: job.attempt_count,
            },
        )
        .await;
        self.emit(WorkerEvent::JobTimedOut { job_id: job.job_id });
    }

    async fn finish_cancelled_in_flight(&self, job_id: Uuid) {
        let cancelled = self
            .registry
            .update(job_id, |job| job.transition(JobStatus::Cancelled).map(|_| job.clone()));
        let Some(Ok(job)) = cancelled else {
            return;
        };
        self.put_dead_letter(DeadLetterEntry {
            job: job.clone(),
            reason: DeadLetterReason::CancelledInFlight,
            failure_kind: None,
            last_error: Some("Cancelled while running".to_string()),
            dead_lettered_at: Utc::now(),
        })
        .await;
        self.finish_cancelled(job).await;
    }

    async fn complete(&self, job_id: Uuid, result: JsonValue, took: Duration) {
        let completed = self.registry.update(job_id, |job| {
            job.error = None;
            job.transition(JobStatus::Completed).map(|_| job.clone())
        });
        match completed {
            Some(Ok(job)) => {
                info!(
                    subsystem = "jobs",
                    component = "worker",
                    job_id = %job_id,
                    job_kind = %job.job_kind,
                    attempt = job.attempt_count,
                    duration_ms = took.as_millis() as u64,
                    "Job completed"
                );
                self.record_outcome(&job, JobOutcome::Completed { result }).await;
                self.emit(WorkerEvent::JobCompleted {
                    job_id,
                    job_kind: job.job_kind,
                    duration_ms: took.as_millis() as u64,
                });
            }
            Some(Err(e)) => warn!(
                subsystem = "jobs",
                component = "worker",
                job_id = %job_id,
                error = %e,
                "Discarding result for job no longer running"
            ),
            None => {}
        }
    }

    /// Route a failed attempt: timed out, retried, or dead-lettered.
    async fn handle_failure(&self, job_id: Uuid, failure: InvokeError) {
        let Some(job) = self.registry.get(job_id) else {
            return;
        };
        if job.status != JobStatus::Running {
            return;
        }

        if job.budget_exhausted() {
            let timed_out = self.registry.update(job_id, |job| {
                job.error = Some(failure.to_string());
                job.transition(JobStatus::TimedOut).map(|_| job.clone())
            });
            if let Some(Ok(job)) = timed_out {
                self.finish_timed_out(job).await;
            }
            return;
        }

        match self.retry.decide(&job, failure.kind) {
            RetryDecision::Retry { delay } => {
                let visible_at =
                    Utc::now() + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::zero());
                let requeued = self.registry.update(job_id, |job| {
                    job.transition(JobStatus::Queued)?;
                    job.visible_at = Some(visible_at);
                    job.error = Some(failure.to_string());
                    Ok::<Job, Error>(job.clone())
                });
                let Some(Ok(job)) = requeued else {
                    return;
                };
                self.queue.enqueue_deferred(QueueEntry::for_job(&job), delay);
                info!(
                    subsystem = "jobs",
                    component = "worker",
                    job_id = %job_id,
                    attempt = job.attempt_count,
                    max_attempts = job.max_attempts,
                    failure_kind = %failure.kind,
                    delay_ms = delay.as_millis() as u64,
                    "Retry scheduled"
                );
                self.persist(&job).await;
                self.emit(WorkerEvent::JobRetryScheduled {
                    job_id,
                    attempt: job.attempt_count,
                    delay_ms: delay.as_millis() as u64,
                    error: failure.to_string(),
                });
            }
            RetryDecision::DeadLetter(reason) => {
                let failed = self.registry.update(job_id, |job| {
                    job.error = Some(failure.to_string());
                    job.transition(JobStatus::Failed)?;
                    job.transition(JobStatus::DeadLetter)?;
                    Ok::<Job, Error>(job.clone())
                });
                let Some(Ok(job)) = failed else {
                    return;
                };
                warn!(
                    subsystem = "jobs",
                    component = "worker",
                    job_id = %job_id,
                    tenant_id = %job.tenant_id,
                    dependency = %job.target_dependency,
                    attempt = job.attempt_count,
                    reason = reason.as_str(),
                    error = %failure,
                    "Job dead-lettered"
                );
                self.put_dead_letter(DeadLetterEntry {
                    job: job.clone(),
                    reason,
                    failure_kind: Some(failure.kind),
                    last_error: Some(failure.to_string()),
                    dead_lettered_at: Utc::now(),
                })
                .await;
                self.record_outcome(
                    &job,
                    JobOutcome::Failed {
                        kind: Some(failure.kind),
                        error: failure.to_string(),
                        attempts: job.attempt_count,
                    },
                )
                .await;
                self.emit(WorkerEvent::JobDeadLettered {
                    job_id,
                    reason,
                    error: failure.to_string(),
                });
            }
        }
    }

    /// Next dispatchable batch, if any.
    fn next_work(&self) -> Option<Batch<Claimed>> {
        if let Some(batch) = self.batcher.take_flushed() {
            return Some(batch);
        }
        loop {
            let mut permit = None;
            let entry = self.queue.dequeue_with(|entry| {
                permit = self.limits.try_reserve_tenant(&entry.tenant_id);
                permit.is_some()
            })?;
            let Some(tenant) = permit else {
                self.queue.restore(entry);
                return None;
            };
            let key = BatchKey::new(entry.target_dependency.clone(), entry.job_kind);
            match self.batcher.offer(key, Claimed { entry, tenant }) {
                Offer::Dispatch(batch) => return Some(batch),
                Offer::Joined { .. } => continue,
            }
        }
    }

    async fn invoke_single(
        &self,
        capability: &dyn Capability,
        job: &Job,
        budget: Duration,
    ) -> (InvokeResult, bool) {
        let call = tokio::time::timeout(budget, capability.invoke(job.job_kind, &job.payload, budget));
        let Some(cancel) = self.registry.cancel_signal(job.job_id) else {
            return (call.await.unwrap_or_else(|_| Err(timeout_error(budget))), false);
        };
        tokio::select! {
            outcome = call => (outcome.unwrap_or_else(|_| Err(timeout_error(budget))), false),
            _ = cancel.notified() => (
                Err(InvokeError::new(FailureKind::ClientError, "Cancelled in flight")),
                true,
            ),
        }
    }

    async fn invoke_many(
        &self,
        capability: &dyn Capability,
        kind: JobKind,
        jobs: &[Job],
        budget: Duration,
    ) -> Vec<InvokeResult> {
        let payloads: Vec<JsonValue> = jobs.iter().map(|j| j.payload.clone()).collect();
        match tokio::time::timeout(budget, capability.invoke_batch(kind, &payloads, budget)).await {
            Ok(results) if results.len() == payloads.len() => results,
            Ok(results) => {
                warn!(
                    subsystem = "jobs",
                    component = "worker",
                    dependency = capability.name(),
                    expected = payloads.len(),
                    returned = results.len(),
                    "Batch response not aligned with request"
                );
                let failure = InvokeError::new(
                    FailureKind::ServerError,
                    format!(
                        "Batch returned {} results for {} jobs",
                        results.len(),
                        payloads.len()
                    ),
                );
                payloads.iter().map(|_| Err(failure.clone())).collect()
            }
            Err(_) => payloads.iter().map(|_| Err(timeout_error(budget))).collect(),
        }
    }

    /// One call, one breaker observation.
    fn observe_breaker(&self, dependency: &str, results: &[InvokeResult], aborted: bool) {
        if aborted {
            self.breakers.release(dependency);
            return;
        }
        if results.iter().any(|r| r.is_ok()) {
            self.breakers.record_success(dependency);
            return;
        }
        let counted = results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .find(|e| e.kind.counts_against_breaker());
        match counted {
            Some(failure) => {
                if self.breakers.record_failure(dependency, &failure.to_string())
                    == Some(CircuitState::Open)
                {
                    self.emit(WorkerEvent::BreakerOpened {
                        dependency: dependency.to_string(),
                    });
                }
            }
            None => self.breakers.release(dependency),
        }
    }

    async fn process_batch(self: Arc<Self>, batch: Batch<Claimed>) {
        let dependency = batch.key.dependency.clone();
        let kind = batch.key.kind;
        let batch_id = batch.id;

        // Tenant slots stay held until each job is routed.
        let mut running: Vec<(Job, TenantPermit)> = Vec::with_capacity(batch.len());
        for claimed in batch.items {
            match self.registry.claim(claimed.entry.job_id) {
                Claim::Started(job) => running.push((job, claimed.tenant)),
                Claim::Cancelled(job) => self.finish_cancelled(job).await,
                Claim::TimedOut(job) => self.finish_timed_out(job).await,
                Claim::Gone => debug!(
                    subsystem = "jobs",
                    component = "worker",
                    job_id = %claimed.entry.job_id,
                    "Dequeued job no longer claimable"
                ),
            }
        }
        if running.is_empty() {
            return;
        }

        for (job, _) in &running {
            self.persist(job).await;
            self.emit(WorkerEvent::JobStarted {
                job_id: job.job_id,
                job_kind: job.job_kind,
                attempt: job.attempt_count,
            });
        }

        let Some(capability) = self.capabilities.get(&dependency) else {
            let failure = InvokeError::new(
                FailureKind::ClientError,
                format!("No capability registered for dependency '{}'", dependency),
            );
            for (job, _) in &running {
                self.handle_failure(job.job_id, failure.clone()).await;
            }
            return;
        };

        let Some(breaker_permit) = self.breakers.admit(&dependency) else {
            let failure = InvokeError::new(
                FailureKind::CircuitOpen,
                format!("Circuit open for dependency '{}'", dependency),
            );
            for (job, _) in &running {
                self.handle_failure(job.job_id, failure.clone()).await;
            }
            return;
        };

        let slot = match self.limits.acquire_dependency(&dependency).await {
            Ok(slot) => slot,
            Err(e) => {
                drop(breaker_permit);
                let failure = InvokeError::new(FailureKind::Connection, e.to_string());
                for (job, _) in &running {
                    self.handle_failure(job.job_id, failure.clone()).await;
                }
                return;
            }
        };

        let budget = running
            .iter()
            .map(|(job, _)| job.next_call_budget())
            .min()
            .unwrap_or_default();
        debug!(
            subsystem = "jobs",
            component = "worker",
            dependency = %dependency,
            job_kind = %kind,
            batch_id,
            batch_size = running.len(),
            budget_ms = budget.as_millis() as u64,
            "Dispatching"
        );

        let started = Instant::now();
        let (results, aborted) = if running.len() == 1 {
            let (result, aborted) = self
                .invoke_single(capability.as_ref(), &running[0].0, budget)
                .await;
            (vec![result], aborted)
        } else {
            let jobs: Vec<Job> = running.iter().map(|(job, _)| job.clone()).collect();
            (
                self.invoke_many(capability.as_ref(), kind, &jobs, budget)
                    .await,
                false,
            )
        };
        let took = started.elapsed();
        drop(slot);

        self.observe_breaker(&dependency, &results, aborted);
        breaker_permit.settle();

        for ((job, _tenant), result) in running.into_iter().zip(results) {
            self.registry.update(job.job_id, |j| j.elapsed += took);
            if self.registry.is_cancel_requested(job.job_id) {
                self.finish_cancelled_in_flight(job.job_id).await;
                continue;
            }
            match result {
                Ok(value) => self.complete(job.job_id, value, took).await,
                Err(failure) => self.handle_failure(job.job_id, failure).await,
            }
        }
    }

    /// Purge expired results and records, checkpoint quota counters and
    /// forget idle tenants.
    pub(crate) async fn sweep(&self) {
        let purged_results = self.results.purge_expired();
        let ttl = ChronoDuration::from_std(self.result_ttl).unwrap_or_else(|_| ChronoDuration::zero());
        let cutoff = Utc::now() - ttl;
        let purged_jobs = self.registry.purge_terminal_before(cutoff);
        if let Err(e) = self.store.purge_terminal_before(cutoff).await {
            error!(
                subsystem = "jobs",
                component = "janitor",
                error = %e,
                "Failed to purge stored job records"
            );
        }
        self.checkpoint_quota().await;
        self.quota.evict_idle().await;
        if purged_results + purged_jobs > 0 {
            debug!(
                subsystem = "jobs",
                component = "janitor",
                purged_results,
                purged_jobs,
                "Purged expired entries"
            );
        }
    }

    pub(crate) async fn checkpoint_quota(&self) {
        for usage in self.quota.usage().await {
            if let Err(e) = self.store.save_quota_usage(&usage).await {
                error!(
                    subsystem = "jobs",
                    component = "quota",
                    tenant_id = %usage.tenant_id,
                    error = %e,
                    "Failed to persist quota usage"
                );
            }
        }
    }
}

// =============================================================================
// POOL
// =============================================================================

/// Handle for controlling a running worker pool.
///
/// Dropping the handle without calling [`WorkerHandle::shutdown`] also stops
/// the workers, but nothing waits for them to drain.
pub struct WorkerHandle {
    shared: Arc<Shared>,
    /// Carries the drain deadline once shutdown begins.
    shutdown_tx: watch::Sender<Option<Instant>>,
    supervisor: StdMutex<Option<JoinHandle<()>>>,
    event_rx: broadcast::Receiver<WorkerEvent>,
}

impl WorkerHandle {
    /// Stop admissions, drain in-flight work and persist what is left.
    ///
    /// Returns once the pool has fully stopped. Calling it again is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        self.shared.accepting.store(false, Ordering::SeqCst);
        let deadline = Instant::now() + self.shared.config.shutdown_grace();
        self.shutdown_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(deadline);
            true
        });
        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(supervisor) = supervisor {
            supervisor
                .await
                .map_err(|e| Error::Internal(format!("Worker pool task failed: {}", e)))?;
        }
        Ok(())
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }
}

/// Start workers and the janitor over `shared`.
pub(crate) fn start(shared: Arc<Shared>) -> WorkerHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(None);
    let event_rx = shared.events.subscribe();
    let supervisor = tokio::spawn(supervise(shared.clone(), shutdown_rx));
    WorkerHandle {
        shared,
        shutdown_tx,
        supervisor: StdMutex::new(Some(supervisor)),
        event_rx,
    }
}

async fn supervise(shared: Arc<Shared>, mut shutdown: watch::Receiver<Option<Instant>>) {
    let config = shared.config.clone();
    let mut workers = JoinSet::new();
    if config.enabled {
        for worker_id in 0..config.worker_count.max(1) {
            workers.spawn(run_worker(shared.clone(), worker_id, shutdown.clone()));
        }
        workers.spawn(run_janitor(shared.clone(), shutdown.clone()));
        info!(
            subsystem = "jobs",
            component = "pool",
            workers = config.worker_count,
            max_inflight = config.max_inflight_per_worker,
            "Worker pool started"
        );
    } else {
        info!(subsystem = "jobs", component = "pool", "Job workers are disabled, not starting");
    }

    while shutdown.borrow().is_none() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
    let deadline = drain_deadline(&shutdown, &config);
    info!(subsystem = "jobs", component = "pool", "Worker pool shutting down");

    // Open batches go out now rather than waiting for their window.
    let mut flushed = JoinSet::new();
    for batch in shared.batcher.flush_all() {
        flushed.spawn(shared.clone().process_batch(batch));
    }

    drain(&mut flushed, deadline, "flushed batches").await;
    while let Some(result) = workers.join_next().await {
        if let Err(e) = result {
            error!(subsystem = "jobs", component = "pool", error = ?e, "Worker task panicked");
        }
    }

    // Anything offered after the flush stays QUEUED and is persisted below.
    let late = shared.batcher.flush_all();
    if !late.is_empty() {
        debug!(
            subsystem = "jobs",
            component = "pool",
            batches = late.len(),
            "Leaving late batches queued"
        );
    }
    drop(late);

    let interrupted = shared.registry.requeue_running();
    if !interrupted.is_empty() {
        warn!(
            subsystem = "jobs",
            component = "pool",
            count = interrupted.len(),
            "Requeued attempts interrupted by shutdown"
        );
    }
    let queued = shared.registry.with_status(JobStatus::Queued);
    for job in &queued {
        shared.persist(job).await;
    }
    shared.checkpoint_quota().await;
    info!(
        subsystem = "jobs",
        component = "pool",
        persisted = queued.len(),
        "Worker pool stopped"
    );
}

/// Deadline sent with the shutdown signal, or one grace period from now if
/// the handle was dropped instead.
fn drain_deadline(shutdown: &watch::Receiver<Option<Instant>>, config: &WorkerConfig) -> Instant {
    (*shutdown.borrow()).unwrap_or_else(|| Instant::now() + config.shutdown_grace())
}

async fn drain(tasks: &mut JoinSet<()>, deadline: Instant, what: &str) {
    let finished = tokio::time::timeout_at(deadline, async {
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(subsystem = "jobs", component = "pool", error = ?e, "Job task panicked");
            }
        }
    })
    .await;
    if finished.is_err() {
        warn!(
            subsystem = "jobs",
            component = "pool",
            abandoned = tasks.len(),
            what,
            "Shutdown grace elapsed, abandoning in-flight attempts"
        );
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
}

async fn run_worker(
    shared: Arc<Shared>,
    worker_id: usize,
    mut shutdown: watch::Receiver<Option<Instant>>,
) {
    let max_inflight = shared.config.max_inflight_per_worker.max(1);
    let poll_interval = Duration::from_millis(shared.config.poll_interval_ms.max(1));
    let slots = Arc::new(Semaphore::new(max_inflight));
    let waker = shared.queue.waker();
    let mut tasks: JoinSet<()> = JoinSet::new();

    debug!(subsystem = "jobs", component = "worker", worker_id, max_inflight, "Worker started");
    shared.emit(WorkerEvent::WorkerStarted { worker_id });

    loop {
        while let Some(Some(result)) = tasks.join_next().now_or_never() {
            if let Err(e) = result {
                error!(subsystem = "jobs", component = "worker", worker_id, error = ?e, "Job task panicked");
            }
        }
        if shutdown.borrow().is_some() {
            break;
        }

        let slot = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            slot = slots.clone().acquire_owned() => match slot {
                Ok(slot) => slot,
                Err(_) => break,
            },
        };

        // Registered before looking, so a wake-up in between is not lost.
        let notified = waker.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        match shared.next_work() {
            Some(batch) => {
                let shared = shared.clone();
                tasks.spawn(async move {
                    shared.process_batch(batch).await;
                    drop(slot);
                });
            }
            None => {
                drop(slot);
                let wait = shared
                    .queue
                    .next_visible_at()
                    .map(|at| at.saturating_duration_since(Instant::now()).min(poll_interval))
                    .unwrap_or(poll_interval);
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = &mut notified => {}
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }
    }

    let deadline = drain_deadline(&shutdown, &shared.config);
    drain(&mut tasks, deadline, "worker").await;
    debug!(subsystem = "jobs", component = "worker", worker_id, "Worker stopped");
    shared.emit(WorkerEvent::WorkerStopped { worker_id });
}

async fn run_janitor(shared: Arc<Shared>, mut shutdown: watch::Receiver<Option<Instant>>) {
    let period = Duration::from_secs(shared.config.janitor_interval_secs.max(1));
    let mut interval = tokio::time::interval(period);
    // The first tick completes immediately.
    interval.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => shared.sweep().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.worker_count, defaults::WORKER_COUNT);
        assert_eq!(config.max_inflight_per_worker, 4);
        assert_eq!(config.poll_interval_ms, defaults::WORKER_POLL_INTERVAL_MS);
        assert!(config.enabled);
    }

    #[test]
    fn test_worker_config_builder() {
        let config = WorkerConfig::default()
            .with_worker_count(2)
            .with_max_inflight(1)
            .with_tenant_max_inflight(3)
            .with_dependency_max_inflight(5)
            .with_poll_interval(1000)
            .with_shutdown_grace(50)
            .with_enabled(false);

        assert_eq!(config.worker_count, 2);
        assert_eq!(config.max_inflight_per_worker, 1);
        assert_eq!(config.tenant_max_inflight, 3);
        assert_eq!(config.dependency_max_inflight, 5);
        assert_eq!(config.poll_interval_ms, 1000);
        assert_eq!(config.shutdown_grace_ms, 50);
        assert_eq!(config.shutdown_grace(), Duration::from_millis(50));
        assert!(!config.enabled);
    }

    #[test]
    fn test_timeout_error_is_retryable_timeout() {
        let err = timeout_error(Duration::from_millis(1500));
        assert_eq!(err.kind, FailureKind::Timeout);
        assert!(err.kind.is_retryable());
        assert!(err.message.contains("1500ms"));
    }
}
