//! Live job records.
//!
//! The registry holds the authoritative in-process copy of every job that is
//! not yet purged, the idempotency index for non-terminal jobs, and the
//! per-job cancellation signal. Every mutation goes through a single lock so
//! state changes are atomic with respect to each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use uuid::Uuid;

use conduit_core::{Job, JobHandle, JobStatus};

struct Record {
    job: Job,
    cancel: Arc<Notify>,
    cancel_requested: bool,
}

#[derive(Default)]
struct RegistryInner {
    jobs: HashMap<Uuid, Record>,
    idempotency: HashMap<(String, String), Uuid>,
}

impl RegistryInner {
    fn active_by_key(&self, tenant_id: &str, key: &str) -> Option<&Job> {
        self.idempotency
            .get(&(tenant_id.to_string(), key.to_string()))
            .and_then(|id| self.jobs.get(id))
            .map(|r| &r.job)
            .filter(|job| !job.is_terminal())
    }

    fn unindex(&mut self, job: &Job) {
        if let Some(key) = &job.idempotency_key {
            let index_key = (job.tenant_id.clone(), key.clone());
            if self.idempotency.get(&index_key) == Some(&job.job_id) {
                self.idempotency.remove(&index_key);
            }
        }
    }
}

/// Result of [`JobRegistry::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert {
    Inserted,
    /// A non-terminal job already holds the idempotency key.
    Existing(JobHandle),
}

/// Result of [`JobRegistry::claim`].
#[derive(Debug, Clone)]
pub enum Claim {
    /// The job is now `RUNNING` for a new attempt.
    Started(Job),
    /// Cancellation arrived while the job waited; it is now `CANCELLED`.
    Cancelled(Job),
    /// The job's total budget ran out; it is now `TIMED_OUT`.
    TimedOut(Job),
    /// The job is no longer claimable (removed, terminal, or not queued).
    Gone,
}

/// Registry of live jobs.
#[derive(Default)]
pub struct JobRegistry {
    inner: Mutex<RegistryInner>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handle of the non-terminal job holding `(tenant_id, key)`.
    pub fn find_active(&self, tenant_id: &str, key: &str) -> Option<JobHandle> {
        self.lock().active_by_key(tenant_id, key).map(Job::handle)
    }

    /// Insert a job, unless a non-terminal job already holds its idempotency key.
    pub fn insert(&self, job: Job) -> Insert {
        let mut inner = self.lock();
        if let Some(key) = &job.idempotency_key {
            if let Some(existing) = inner.active_by_key(&job.tenant_id, key) {
                return Insert::Existing(existing.handle());
            }
            inner
                .idempotency
                .insert((job.tenant_id.clone(), key.clone()), job.job_id);
        }
        inner.jobs.insert(
            job.job_id,
            Record {
                job,
                cancel: Arc::new(Notify::new()),
                cancel_requested: false,
            },
        );
        Insert::Inserted
    }

    pub fn get(&self, job_id: Uuid) -> Option<Job> {
        self.lock().jobs.get(&job_id).map(|r| r.job.clone())
    }

    pub fn status(&self, job_id: Uuid) -> Option<JobStatus> {
        self.lock().jobs.get(&job_id).map(|r| r.job.status)
    }

    pub fn contains(&self, job_id: Uuid) -> bool {
        self.lock().jobs.contains_key(&job_id)
    }

    /// Apply `f` to the job under the registry lock.
    pub fn update<R>(&self, job_id: Uuid, f: impl FnOnce(&mut Job) -> R) -> Option<R> {
        self.lock().jobs.get_mut(&job_id).map(|r| f(&mut r.job))
    }

    /// Claim a dequeued job for its next attempt.
    pub fn claim(&self, job_id: Uuid) -> Claim {
        let mut inner = self.lock();
        let Some(record) = inner.jobs.get_mut(&job_id) else {
            return Claim::Gone;
        };
        let job = &mut record.job;
        if job.status != JobStatus::Queued {
            return Claim::Gone;
        }
        if record.cancel_requested {
            return match job.transition(JobStatus::Cancelled) {
                Ok(()) => Claim::Cancelled(job.clone()),
                Err(_) => Claim::Gone,
            };
        }
        if job.budget_exhausted() {
            return match job.transition(JobStatus::TimedOut) {
                Ok(()) => Claim::TimedOut(job.clone()),
                Err(_) => Claim::Gone,
            };
        }
        match job.begin_attempt() {
            Ok(_) => Claim::Started(job.clone()),
            Err(_) => Claim::Gone,
        }
    }

    /// Signal cancellation to whoever holds the job. Returns false for
    /// unknown or terminal jobs.
    pub fn request_cancel(&self, job_id: Uuid) -> bool {
        let mut inner = self.lock();
        let Some(record) = inner.jobs.get_mut(&job_id) else {
            return false;
        };
        if record.job.is_terminal() {
            return false;
        }
        record.cancel_requested = true;
        // Stores a permit if nobody is waiting yet.
        record.cancel.notify_one();
        true
    }

    pub fn is_cancel_requested(&self, job_id: Uuid) -> bool {
        self.lock()
            .jobs
            .get(&job_id)
            .is_some_and(|r| r.cancel_requested)
    }

    /// Signal completed when cancellation is requested for `job_id`.
    pub fn cancel_signal(&self, job_id: Uuid) -> Option<Arc<Notify>> {
        self.lock().jobs.get(&job_id).map(|r| r.cancel.clone())
    }

    pub fn remove(&self, job_id: Uuid) -> Option<Job> {
        let mut inner = self.lock();
        let record = inner.jobs.remove(&job_id)?;
        inner.unindex(&record.job);
        Some(record.job)
    }

    /// Drop terminal jobs that completed before `cutoff`.
    pub fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut inner = self.lock();
        let expired: Vec<Uuid> = inner
            .jobs
            .values()
            .filter(|r| r.job.is_terminal() && r.job.completed_at.is_some_and(|at| at < cutoff))
            .map(|r| r.job.job_id)
            .collect();
        for id in &expired {
            if let Some(record) = inner.jobs.remove(id) {
                inner.unindex(&record.job);
            }
        }
        expired.len()
    }

    pub fn with_status(&self, status: JobStatus) -> Vec<Job> {
        self.lock()
            .jobs
            .values()
            .filter(|r| r.job.status == status)
            .map(|r| r.job.clone())
            .collect()
    }

    /// Put every `RUNNING` job back to `QUEUED`, returning the attempt it was
    /// on. Used after in-flight attempts were abandoned.
    pub fn requeue_running(&self) -> Vec<Job> {
        let mut inner = self.lock();
        let mut requeued = Vec::new();
        for record in inner.jobs.values_mut() {
            let job = &mut record.job;
            if job.status == JobStatus::Running && job.transition(JobStatus::Queued).is_ok() {
                job.attempt_count = job.attempt_count.saturating_sub(1);
                requeued.push(job.clone());
            }
        }
        requeued
    }

    /// Job count per status.
    pub fn counts(&self) -> HashMap<JobStatus, usize> {
        let mut counts = HashMap::new();
        for record in self.lock().jobs.values() {
            *counts.entry(record.job.status).or_insert(0) += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
