//! In-process [`JobStore`] for tests and single-node runs without PostgreSQL.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use uuid::Uuid;

use conduit_core::{
    DeadLetterEntry, DeadLetterFilter, Job, JobOutcome, JobStatus, JobStore, QuotaUsage, Result,
};

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<Uuid, Job>,
    results: HashMap<Uuid, (JobOutcome, DateTime<Utc>)>,
    dead_letters: HashMap<Uuid, DeadLetterEntry>,
    quota: HashMap<(String, DateTime<Utc>), u32>,
}

/// [`JobStore`] held entirely in memory. Nothing survives the process.
#[derive(Default)]
pub struct MemoryJobStore {
    state: Mutex<MemoryState>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of job records held.
    pub fn job_count(&self) -> usize {
        self.lock().jobs.len()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn save_job(&self, job: &Job) -> Result<()> {
        self.lock().jobs.insert(job.job_id, job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self.lock().jobs.get(&job_id).cloned())
    }

    async fn delete_job(&self, job_id: Uuid) -> Result<bool> {
        Ok(self.lock().jobs.remove(&job_id).is_some())
    }

    async fn find_by_idempotency_key(&self, tenant_id: &str, key: &str) -> Result<Option<Job>> {
        Ok(self
            .lock()
            .jobs
            .values()
            .filter(|j| {
                j.tenant_id == tenant_id
                    && j.idempotency_key.as_deref() == Some(key)
                    && matches!(j.status, JobStatus::Queued | JobStatus::Running)
            })
            .max_by_key(|j| j.created_at)
            .cloned())
    }

    async fn load_recoverable(&self) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .lock()
            .jobs
            .values()
            .filter(|j| matches!(j.status, JobStatus::Queued | JobStatus::Running))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.arrival_seq, j.created_at));
        Ok(jobs)
    }

    async fn save_result(
        &self,
        job_id: Uuid,
        outcome: &JobOutcome,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        self.lock()
            .results
            .entry(job_id)
            .or_insert_with(|| (outcome.clone(), expires_at));
        Ok(())
    }

    async fn get_result(&self, job_id: Uuid) -> Result<Option<JobOutcome>> {
        let now = Utc::now();
        Ok(self
            .lock()
            .results
            .get(&job_id)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(outcome, _)| outcome.clone()))
    }

    async fn save_dead_letter(&self, entry: &DeadLetterEntry) -> Result<()> {
        self.lock()
            .dead_letters
            .entry(entry.job.job_id)
            .or_insert_with(|| entry.clone());
        Ok(())
    }

    async fn remove_dead_letter(&self, job_id: Uuid) -> Result<Option<DeadLetterEntry>> {
        Ok(self.lock().dead_letters.remove(&job_id))
    }

    async fn list_dead_letters(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>> {
        let mut entries: Vec<DeadLetterEntry> = self
            .lock()
            .dead_letters
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.dead_lettered_at);
        if let Some(limit) = filter.limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    async fn save_quota_usage(&self, usage: &QuotaUsage) -> Result<()> {
        self.lock()
            .quota
            .insert((usage.tenant_id.clone(), usage.window_start), usage.daily_used);
        Ok(())
    }

    async fn load_quota_usage(&self, window_start: DateTime<Utc>) -> Result<Vec<QuotaUsage>> {
        let mut usage: Vec<QuotaUsage> = self
            .lock()
            .quota
            .iter()
            .filter(|((_, start), _)| *start == window_start)
            .map(|((tenant_id, start), used)| QuotaUsage {
                tenant_id: tenant_id.clone(),
                window_start: *start,
                daily_used: *used,
            })
            .collect();
        usage.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        Ok(usage)
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let now = Utc::now();
        let mut state = self.lock();
        let before = state.jobs.len();
        state.jobs.retain(|_, job| {
            !(job.is_terminal() && job.completed_at.is_some_and(|at| at < cutoff))
        });
        let purged = before - state.jobs.len();
        state.results.retain(|_, (_, expires_at)| *expires_at > now);
        let oldest_window = cutoff - ChronoDuration::days(1);
        state.quota.retain(|(_, start), _| *start >= oldest_window);
        Ok(purged as u64)
    }
}
