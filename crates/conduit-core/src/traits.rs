//! Core traits for conduit abstractions.
//!
//! The orchestrator keeps its working state in memory and writes through a
//! [`JobStore`] so that queued work, dead letters, results and daily quota
//! counters survive a restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// DEAD LETTER FILTER
// =============================================================================

/// Filter for listing dead letters. Unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeadLetterFilter {
    pub tenant_id: Option<String>,
    pub job_kind: Option<JobKind>,
    pub dependency: Option<String>,
    pub reason: Option<DeadLetterReason>,
    /// Maximum entries returned, oldest first.
    pub limit: Option<usize>,
}

impl DeadLetterFilter {
    pub fn for_tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: Some(tenant_id.into()),
            ..Default::default()
        }
    }

    pub fn with_kind(mut self, kind: JobKind) -> Self {
        self.job_kind = Some(kind);
        self
    }

    pub fn with_dependency(mut self, dependency: impl Into<String>) -> Self {
        self.dependency = Some(dependency.into());
        self
    }

    pub fn with_reason(mut self, reason: DeadLetterReason) -> Self {
        self.reason = Some(reason);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `entry` passes every set criterion.
    pub fn matches(&self, entry: &DeadLetterEntry) -> bool {
        self.tenant_id
            .as_deref()
            .map_or(true, |t| entry.job.tenant_id == t)
            && self.job_kind.map_or(true, |k| entry.job.job_kind == k)
            && self
                .dependency
                .as_deref()
                .map_or(true, |d| entry.job.target_dependency == d)
            && self.reason.map_or(true, |r| entry.reason == r)
    }
}

// =============================================================================
// JOB STORE
// =============================================================================

/// Durable persistence for jobs, results, dead letters and quota counters.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert or replace a job record.
    async fn save_job(&self, job: &Job) -> Result<()>;

    /// Get job by ID.
    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>>;

    /// Delete a job record. Returns whether one existed.
    async fn delete_job(&self, job_id: Uuid) -> Result<bool>;

    /// Newest `QUEUED` or `RUNNING` job admitted under `(tenant_id, idempotency_key)`.
    async fn find_by_idempotency_key(&self, tenant_id: &str, key: &str) -> Result<Option<Job>>;

    /// Jobs that were `QUEUED` or `RUNNING` when the process stopped.
    async fn load_recoverable(&self) -> Result<Vec<Job>>;

    /// Record a terminal outcome, retained until `expires_at`.
    async fn save_result(
        &self,
        job_id: Uuid,
        outcome: &JobOutcome,
        expires_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Get an unexpired terminal outcome.
    async fn get_result(&self, job_id: Uuid) -> Result<Option<JobOutcome>>;

    /// Insert a dead letter. A second insert for the same job is a no-op.
    async fn save_dead_letter(&self, entry: &DeadLetterEntry) -> Result<()>;

    /// Remove a dead letter, returning it if present.
    async fn remove_dead_letter(&self, job_id: Uuid) -> Result<Option<DeadLetterEntry>>;

    /// List dead letters matching `filter`, oldest first.
    async fn list_dead_letters(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>>;

    /// Upsert a tenant's daily counter.
    async fn save_quota_usage(&self, usage: &QuotaUsage) -> Result<()>;

    /// All counters for the daily window opening at `window_start`.
    async fn load_quota_usage(&self, window_start: DateTime<Utc>) -> Result<Vec<QuotaUsage>>;

    /// Delete terminal jobs and expired results older than `cutoff`.
    /// Returns the number of job records removed.
    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}
