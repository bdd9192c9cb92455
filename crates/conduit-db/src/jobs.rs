//! Job store implementation.
//!
//! Each job is kept as a JSONB record next to the handful of columns the
//! orchestrator queries by (status, idempotency key, admission order).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{Pool, Postgres, Row};
use tracing::debug;
use uuid::Uuid;

use conduit_core::{
    DeadLetterEntry, DeadLetterFilter, Error, Job, JobOutcome, JobStore, QuotaUsage, Result,
};

/// Statuses whose records may be purged once their retention has passed.
const TERMINAL_STATUSES: &[&str] = &["completed", "cancelled", "timed_out", "dead_letter"];

/// PostgreSQL implementation of [`JobStore`].
#[derive(Clone)]
pub struct PgJobStore {
    pool: Pool<Postgres>,
}

impl PgJobStore {
    /// Create a new PgJobStore with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_job_row(row: &sqlx::postgres::PgRow) -> Result<Job> {
        let record: Json<Job> = row.try_get("record").map_err(Error::Database)?;
        Ok(record.0)
    }

    fn parse_dead_letter_row(row: &sqlx::postgres::PgRow) -> Result<DeadLetterEntry> {
        let entry: Json<DeadLetterEntry> = row.try_get("entry").map_err(Error::Database)?;
        Ok(entry.0)
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn save_job(&self, job: &Job) -> Result<()> {
        sqlx::query(
            "INSERT INTO conduit_jobs
                (job_id, tenant_id, idempotency_key, status, priority, arrival_seq, record, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, now())
             ON CONFLICT (job_id) DO UPDATE SET
                status = EXCLUDED.status,
                priority = EXCLUDED.priority,
                arrival_seq = EXCLUDED.arrival_seq,
                record = EXCLUDED.record,
                updated_at = now()",
        )
        .bind(job.job_id)
        .bind(&job.tenant_id)
        .bind(&job.idempotency_key)
        .bind(job.status.as_str())
        .bind(job.priority.value() as i16)
        .bind(job.arrival_seq as i64)
        .bind(Json(job))
        .bind(job.created_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT record FROM conduit_jobs WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        row.as_ref().map(Self::parse_job_row).transpose()
    }

    async fn delete_job(&self, job_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM conduit_jobs WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_by_idempotency_key(&self, tenant_id: &str, key: &str) -> Result<Option<Job>> {
        let row = sqlx::query(
            "SELECT record FROM conduit_jobs
             WHERE tenant_id = $1 AND idempotency_key = $2
               AND status IN ('queued', 'running')
             ORDER BY created_at DESC
             LIMIT 1",
        )
        .bind(tenant_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        row.as_ref().map(Self::parse_job_row).transpose()
    }

    async fn load_recoverable(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT record FROM conduit_jobs
             WHERE status IN ('queued', 'running')
             ORDER BY arrival_seq ASC, created_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        debug!(
            subsystem = "db",
            component = "jobs",
            op = "load_recoverable",
            count = rows.len(),
            "Loaded recoverable jobs"
        );
        rows.iter().map(Self::parse_job_row).collect()
    }

    async fn save_result(
        &self,
        job_id: Uuid,
        outcome: &JobOutcome,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO conduit_results (job_id, outcome, expires_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (job_id) DO NOTHING",
        )
        .bind(job_id)
        .bind(Json(outcome))
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn get_result(&self, job_id: Uuid) -> Result<Option<JobOutcome>> {
        let outcome: Option<Json<JobOutcome>> = sqlx::query_scalar(
            "SELECT outcome FROM conduit_results WHERE job_id = $1 AND expires_at > now()",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(outcome.map(|o| o.0))
    }

    async fn save_dead_letter(&self, entry: &DeadLetterEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO conduit_dead_letters
                (job_id, tenant_id, job_kind, dependency, reason, entry, dead_lettered_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (job_id) DO NOTHING",
        )
        .bind(entry.job.job_id)
        .bind(&entry.job.tenant_id)
        .bind(entry.job.job_kind.as_str())
        .bind(&entry.job.target_dependency)
        .bind(entry.reason.as_str())
        .bind(Json(entry))
        .bind(entry.dead_lettered_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn remove_dead_letter(&self, job_id: Uuid) -> Result<Option<DeadLetterEntry>> {
        let row = sqlx::query("DELETE FROM conduit_dead_letters WHERE job_id = $1 RETURNING entry")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        row.as_ref().map(Self::parse_dead_letter_row).transpose()
    }

    async fn list_dead_letters(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>> {
        let rows = sqlx::query(
            "SELECT entry FROM conduit_dead_letters
             WHERE ($1::text IS NULL OR tenant_id = $1)
               AND ($2::text IS NULL OR job_kind = $2)
               AND ($3::text IS NULL OR dependency = $3)
               AND ($4::text IS NULL OR reason = $4)
             ORDER BY dead_lettered_at ASC
             LIMIT $5",
        )
        .bind(&filter.tenant_id)
        .bind(filter.job_kind.map(|k| k.as_str()))
        .bind(&filter.dependency)
        .bind(filter.reason.map(|r| r.as_str()))
        .bind(filter.limit.map(|l| l as i64))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        rows.iter().map(Self::parse_dead_letter_row).collect()
    }

    async fn save_quota_usage(&self, usage: &QuotaUsage) -> Result<()> {
        sqlx::query(
            "INSERT INTO conduit_quota_counters (tenant_id, window_start, daily_used)
             VALUES ($1, $2, $3)
             ON CONFLICT (tenant_id, window_start) DO UPDATE SET daily_used = EXCLUDED.daily_used",
        )
        .bind(&usage.tenant_id)
        .bind(usage.window_start)
        .bind(usage.daily_used as i32)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn load_quota_usage(&self, window_start: DateTime<Utc>) -> Result<Vec<QuotaUsage>> {
        let rows = sqlx::query(
            "SELECT tenant_id, window_start, daily_used FROM conduit_quota_counters
             WHERE window_start = $1",
        )
        .bind(window_start)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter()
            .map(|row| {
                let daily_used: i32 = row.try_get("daily_used").map_err(Error::Database)?;
                Ok(QuotaUsage {
                    tenant_id: row.try_get("tenant_id").map_err(Error::Database)?,
                    window_start: row.try_get("window_start").map_err(Error::Database)?,
                    daily_used: daily_used.max(0) as u32,
                })
            })
            .collect()
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let statuses: Vec<String> = TERMINAL_STATUSES.iter().map(|s| s.to_string()).collect();
        let jobs = sqlx::query(
            "DELETE FROM conduit_jobs WHERE status = ANY($1) AND updated_at < $2",
        )
        .bind(&statuses)
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?
        .rows_affected();

        sqlx::query("DELETE FROM conduit_results WHERE expires_at <= now()")
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;

        sqlx::query(
            "DELETE FROM conduit_quota_counters WHERE window_start < $1 - INTERVAL '1 day'",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if jobs > 0 {
            debug!(
                subsystem = "db",
                component = "jobs",
                op = "purge",
                purged = jobs,
                "Purged expired job records"
            );
        }
        Ok(jobs)
    }
}
