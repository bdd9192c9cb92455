//! Per-tenant admission quotas.
//!
//! Each tenant has a daily budget, reset at UTC midnight, and a sliding
//! one-minute rate window. Both checks and both increments happen under one
//! lock, so two concurrent admissions for the same tenant can never both
//! pass a boundary that only one of them should.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, trace};

use conduit_core::defaults;
use conduit_core::{Error, JobKind, QuotaRejectReason, QuotaRejection, QuotaUsage, Result};

/// Named quota tier with preset limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaTier {
    Free,
    Basic,
    Pro,
    Enterprise,
}

impl QuotaTier {
    /// Limits for the tier, overridable with `QUOTA_<TIER>_DAILY` / `QUOTA_<TIER>_RATE`.
    pub fn limits(&self) -> TenantLimits {
        let (prefix, daily, rate) = match self {
            QuotaTier::Free => ("FREE", 100, 10),
            QuotaTier::Basic => ("BASIC", 1_000, 60),
            QuotaTier::Pro => ("PRO", 10_000, 300),
            QuotaTier::Enterprise => ("ENTERPRISE", 100_000, 1_000),
        };
        let env_u32 = |key: String| std::env::var(key).ok().and_then(|v| v.parse::<u32>().ok());
        TenantLimits {
            daily_limit: env_u32(format!("QUOTA_{}_DAILY", prefix)).unwrap_or(daily),
            rate_per_minute: env_u32(format!("QUOTA_{}_RATE", prefix)).unwrap_or(rate),
        }
    }
}

impl fmt::Display for QuotaTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QuotaTier::Free => "free",
            QuotaTier::Basic => "basic",
            QuotaTier::Pro => "pro",
            QuotaTier::Enterprise => "enterprise",
        };
        f.write_str(name)
    }
}

impl FromStr for QuotaTier {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "basic" => Ok(Self::Basic),
            "pro" => Ok(Self::Pro),
            "enterprise" => Ok(Self::Enterprise),
            _ => Err(Error::InvalidInput(format!("Unknown quota tier: {}", s))),
        }
    }
}

/// Daily and per-minute admission limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TenantLimits {
    pub daily_limit: u32,
    pub rate_per_minute: u32,
}

/// Defaults for tenants without an explicit tier or limits.
#[derive(Debug, Clone)]
pub struct QuotaConfig {
    pub default_limits: TenantLimits,
    /// Length of the sliding rate window.
    pub rate_window: Duration,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_limits: TenantLimits {
                daily_limit: defaults::QUOTA_DEFAULT_DAILY,
                rate_per_minute: defaults::QUOTA_DEFAULT_RATE_PER_MINUTE,
            },
            rate_window: Duration::from_secs(defaults::QUOTA_RATE_WINDOW_SECS as u64),
        }
    }
}

impl QuotaConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `QUOTA_DEFAULT_DAILY` | `1000` | Admissions per UTC day |
    /// | `QUOTA_DEFAULT_RATE_PER_MINUTE` | `60` | Admissions per sliding minute |
    pub fn from_env() -> Self {
        let env_u32 = |key: &str| std::env::var(key).ok().and_then(|v| v.parse::<u32>().ok());
        Self {
            default_limits: TenantLimits {
                daily_limit: env_u32("QUOTA_DEFAULT_DAILY")
                    .unwrap_or(defaults::QUOTA_DEFAULT_DAILY),
                rate_per_minute: env_u32("QUOTA_DEFAULT_RATE_PER_MINUTE")
                    .unwrap_or(defaults::QUOTA_DEFAULT_RATE_PER_MINUTE),
            },
            ..Default::default()
        }
    }

    pub fn with_default_limits(mut self, daily_limit: u32, rate_per_minute: u32) -> Self {
        self.default_limits = TenantLimits {
            daily_limit,
            rate_per_minute,
        };
        self
    }
}

/// Receipt for an admission, used to refund it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub tenant_id: String,
    pub admitted_at: DateTime<Utc>,
    window_start: DateTime<Utc>,
}

/// Quota state of one tenant, for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaSnapshot {
    pub tenant_id: String,
    pub tier: Option<QuotaTier>,
    pub daily_limit: u32,
    pub daily_used: u32,
    pub daily_remaining: u32,
    pub rate_per_minute: u32,
    pub current_rate: u32,
    pub window_reset_at: DateTime<Utc>,
}

#[derive(Debug)]
struct TenantQuota {
    tier: Option<QuotaTier>,
    limits: TenantLimits,
    daily_used: u32,
    window_start: DateTime<Utc>,
    recent: VecDeque<DateTime<Utc>>,
    last_admitted: DateTime<Utc>,
}

impl TenantQuota {
    fn new(limits: TenantLimits, now: DateTime<Utc>) -> Self {
        Self {
            tier: None,
            limits,
            daily_used: 0,
            window_start: day_start(now),
            recent: VecDeque::new(),
            last_admitted: now,
        }
    }

    /// Roll the daily window forward and drop expired rate entries.
    fn refresh(&mut self, now: DateTime<Utc>, rate_window: ChronoDuration) {
        let today = day_start(now);
        if self.window_start < today {
            self.window_start = today;
            self.daily_used = 0;
        }
        let cutoff = now - rate_window;
        while self.recent.front().is_some_and(|t| *t <= cutoff) {
            self.recent.pop_front();
        }
    }

    fn window_reset_at(&self) -> DateTime<Utc> {
        self.window_start + ChronoDuration::days(1)
    }
}

fn day_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}

fn to_std(d: ChronoDuration) -> Duration {
    d.to_std().unwrap_or(Duration::ZERO)
}

/// Admits or rejects work per tenant.
#[derive(Clone)]
pub struct QuotaManager {
    config: QuotaConfig,
    tenants: Arc<Mutex<HashMap<String, TenantQuota>>>,
}

impl QuotaManager {
    pub fn new(config: QuotaConfig) -> Self {
        Self {
            config,
            tenants: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn rate_window(&self) -> ChronoDuration {
        ChronoDuration::from_std(self.config.rate_window).unwrap_or(ChronoDuration::seconds(60))
    }

    /// Admit one job for `tenant_id` now.
    pub async fn admit(
        &self,
        tenant_id: &str,
        job_kind: JobKind,
    ) -> std::result::Result<Admission, QuotaRejection> {
        self.admit_at(tenant_id, job_kind, Utc::now()).await
    }

    /// Admit one job for `tenant_id` as of `now`.
    ///
    /// Checks the daily budget, then the rate window. Counters change only
    /// when both pass.
    pub async fn admit_at(
        &self,
        tenant_id: &str,
        job_kind: JobKind,
        now: DateTime<Utc>,
    ) -> std::result::Result<Admission, QuotaRejection> {
        let rate_window = self.rate_window();
        let mut tenants = self.tenants.lock().await;
        let quota = tenants
            .entry(tenant_id.to_string())
            .or_insert_with(|| TenantQuota::new(self.config.default_limits, now));
        quota.refresh(now, rate_window);

        if quota.daily_used >= quota.limits.daily_limit {
            let rejection = QuotaRejection {
                reason: QuotaRejectReason::DailyQuotaExceeded,
                retry_after: Some(to_std(quota.window_reset_at() - now)),
            };
            debug!(
                subsystem = "jobs",
                component = "quota",
                op = "admit",
                tenant_id,
                %job_kind,
                daily_used = quota.daily_used,
                daily_limit = quota.limits.daily_limit,
                "Daily quota exceeded"
            );
            return Err(rejection);
        }

        if quota.recent.len() as u32 >= quota.limits.rate_per_minute {
            let retry_after = quota
                .recent
                .front()
                .map(|oldest| to_std(*oldest + rate_window - now))
                .unwrap_or(self.config.rate_window);
            debug!(
                subsystem = "jobs",
                component = "quota",
                op = "admit",
                tenant_id,
                %job_kind,
                rate_per_minute = quota.limits.rate_per_minute,
                retry_after_ms = retry_after.as_millis() as u64,
                "Rate limit exceeded"
            );
            return Err(QuotaRejection {
                reason: QuotaRejectReason::RateLimitExceeded,
                retry_after: Some(retry_after),
            });
        }

        quota.daily_used += 1;
        quota.recent.push_back(now);
        quota.last_admitted = now;
        trace!(
            subsystem = "jobs",
            component = "quota",
            tenant_id,
            daily_used = quota.daily_used,
            current_rate = quota.recent.len(),
            "Admission counted"
        );
        Ok(Admission {
            tenant_id: tenant_id.to_string(),
            admitted_at: now,
            window_start: quota.window_start,
        })
    }

    /// Undo an admission whose job was never enqueued.
    pub async fn refund(&self, admission: &Admission) {
        let mut tenants = self.tenants.lock().await;
        if let Some(quota) = tenants.get_mut(&admission.tenant_id) {
            if quota.window_start == admission.window_start {
                quota.daily_used = quota.daily_used.saturating_sub(1);
            }
            if let Some(pos) = quota
                .recent
                .iter()
                .rposition(|t| *t == admission.admitted_at)
            {
                quota.recent.remove(pos);
            }
        }
    }

    /// Apply a named tier's limits to a tenant. Usage is kept.
    pub async fn set_tier(&self, tenant_id: &str, tier: QuotaTier) {
        let limits = tier.limits();
        let mut tenants = self.tenants.lock().await;
        let quota = tenants
            .entry(tenant_id.to_string())
            .or_insert_with(|| TenantQuota::new(limits, Utc::now()));
        quota.tier = Some(tier);
        quota.limits = limits;
        info!(
            subsystem = "jobs",
            component = "quota",
            op = "set_tier",
            tenant_id,
            tier = %tier,
            daily_limit = limits.daily_limit,
            rate_per_minute = limits.rate_per_minute,
            "Tenant quota tier updated"
        );
    }

    /// Set explicit limits for a tenant. Usage is kept.
    pub async fn set_limits(&self, tenant_id: &str, limits: TenantLimits) {
        let mut tenants = self.tenants.lock().await;
        let quota = tenants
            .entry(tenant_id.to_string())
            .or_insert_with(|| TenantQuota::new(limits, Utc::now()));
        quota.tier = None;
        quota.limits = limits;
        info!(
            subsystem = "jobs",
            component = "quota",
            op = "set_limits",
            tenant_id,
            daily_limit = limits.daily_limit,
            rate_per_minute = limits.rate_per_minute,
            "Tenant quota limits updated"
        );
    }

    /// Clear a tenant's daily and rate counters.
    pub async fn reset(&self, tenant_id: &str) {
        let mut tenants = self.tenants.lock().await;
        if let Some(quota) = tenants.get_mut(tenant_id) {
            quota.daily_used = 0;
            quota.recent.clear();
        }
        info!(
            subsystem = "jobs",
            component = "quota",
            op = "reset",
            tenant_id,
            "Tenant quota counters reset"
        );
    }

    pub async fn snapshot(&self, tenant_id: &str) -> QuotaSnapshot {
        let now = Utc::now();
        let rate_window = self.rate_window();
        let mut tenants = self.tenants.lock().await;
        match tenants.get_mut(tenant_id) {
            Some(quota) => {
                quota.refresh(now, rate_window);
                describe(tenant_id, quota)
            }
            None => describe(
                tenant_id,
                &TenantQuota::new(self.config.default_limits, now),
            ),
        }
    }

    /// Snapshots of every known tenant, sorted by tenant id.
    pub async fn snapshots(&self) -> Vec<QuotaSnapshot> {
        let now = Utc::now();
        let rate_window = self.rate_window();
        let mut tenants = self.tenants.lock().await;
        let mut all: Vec<_> = tenants
            .iter_mut()
            .map(|(id, quota)| {
                quota.refresh(now, rate_window);
                describe(id, quota)
            })
            .collect();
        all.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        all
    }

    /// Daily counters of the current window, for persistence.
    pub async fn usage(&self) -> Vec<QuotaUsage> {
        let today = day_start(Utc::now());
        let tenants = self.tenants.lock().await;
        tenants
            .iter()
            .filter(|(_, q)| q.window_start == today && q.daily_used > 0)
            .map(|(id, q)| QuotaUsage {
                tenant_id: id.clone(),
                window_start: q.window_start,
                daily_used: q.daily_used,
            })
            .collect()
    }

    /// Seed daily counters from persisted usage. Stale windows are ignored.
    pub async fn restore_usage(&self, usage: Vec<QuotaUsage>) {
        let now = Utc::now();
        let today = day_start(now);
        let mut tenants = self.tenants.lock().await;
        for row in usage.into_iter().filter(|u| u.window_start == today) {
            let quota = tenants
                .entry(row.tenant_id)
                .or_insert_with(|| TenantQuota::new(self.config.default_limits, now));
            quota.daily_used = quota.daily_used.max(row.daily_used);
        }
    }

    /// Forget tenants with no admission for a full day and no admin override.
    pub async fn evict_idle(&self) -> usize {
        self.evict_idle_at(Utc::now()).await
    }

    /// [`evict_idle`](Self::evict_idle) as of `now`. Returns how many were dropped.
    pub async fn evict_idle_at(&self, now: DateTime<Utc>) -> usize {
        let idle_after = ChronoDuration::days(1);
        let default_limits = self.config.default_limits;
        let mut tenants = self.tenants.lock().await;
        let before = tenants.len();
        tenants.retain(|_, q| {
            q.tier.is_some() || q.limits != default_limits || now - q.last_admitted < idle_after
        });
        let evicted = before - tenants.len();
        if evicted > 0 {
            debug!(
                subsystem = "jobs",
                component = "quota",
                op = "evict_idle",
                evicted,
                remaining = tenants.len(),
                "Evicted idle tenants"
            );
        }
        evicted
    }

    /// Start of the daily window containing `now`.
    pub fn window_start(now: DateTime<Utc>) -> DateTime<Utc> {
        day_start(now)
    }
}

fn describe(tenant_id: &str, quota: &TenantQuota) -> QuotaSnapshot {
    QuotaSnapshot {
        tenant_id: tenant_id.to_string(),
        tier: quota.tier,
        daily_limit: quota.limits.daily_limit,
        daily_used: quota.daily_used,
        daily_remaining: quota.limits.daily_limit.saturating_sub(quota.daily_used),
        rate_per_minute: quota.limits.rate_per_minute,
        current_rate: quota.recent.len() as u32,
        window_reset_at: quota.window_reset_at(),
    }
}
