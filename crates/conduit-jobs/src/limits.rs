//! Per-tenant and per-dependency in-flight caps.
//!
//! Tenant slots are reserved while a job is being claimed from the queue, so
//! a tenant at its cap never takes a worker slot. Dependency slots are
//! semaphores acquired just before the outbound call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

use conduit_core::{Error, Result};

struct LimitsInner {
    dependency_cap: usize,
    tenant_cap: usize,
    dependencies: Mutex<HashMap<String, Arc<Semaphore>>>,
    tenants: Mutex<HashMap<String, usize>>,
    released: Arc<Notify>,
}

/// Shared in-flight accounting.
#[derive(Clone)]
pub struct ConcurrencyLimits {
    inner: Arc<LimitsInner>,
}

/// Holds one tenant slot until dropped.
pub struct TenantPermit {
    limits: Arc<LimitsInner>,
    tenant_id: String,
}

impl std::fmt::Debug for TenantPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantPermit")
            .field("tenant_id", &self.tenant_id)
            .finish()
    }
}

impl Drop for TenantPermit {
    fn drop(&mut self) {
        let mut tenants = lock(&self.limits.tenants);
        if let Some(count) = tenants.get_mut(&self.tenant_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                tenants.remove(&self.tenant_id);
            }
        }
        drop(tenants);
        // A worker may be skipping this tenant's queued jobs.
        self.limits.released.notify_waiters();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConcurrencyLimits {
    /// `released` is notified whenever a tenant slot frees up.
    pub fn new(dependency_cap: usize, tenant_cap: usize, released: Arc<Notify>) -> Self {
        Self {
            inner: Arc::new(LimitsInner {
                dependency_cap: dependency_cap.max(1),
                tenant_cap: tenant_cap.max(1),
                dependencies: Mutex::new(HashMap::new()),
                tenants: Mutex::new(HashMap::new()),
                released,
            }),
        }
    }

    pub fn tenant_cap(&self) -> usize {
        self.inner.tenant_cap
    }

    pub fn dependency_cap(&self) -> usize {
        self.inner.dependency_cap
    }

    /// Reserve a tenant slot, or `None` if the tenant is at its cap.
    pub fn try_reserve_tenant(&self, tenant_id: &str) -> Option<TenantPermit> {
        let mut tenants = lock(&self.inner.tenants);
        let count = tenants.entry(tenant_id.to_string()).or_insert(0);
        if *count >= self.inner.tenant_cap {
            return None;
        }
        *count += 1;
        Some(TenantPermit {
            limits: self.inner.clone(),
            tenant_id: tenant_id.to_string(),
        })
    }

    fn semaphore(&self, dependency: &str) -> Arc<Semaphore> {
        lock(&self.inner.dependencies)
            .entry(dependency.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.inner.dependency_cap)))
            .clone()
    }

    /// Wait for a slot on `dependency`.
    pub async fn acquire_dependency(&self, dependency: &str) -> Result<OwnedSemaphorePermit> {
        self.semaphore(dependency)
            .acquire_owned()
            .await
            .map_err(|_| Error::ShuttingDown)
    }

    pub fn tenant_inflight(&self, tenant_id: &str) -> usize {
        lock(&self.inner.tenants).get(tenant_id).copied().unwrap_or(0)
    }

    pub fn dependency_inflight(&self, dependency: &str) -> usize {
        lock(&self.inner.dependencies)
            .get(dependency)
            .map(|s| self.inner.dependency_cap - s.available_permits())
            .unwrap_or(0)
    }
}
