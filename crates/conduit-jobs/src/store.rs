//! Result and dead-letter stores.
//!
//! Both are the in-process side of terminal state: the worker pool writes
//! here first and then through to the [`conduit_core::JobStore`].

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use conduit_core::{DeadLetterEntry, DeadLetterFilter, JobOutcome};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// RESULT STORE
// =============================================================================

struct StoredResult {
    outcome: JobOutcome,
    expires_at: Instant,
}

/// Terminal outcomes for polling clients, kept for a fixed TTL.
pub struct ResultStore {
    ttl: Duration,
    entries: Mutex<HashMap<Uuid, StoredResult>>,
}

impl ResultStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Record the outcome for `job_id`. The first write wins; returns whether
    /// this call stored it.
    pub fn put(&self, job_id: Uuid, outcome: JobOutcome) -> bool {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        if entries.get(&job_id).is_some_and(|e| e.expires_at > now) {
            return false;
        }
        entries.insert(
            job_id,
            StoredResult {
                outcome,
                expires_at: now + self.ttl,
            },
        );
        true
    }

    pub fn get(&self, job_id: Uuid) -> Option<JobOutcome> {
        let now = Instant::now();
        lock(&self.entries)
            .get(&job_id)
            .filter(|e| e.expires_at > now)
            .map(|e| e.outcome.clone())
    }

    /// Drop expired outcomes; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// DEAD LETTER STORE
// =============================================================================

/// Jobs that failed permanently, held for inspection and manual requeue.
#[derive(Default)]
pub struct DeadLetterStore {
    entries: Mutex<HashMap<Uuid, DeadLetterEntry>>,
}

impl DeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry. Returns false if the job is already dead-lettered.
    pub fn put(&self, entry: DeadLetterEntry) -> bool {
        let mut entries = lock(&self.entries);
        if entries.contains_key(&entry.job.job_id) {
            return false;
        }
        entries.insert(entry.job.job_id, entry);
        true
    }

    pub fn get(&self, job_id: Uuid) -> Option<DeadLetterEntry> {
        lock(&self.entries).get(&job_id).cloned()
    }

    /// Remove and return an entry, for requeue.
    pub fn take(&self, job_id: Uuid) -> Option<DeadLetterEntry> {
        lock(&self.entries).remove(&job_id)
    }

    /// Matching entries, oldest first.
    pub fn list(&self, filter: &DeadLetterFilter) -> Vec<DeadLetterEntry> {
        let mut matched: Vec<DeadLetterEntry> = lock(&self.entries)
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            a.dead_lettered_at
                .cmp(&b.dead_lettered_at)
                .then(a.job.job_id.cmp(&b.job.job_id))
        });
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        matched
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
