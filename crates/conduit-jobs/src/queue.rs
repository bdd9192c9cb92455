//! In-memory priority queue with deferred visibility.
//!
//! Ready entries are ordered by priority, then by arrival sequence. Retries
//! re-enter with their original arrival sequence and priority, but stay in
//! the deferred set until their delay has elapsed. Deferred entries are
//! promoted lazily on every read, so "not yet visible" is purely a matter of
//! ordering and never needs a background task.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

use conduit_core::defaults;
use conduit_core::{Error, Job, JobKind, Priority, Result};

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum entries (ready plus deferred) before admissions are refused.
    pub max_size: usize,
    /// When set, a ready entry climbs one priority level per interval waited.
    pub aging_interval: Option<Duration>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: defaults::QUEUE_MAX_SIZE,
            aging_interval: None,
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `QUEUE_MAX_SIZE` | `10000` | Capacity before `QUEUE_SATURATED` |
    /// | `QUEUE_AGING_INTERVAL_MS` | unset | Priority aging interval; unset or `0` disables aging |
    pub fn from_env() -> Self {
        Self {
            max_size: std::env::var("QUEUE_MAX_SIZE")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(defaults::QUEUE_MAX_SIZE)
                .max(1),
            aging_interval: std::env::var("QUEUE_AGING_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
        }
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_aging_interval(mut self, interval: Duration) -> Self {
        self.aging_interval = Some(interval);
        self
    }
}

/// What the queue knows about a job: enough to order, route and cap it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub job_id: Uuid,
    pub tenant_id: String,
    pub job_kind: JobKind,
    pub target_dependency: String,
    pub priority: Priority,
    pub arrival_seq: u64,
}

impl QueueEntry {
    pub fn for_job(job: &Job) -> Self {
        Self {
            job_id: job.job_id,
            tenant_id: job.tenant_id.clone(),
            job_kind: job.job_kind,
            target_dependency: job.target_dependency.clone(),
            priority: job.priority,
            arrival_seq: job.arrival_seq,
        }
    }
}

type SeqKey = (u64, Uuid);

#[derive(Debug)]
struct Slot {
    entry: QueueEntry,
    ready_since: Instant,
}

#[derive(Debug, Clone, Copy)]
enum Location {
    Ready { level: usize, key: SeqKey },
    Deferred { visible_at: Instant, key: SeqKey },
}

#[derive(Debug, Default)]
struct QueueInner {
    /// Ready entries per level, LOW=0 .. HIGH=2.
    ready: [BTreeMap<SeqKey, Slot>; 3],
    /// Aging index per level: (ready_since, key).
    waiting_since: [BTreeSet<(Instant, SeqKey)>; 3],
    deferred: BTreeMap<(Instant, SeqKey), QueueEntry>,
    index: HashMap<Uuid, Location>,
}

fn level_of(priority: Priority) -> usize {
    usize::from(priority.value().saturating_sub(1)).min(2)
}

impl QueueInner {
    fn len(&self) -> usize {
        self.index.len()
    }

    fn ready_len(&self) -> usize {
        self.ready.iter().map(BTreeMap::len).sum()
    }

    fn insert_ready(&mut self, entry: QueueEntry, level: usize, ready_since: Instant) {
        let key = (entry.arrival_seq, entry.job_id);
        self.index.insert(entry.job_id, Location::Ready { level, key });
        self.waiting_since[level].insert((ready_since, key));
        self.ready[level].insert(key, Slot { entry, ready_since });
    }

    fn take_ready(&mut self, level: usize, key: SeqKey) -> Option<QueueEntry> {
        let slot = self.ready[level].remove(&key)?;
        self.waiting_since[level].remove(&(slot.ready_since, key));
        self.index.remove(&slot.entry.job_id);
        Some(slot.entry)
    }

    /// Move due deferred entries to ready, then apply aging.
    fn promote(&mut self, now: Instant, aging_interval: Option<Duration>) {
        while let Some(first) = self.deferred.first_key_value().map(|(k, _)| *k) {
            if first.0 > now {
                break;
            }
            if let Some(entry) = self.deferred.remove(&first) {
                let level = level_of(entry.priority);
                self.insert_ready(entry, level, now);
            }
        }

        let Some(interval) = aging_interval else {
            return;
        };
        // LOW first, so an entry climbs at most one level per pass.
        for level in [1usize, 0] {
            while let Some(&(since, key)) = self.waiting_since[level].first() {
                if since + interval > now {
                    break;
                }
                self.waiting_since[level].remove(&(since, key));
                if let Some(slot) = self.ready[level].remove(&key) {
                    trace!(
                        subsystem = "jobs",
                        component = "queue",
                        job_id = %slot.entry.job_id,
                        from_level = level,
                        "Aged queue entry up one priority level"
                    );
                    self.insert_ready(slot.entry, level + 1, since + interval);
                }
            }
        }
    }
}

/// Priority queue of admitted jobs.
pub struct PriorityQueue {
    config: QueueConfig,
    inner: Mutex<QueueInner>,
    next_seq: AtomicU64,
    notify: Arc<Notify>,
}

impl PriorityQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(QueueInner::default()),
            next_seq: AtomicU64::new(1),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate the next arrival sequence number.
    pub fn next_arrival_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Make sure future sequence numbers sort after `seq`.
    pub fn observe_arrival_seq(&self, seq: u64) {
        self.next_seq.fetch_max(seq + 1, Ordering::SeqCst);
    }

    /// Wake-up handle signalled whenever work may have become available.
    pub fn waker(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Whether a new admission would be refused right now.
    pub fn is_saturated(&self) -> bool {
        self.lock().len() >= self.config.max_size
    }

    /// Enqueue a newly admitted job, failing when the queue is full.
    pub fn enqueue(&self, entry: QueueEntry) -> Result<()> {
        let mut inner = self.lock();
        inner.promote(Instant::now(), self.config.aging_interval);
        if inner.len() >= self.config.max_size {
            debug!(
                subsystem = "jobs",
                component = "queue",
                op = "enqueue",
                capacity = self.config.max_size,
                "Queue saturated"
            );
            return Err(Error::QueueSaturated {
                capacity: self.config.max_size,
            });
        }
        let level = level_of(entry.priority);
        inner.insert_ready(entry, level, Instant::now());
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Re-enqueue a retry, invisible until `delay` has elapsed.
    ///
    /// Retries bypass the capacity check: the job was already admitted, and
    /// refusing it here would lose it.
    pub fn enqueue_deferred(&self, entry: QueueEntry, delay: Duration) {
        let now = Instant::now();
        let mut inner = self.lock();
        if delay.is_zero() {
            let level = level_of(entry.priority);
            inner.insert_ready(entry, level, now);
        } else {
            let visible_at = now + delay;
            let key = (entry.arrival_seq, entry.job_id);
            inner
                .index
                .insert(entry.job_id, Location::Deferred { visible_at, key });
            inner.deferred.insert((visible_at, key), entry);
        }
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Re-insert a job recovered from the store, bypassing capacity.
    pub fn restore(&self, entry: QueueEntry) {
        self.observe_arrival_seq(entry.arrival_seq);
        self.enqueue_deferred(entry, Duration::ZERO);
    }

    /// Remove and return the highest-ranked visible entry.
    pub fn dequeue(&self) -> Option<QueueEntry> {
        self.dequeue_with(|_| true)
    }

    /// Remove and return the highest-ranked visible entry that `claim` accepts.
    ///
    /// `claim` is called in rank order under the queue lock and the scan stops
    /// at the first `true`, so it may reserve resources for the entry it
    /// accepts.
    pub fn dequeue_with<F>(&self, mut claim: F) -> Option<QueueEntry>
    where
        F: FnMut(&QueueEntry) -> bool,
    {
        let mut inner = self.lock();
        inner.promote(Instant::now(), self.config.aging_interval);
        for level in (0..3).rev() {
            let chosen = inner.ready[level]
                .iter()
                .find(|(_, slot)| claim(&slot.entry))
                .map(|(key, _)| *key);
            if let Some(key) = chosen {
                return inner.take_ready(level, key);
            }
        }
        None
    }

    /// The entry `dequeue` would return, without removing it.
    pub fn peek(&self) -> Option<QueueEntry> {
        let mut inner = self.lock();
        inner.promote(Instant::now(), self.config.aging_interval);
        (0..3)
            .rev()
            .find_map(|level| inner.ready[level].values().next())
            .map(|slot| slot.entry.clone())
    }

    /// Remove a job wherever it is. Returns whether it was present.
    pub fn remove(&self, job_id: Uuid) -> bool {
        let mut inner = self.lock();
        match inner.index.get(&job_id).copied() {
            Some(Location::Ready { level, key }) => inner.take_ready(level, key).is_some(),
            Some(Location::Deferred { visible_at, key }) => {
                inner.index.remove(&job_id);
                inner.deferred.remove(&(visible_at, key)).is_some()
            }
            None => false,
        }
    }

    pub fn contains(&self, job_id: Uuid) -> bool {
        self.lock().index.contains_key(&job_id)
    }

    /// Total entries, ready plus deferred.
    pub fn size(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn ready_len(&self) -> usize {
        let mut inner = self.lock();
        inner.promote(Instant::now(), self.config.aging_interval);
        inner.ready_len()
    }

    pub fn deferred_len(&self) -> usize {
        let mut inner = self.lock();
        inner.promote(Instant::now(), self.config.aging_interval);
        inner.deferred.len()
    }

    /// When the earliest deferred entry becomes visible.
    pub fn next_visible_at(&self) -> Option<Instant> {
        self.lock().deferred.keys().next().map(|(at, _)| *at)
    }

    /// Ids of every queued job.
    pub fn job_ids(&self) -> Vec<Uuid> {
        self.lock().index.keys().copied().collect()
    }
}
