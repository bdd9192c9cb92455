//! Micro-batching of compatible work.
//!
//! Items sharing a [`BatchKey`] (target dependency plus job kind) are grouped
//! into one open batch per key. A batch is handed back to the caller as soon
//! as it reaches `max_size`; otherwise a timer flushes it once `window` has
//! elapsed since it was opened, placing it on the flushed list and waking
//! whoever waits on the shared notifier.
//!
//! With batching disabled (or `max_size <= 1`) every offer dispatches
//! immediately as a batch of one.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use conduit_core::defaults;
use conduit_core::JobKind;

/// Batcher configuration.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub enabled: bool,
    pub max_size: usize,
    pub window: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: defaults::BATCH_MAX_SIZE,
            window: Duration::from_millis(defaults::BATCH_WINDOW_MS),
        }
    }
}

impl BatchConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `BATCH_ENABLED` | `true` | Group compatible jobs into one call |
    /// | `BATCH_MAX_SIZE` | `10` | Flush when a batch reaches this size |
    /// | `BATCH_WINDOW_MS` | `100` | Flush when a batch is this old |
    pub fn from_env() -> Self {
        Self {
            enabled: std::env::var("BATCH_ENABLED")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
            max_size: std::env::var("BATCH_MAX_SIZE")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(defaults::BATCH_MAX_SIZE)
                .max(1),
            window: Duration::from_millis(
                std::env::var("BATCH_WINDOW_MS")
                    .ok()
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(defaults::BATCH_WINDOW_MS),
            ),
        }
    }

    /// Direct per-job dispatch.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn is_active(&self) -> bool {
        self.enabled && self.max_size > 1
    }
}

/// Compatibility key: jobs batch together only with the same dependency and kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub dependency: String,
    pub kind: JobKind,
}

impl BatchKey {
    pub fn new(dependency: impl Into<String>, kind: JobKind) -> Self {
        Self {
            dependency: dependency.into(),
            kind,
        }
    }
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.dependency, self.kind)
    }
}

/// Why a batch was handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// Batching is off; a batch of one.
    Direct,
    Size,
    Window,
    Shutdown,
}

/// A group of items dispatched together.
#[derive(Debug)]
pub struct Batch<T> {
    pub id: u64,
    pub key: BatchKey,
    pub items: Vec<T>,
    pub opened_at: Instant,
    pub trigger: FlushTrigger,
}

impl<T> Batch<T> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Result of [`MicroBatcher::offer`].
#[derive(Debug)]
pub enum Offer<T> {
    /// Dispatch this batch now.
    Dispatch(Batch<T>),
    /// The item joined an open batch that will flush later.
    Joined { batch_id: u64, size: usize },
}

/// One open batch, for inspection.
#[derive(Debug, Clone)]
pub struct OpenBatchStats {
    pub batch_id: u64,
    pub key: BatchKey,
    pub size: usize,
    pub age: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct BatcherStats {
    pub open_batches: Vec<OpenBatchStats>,
    pub flushed_waiting: usize,
}

struct OpenBatch<T> {
    id: u64,
    items: Vec<T>,
    opened_at: Instant,
}

struct BatcherState<T> {
    open: HashMap<BatchKey, OpenBatch<T>>,
    flushed: VecDeque<Batch<T>>,
    next_id: u64,
}

struct BatcherInner<T> {
    config: BatchConfig,
    state: Mutex<BatcherState<T>>,
    waker: Arc<Notify>,
}

impl<T> BatcherInner<T> {
    fn lock(&self) -> MutexGuard<'_, BatcherState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn expire(&self, key: &BatchKey, batch_id: u64) {
        let mut state = self.lock();
        if state.open.get(key).map(|b| b.id) != Some(batch_id) {
            // Already flushed on size or shutdown.
            return;
        }
        if let Some(open) = state.open.remove(key) {
            debug!(
                subsystem = "jobs",
                component = "batcher",
                batch_id,
                key = %key,
                size = open.items.len(),
                "Batch window elapsed"
            );
            state.flushed.push_back(Batch {
                id: open.id,
                key: key.clone(),
                items: open.items,
                opened_at: open.opened_at,
                trigger: FlushTrigger::Window,
            });
        }
        drop(state);
        self.waker.notify_waiters();
    }
}

/// Groups offered items into per-key batches.
pub struct MicroBatcher<T> {
    inner: Arc<BatcherInner<T>>,
}

impl<T> Clone for MicroBatcher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> MicroBatcher<T> {
    /// `waker` is notified whenever a window flush lands on the flushed list.
    pub fn new(config: BatchConfig, waker: Arc<Notify>) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                config,
                state: Mutex::new(BatcherState {
                    open: HashMap::new(),
                    flushed: VecDeque::new(),
                    next_id: 1,
                }),
                waker,
            }),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.inner.config
    }

    /// Add an item to the open batch for `key`, opening one if needed.
    ///
    /// Opening a batch spawns its window timer, so this must be called from
    /// within a tokio runtime.
    pub fn offer(&self, key: BatchKey, item: T) -> Offer<T> {
        let config = &self.inner.config;
        let mut guard = self.inner.lock();
        let state = &mut *guard;

        if !config.is_active() {
            let id = state.next_id;
            state.next_id += 1;
            return Offer::Dispatch(Batch {
                id,
                key,
                items: vec![item],
                opened_at: Instant::now(),
                trigger: FlushTrigger::Direct,
            });
        }

        let id = match state.open.entry(key.clone()) {
            Entry::Occupied(mut slot) => {
                slot.get_mut().items.push(item);
                let size = slot.get().items.len();
                if size < config.max_size {
                    trace!(
                        subsystem = "jobs",
                        component = "batcher",
                        batch_id = slot.get().id,
                        key = %key,
                        size,
                        "Joined open batch"
                    );
                    return Offer::Joined {
                        batch_id: slot.get().id,
                        size,
                    };
                }
                let open = slot.remove();
                debug!(
                    subsystem = "jobs",
                    component = "batcher",
                    batch_id = open.id,
                    key = %key,
                    size,
                    "Batch full"
                );
                return Offer::Dispatch(Batch {
                    id: open.id,
                    key,
                    items: open.items,
                    opened_at: open.opened_at,
                    trigger: FlushTrigger::Size,
                });
            }
            Entry::Vacant(slot) => {
                let id = state.next_id;
                state.next_id += 1;
                slot.insert(OpenBatch {
                    id,
                    items: vec![item],
                    opened_at: Instant::now(),
                });
                id
            }
        };
        drop(guard);

        let weak: Weak<BatcherInner<T>> = Arc::downgrade(&self.inner);
        let window = config.window;
        let timer_key = key;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire(&timer_key, id);
            }
        });
        Offer::Joined { batch_id: id, size: 1 }
    }

    /// Pop the oldest window-flushed batch.
    pub fn take_flushed(&self) -> Option<Batch<T>> {
        self.inner.lock().flushed.pop_front()
    }

    /// Flush everything now, regardless of size or window.
    pub fn flush_all(&self) -> Vec<Batch<T>> {
        let mut state = self.inner.lock();
        let mut batches: Vec<Batch<T>> = state.flushed.drain(..).collect();
        let mut open: Vec<(BatchKey, OpenBatch<T>)> = state.open.drain().collect();
        open.sort_by_key(|(_, b)| b.id);
        batches.extend(open.into_iter().map(|(key, b)| Batch {
            id: b.id,
            key,
            items: b.items,
            opened_at: b.opened_at,
            trigger: FlushTrigger::Shutdown,
        }));
        batches
    }

    /// Items held in open or flushed-but-untaken batches.
    pub fn pending_items(&self) -> usize {
        let state = self.inner.lock();
        state.open.values().map(|b| b.items.len()).sum::<usize>()
            + state.flushed.iter().map(Batch::len).sum::<usize>()
    }

    pub fn stats(&self) -> BatcherStats {
        let state = self.inner.lock();
        let now = Instant::now();
        let mut open_batches: Vec<OpenBatchStats> = state
            .open
            .iter()
            .map(|(key, b)| OpenBatchStats {
                batch_id: b.id,
                key: key.clone(),
                size: b.items.len(),
                age: now.saturating_duration_since(b.opened_at),
            })
            .collect();
        open_batches.sort_by_key(|b| b.batch_id);
        BatcherStats {
            open_batches,
            flushed_waiting: state.flushed.len(),
        }
    }
}
