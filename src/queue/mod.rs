//! Authoritative in-memory download queue.
//!
//! [`QueueManager`] owns every [`QueueItem`] and serializes all transitions
//! under one lock. The scheduler claims work through
//! [`claim_next_downloadable`](QueueManager::claim_next_downloadable), which
//! marks the item `Allocating` in the same critical section that selects it,
//! so no two workers can ever hold the same item.
//!
//! Listener fan-out never runs under the queue lock: events are appended to
//! a FIFO under their own lock and drained by whichever thread holds the
//! dispatch mutex, which keeps delivery order equal to transition order.

mod error;
mod item;

pub use error::QueueError;
pub use item::{
    ItemProgress, MetadataSnapshot, QueueItem, QueueStatus, SourceKind, is_valid_transition,
};

use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use tokio::sync::Notify;
use tracing::{debug, instrument, warn};

use crate::options::DownloadOptions;

/// Default maximum number of items held by the queue.
pub const DEFAULT_QUEUE_SIZE_LIMIT: usize = 1000;

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Observer callback for queue events.
pub type Listener = Arc<dyn Fn(&QueueEvent) + Send + Sync>;

/// Handle returned by [`QueueManager::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerHandle(u64);

/// Events delivered to subscribers.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// An item entered the queue.
    Added {
        /// Snapshot at insertion time.
        item: QueueItem,
    },
    /// An item's status or progress changed.
    Changed {
        /// Item id.
        id: u64,
        /// Status before the change (equals `to` for progress-only patches).
        from: QueueStatus,
        /// Status after the change.
        to: QueueStatus,
        /// Snapshot after the change.
        item: QueueItem,
    },
    /// An item left the queue.
    Removed {
        /// Item id.
        id: u64,
    },
}

/// Non-status fields that may accompany a transition.
#[derive(Debug, Clone, Default)]
pub struct ItemPatch {
    /// New progress numbers (ratio is clamped monotone within an attempt).
    pub progress: Option<ItemProgress>,
    /// Final saved path.
    pub filepath: Option<PathBuf>,
    /// Sanitized error text.
    pub error_message: Option<String>,
    /// Extracted metadata snapshot.
    pub metadata: Option<MetadataSnapshot>,
}

/// Counts per status, as returned by [`QueueManager::statistics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatistics {
    /// Items waiting for their start time.
    pub scheduled: usize,
    /// Items ready to claim.
    pub queued: usize,
    /// Items mid-claim.
    pub allocating: usize,
    /// Items transferring.
    pub downloading: usize,
    /// Items post-processing.
    pub processing: usize,
    /// Parked items.
    pub paused: usize,
    /// Terminal successes.
    pub completed: usize,
    /// Terminal cancellations.
    pub cancelled: usize,
    /// Terminal failures.
    pub errors: usize,
    /// All items.
    pub total: usize,
}

/// Outcome of [`QueueManager::cancel_item`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The item never reached a worker; it is now `Cancelled`.
    CancelledDirectly,
    /// A worker owns the item; its token must be cancelled and the worker
    /// will perform the terminal transition.
    WorkerOwned,
    /// The item was already terminal; nothing changed.
    AlreadyTerminal,
}

struct QueueState {
    items: HashMap<u64, QueueItem>,
    order: Vec<u64>,
    next_id: u64,
    size_limit: usize,
}

/// Thread-safe queue manager with listener fan-out.
pub struct QueueManager {
    state: Mutex<QueueState>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener_id: AtomicU64,
    pending_events: Mutex<VecDeque<QueueEvent>>,
    dispatching: Mutex<()>,
    notify: Notify,
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager").finish_non_exhaustive()
    }
}

impl QueueManager {
    /// Creates a queue bounded at `size_limit` items (0 means the default).
    #[must_use]
    pub fn new(size_limit: usize) -> Self {
        let size_limit = if size_limit == 0 {
            DEFAULT_QUEUE_SIZE_LIMIT
        } else {
            size_limit
        };
        Self {
            state: Mutex::new(QueueState {
                items: HashMap::new(),
                order: Vec::new(),
                next_id: 1,
                size_limit,
            }),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            pending_events: Mutex::new(VecDeque::new()),
            dispatching: Mutex::new(()),
            notify: Notify::new(),
        }
    }

    /// Adds an item; created `Scheduled` iff `scheduled_at` is in the future.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::QueueFull`] at the configured limit.
    #[instrument(skip(self, options), fields(url = %url))]
    pub fn add(
        &self,
        url: String,
        options: DownloadOptions,
        scheduled_at: Option<SystemTime>,
    ) -> Result<u64> {
        let event = {
            let mut state = self.lock_state();
            if state.items.len() >= state.size_limit {
                return Err(QueueError::QueueFull {
                    limit: state.size_limit,
                });
            }
            let id = state.next_id;
            state.next_id += 1;
            let item = QueueItem::new(id, url, options, scheduled_at);
            debug!(id, status = %item.status, "item added");
            state.order.push(id);
            state.items.insert(id, item.clone());
            QueueEvent::Added { item }
        };
        let id = match &event {
            QueueEvent::Added { item } => item.id,
            _ => unreachable!(),
        };
        self.emit(vec![event]);
        Ok(id)
    }

    /// Returns a snapshot of one item.
    #[must_use]
    pub fn get(&self, id: u64) -> Option<QueueItem> {
        self.lock_state().items.get(&id).cloned()
    }

    /// Returns snapshots of all items in display (insertion/swap) order.
    #[must_use]
    pub fn list(&self) -> Vec<QueueItem> {
        let state = self.lock_state();
        state
            .order
            .iter()
            .filter_map(|id| state.items.get(id).cloned())
            .collect()
    }

    /// Applies a status transition plus an optional patch, atomically.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ItemNotFound`], [`QueueError::TerminalImmutable`],
    /// or [`QueueError::InvalidTransition`].
    #[instrument(skip(self, patch))]
    pub fn update_status(
        &self,
        id: u64,
        new_status: QueueStatus,
        patch: ItemPatch,
    ) -> Result<()> {
        let event = {
            let mut state = self.lock_state();
            let item = state
                .items
                .get_mut(&id)
                .ok_or(QueueError::ItemNotFound(id))?;
            let from = item.status;

            if from.is_terminal() {
                return Err(QueueError::TerminalImmutable {
                    id,
                    status: from,
                });
            }
            if !is_valid_transition(from, new_status) {
                return Err(QueueError::InvalidTransition {
                    id,
                    from,
                    to: new_status,
                });
            }

            item.status = new_status;
            if new_status.is_terminal() {
                item.final_status_time = Some(SystemTime::now());
            }
            apply_patch(item, patch);
            QueueEvent::Changed {
                id,
                from,
                to: new_status,
                item: item.clone(),
            }
        };
        self.emit(vec![event]);
        Ok(())
    }

    /// Applies a patch without changing status (metadata, progress).
    ///
    /// Progress ratios are clamped monotone within the current attempt.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ItemNotFound`].
    pub fn apply_patch(&self, id: u64, patch: ItemPatch) -> Result<()> {
        let event = {
            let mut state = self.lock_state();
            let item = state
                .items
                .get_mut(&id)
                .ok_or(QueueError::ItemNotFound(id))?;
            apply_patch(item, patch);
            QueueEvent::Changed {
                id,
                from: item.status,
                to: item.status,
                item: item.clone(),
            }
        };
        self.emit(vec![event]);
        Ok(())
    }

    /// Atomically claims the next downloadable item.
    ///
    /// Candidates are `Queued` items whose `scheduled_at` is unset or past,
    /// in display order. The returned item is already `Allocating`; the
    /// caller owns its lifecycle from here.
    #[must_use]
    pub fn claim_next_downloadable(&self) -> Option<QueueItem> {
        let now = SystemTime::now();
        let (event, claimed) = {
            let mut state = self.lock_state();
            let id = state.order.iter().copied().find(|id| {
                state.items.get(id).is_some_and(|item| {
                    item.status == QueueStatus::Queued
                        && item.scheduled_at.is_none_or(|at| at <= now)
                })
            })?;
            // The find above guarantees presence.
            let item = state.items.get_mut(&id)?;
            let from = item.status;
            item.status = QueueStatus::Allocating;
            let snapshot = item.clone();
            (
                QueueEvent::Changed {
                    id,
                    from,
                    to: QueueStatus::Allocating,
                    item: snapshot.clone(),
                },
                snapshot,
            )
        };
        debug!(id = claimed.id, "claimed item");
        self.emit(vec![event]);
        Some(claimed)
    }

    /// Promotes every `Scheduled` item whose start time has arrived.
    ///
    /// Returns the promoted ids.
    pub fn update_scheduled_items(&self, now: SystemTime) -> Vec<u64> {
        let (events, promoted) = {
            let mut state = self.lock_state();
            let due: Vec<u64> = state
                .order
                .iter()
                .copied()
                .filter(|id| {
                    state.items.get(id).is_some_and(|item| {
                        item.status == QueueStatus::Scheduled
                            && item.scheduled_at.is_none_or(|at| at <= now)
                    })
                })
                .collect();
            let mut events = Vec::with_capacity(due.len());
            for id in &due {
                if let Some(item) = state.items.get_mut(id) {
                    item.status = QueueStatus::Queued;
                    events.push(QueueEvent::Changed {
                        id: *id,
                        from: QueueStatus::Scheduled,
                        to: QueueStatus::Queued,
                        item: item.clone(),
                    });
                }
            }
            (events, due)
        };
        if !promoted.is_empty() {
            debug!(count = promoted.len(), "promoted scheduled items");
            self.emit(events);
        }
        promoted
    }

    /// Cancels one item as far as the queue alone can.
    ///
    /// Items a worker owns (`Allocating`/`Downloading`/`Processing`) are
    /// left for the worker to transition after its token fires; the caller
    /// (the scheduler) is told so via [`CancelOutcome::WorkerOwned`].
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ItemNotFound`].
    #[instrument(skip(self))]
    pub fn cancel_item(&self, id: u64) -> Result<CancelOutcome> {
        let (events, outcome) = {
            let mut state = self.lock_state();
            let item = state
                .items
                .get_mut(&id)
                .ok_or(QueueError::ItemNotFound(id))?;
            match item.status {
                status if status.is_terminal() => (Vec::new(), CancelOutcome::AlreadyTerminal),
                status if status.is_active() => (Vec::new(), CancelOutcome::WorkerOwned),
                QueueStatus::Scheduled => {
                    // Two legal hops: Scheduled -> Queued -> Cancelled.
                    let mut events = Vec::with_capacity(2);
                    item.status = QueueStatus::Queued;
                    events.push(QueueEvent::Changed {
                        id,
                        from: QueueStatus::Scheduled,
                        to: QueueStatus::Queued,
                        item: item.clone(),
                    });
                    item.status = QueueStatus::Cancelled;
                    item.final_status_time = Some(SystemTime::now());
                    events.push(QueueEvent::Changed {
                        id,
                        from: QueueStatus::Queued,
                        to: QueueStatus::Cancelled,
                        item: item.clone(),
                    });
                    (events, CancelOutcome::CancelledDirectly)
                }
                from => {
                    item.status = QueueStatus::Cancelled;
                    item.final_status_time = Some(SystemTime::now());
                    let event = QueueEvent::Changed {
                        id,
                        from,
                        to: QueueStatus::Cancelled,
                        item: item.clone(),
                    };
                    (vec![event], CancelOutcome::CancelledDirectly)
                }
            }
        };
        self.emit(events);
        Ok(outcome)
    }

    /// Returns ids of all non-terminal items (for `cancel_all`).
    #[must_use]
    pub fn non_terminal_ids(&self) -> Vec<u64> {
        let state = self.lock_state();
        state
            .order
            .iter()
            .copied()
            .filter(|id| {
                state
                    .items
                    .get(id)
                    .is_some_and(|item| !item.status.is_terminal())
            })
            .collect()
    }

    /// Parks every `Queued` item. Running items are the scheduler's job.
    pub fn pause_all(&self) -> Vec<u64> {
        self.transition_matching(QueueStatus::Queued, QueueStatus::Paused)
    }

    /// Releases every `Paused` item back to `Queued`.
    pub fn resume_all(&self) -> Vec<u64> {
        self.transition_matching(QueueStatus::Paused, QueueStatus::Queued)
    }

    /// Drops all `Completed` items, emitting `Removed` for each.
    pub fn clear_completed(&self) -> usize {
        let events = {
            let mut state = self.lock_state();
            let removed: Vec<u64> = state
                .order
                .iter()
                .copied()
                .filter(|id| {
                    state
                        .items
                        .get(id)
                        .is_some_and(|item| item.status == QueueStatus::Completed)
                })
                .collect();
            let QueueState { items, order, .. } = &mut *state;
            for id in &removed {
                items.remove(id);
            }
            order.retain(|id| items.contains_key(id));
            removed
                .into_iter()
                .map(|id| QueueEvent::Removed { id })
                .collect::<Vec<_>>()
        };
        let count = events.len();
        self.emit(events);
        count
    }

    /// Moves a terminal item back to `Queued` for a fresh attempt.
    ///
    /// Increments `retry_count`, resets progress to zero, clears the error
    /// and final-status time.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ItemNotFound`] or [`QueueError::NotTerminal`].
    #[instrument(skip(self))]
    pub fn retry_item(&self, id: u64) -> Result<()> {
        let event = {
            let mut state = self.lock_state();
            let item = state
                .items
                .get_mut(&id)
                .ok_or(QueueError::ItemNotFound(id))?;
            let from = item.status;
            if !from.is_terminal() {
                return Err(QueueError::NotTerminal { id, status: from });
            }
            item.status = QueueStatus::Queued;
            item.retry_count += 1;
            item.progress = ItemProgress::default();
            item.error_message = None;
            item.final_status_time = None;
            QueueEvent::Changed {
                id,
                from,
                to: QueueStatus::Queued,
                item: item.clone(),
            }
        };
        self.emit(vec![event]);
        Ok(())
    }

    /// Swaps two adjacent display positions.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::SwapRefused`] for non-adjacent positions, out
    /// of range positions, or when either endpoint is `Downloading` or
    /// `Processing`.
    pub fn swap(&self, i: usize, j: usize) -> Result<()> {
        let mut state = self.lock_state();
        if i.abs_diff(j) != 1 {
            return Err(QueueError::SwapRefused {
                i,
                j,
                reason: "positions are not adjacent".to_string(),
            });
        }
        if i >= state.order.len() || j >= state.order.len() {
            return Err(QueueError::SwapRefused {
                i,
                j,
                reason: "position out of range".to_string(),
            });
        }
        for pos in [i, j] {
            let id = state.order[pos];
            if let Some(item) = state.items.get(&id)
                && matches!(
                    item.status,
                    QueueStatus::Downloading | QueueStatus::Processing
                )
            {
                return Err(QueueError::SwapRefused {
                    i,
                    j,
                    reason: format!("item {id} is {}", item.status),
                });
            }
        }
        state.order.swap(i, j);
        Ok(())
    }

    /// Returns counts by status.
    #[must_use]
    pub fn statistics(&self) -> QueueStatistics {
        let state = self.lock_state();
        let mut stats = QueueStatistics::default();
        for item in state.items.values() {
            stats.total += 1;
            match item.status {
                QueueStatus::Scheduled => stats.scheduled += 1,
                QueueStatus::Queued => stats.queued += 1,
                QueueStatus::Allocating => stats.allocating += 1,
                QueueStatus::Downloading => stats.downloading += 1,
                QueueStatus::Processing => stats.processing += 1,
                QueueStatus::Paused => stats.paused += 1,
                QueueStatus::Completed => stats.completed += 1,
                QueueStatus::Cancelled => stats.cancelled += 1,
                QueueStatus::Error => stats.errors += 1,
            }
        }
        stats
    }

    /// Registers a listener; events arrive in transition order per item.
    pub fn subscribe(&self, listener: Listener) -> ListenerHandle {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.lock_listeners().push((id, listener));
        ListenerHandle(id)
    }

    /// Removes a previously registered listener.
    pub fn unsubscribe(&self, handle: ListenerHandle) {
        self.lock_listeners().retain(|(id, _)| *id != handle.0);
    }

    /// Waits for any queue change, up to `timeout`.
    ///
    /// Used by the scheduler instead of busy-polling. Spurious wakeups are
    /// fine; the caller re-scans the queue either way.
    pub async fn wait_for_change(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }

    fn transition_matching(&self, from: QueueStatus, to: QueueStatus) -> Vec<u64> {
        let (events, changed) = {
            let mut state = self.lock_state();
            let matching: Vec<u64> = state
                .order
                .iter()
                .copied()
                .filter(|id| {
                    state
                        .items
                        .get(id)
                        .is_some_and(|item| item.status == from)
                })
                .collect();
            let mut events = Vec::with_capacity(matching.len());
            for id in &matching {
                if let Some(item) = state.items.get_mut(id) {
                    item.status = to;
                    events.push(QueueEvent::Changed {
                        id: *id,
                        from,
                        to,
                        item: item.clone(),
                    });
                }
            }
            (events, matching)
        };
        self.emit(events);
        changed
    }

    /// Queues events and drains the FIFO outside the state lock.
    ///
    /// Whichever thread wins the dispatch try-lock drains for everyone, so
    /// delivery order equals generation order and a listener that calls
    /// back into the queue (emitting again) cannot deadlock: its events
    /// land in the FIFO and the outer drainer picks them up. A panicking
    /// listener is logged and skipped.
    fn emit(&self, events: Vec<QueueEvent>) {
        if events.is_empty() {
            return;
        }
        self.lock_pending().extend(events);

        loop {
            let Ok(guard) = self.dispatching.try_lock() else {
                // Another thread (or an outer frame on this one) is
                // draining and will see our events.
                break;
            };
            loop {
                let event = {
                    let mut pending = self.lock_pending();
                    pending.pop_front()
                };
                let Some(event) = event else { break };

                let listeners: Vec<Listener> = self
                    .lock_listeners()
                    .iter()
                    .map(|(_, l)| Arc::clone(l))
                    .collect();
                for listener in listeners {
                    if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                        warn!("queue listener panicked; continuing");
                    }
                }
            }
            drop(guard);

            // An event enqueued between our last pop and the unlock would
            // otherwise be stranded; re-check before leaving.
            if self.lock_pending().is_empty() {
                break;
            }
        }

        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_listeners(&self) -> MutexGuard<'_, Vec<(u64, Listener)>> {
        match self.listeners.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, VecDeque<QueueEvent>> {
        match self.pending_events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Applies patch fields to an item, keeping progress monotone.
fn apply_patch(item: &mut QueueItem, patch: ItemPatch) {
    if let Some(progress) = patch.progress {
        let mut progress = progress;
        progress.ratio = progress.ratio.clamp(0.0, 1.0).max(item.progress.ratio);
        progress.bytes_done = progress.bytes_done.max(item.progress.bytes_done);
        item.progress = progress;
    }
    if let Some(filepath) = patch.filepath {
        item.filepath = Some(filepath);
    }
    if let Some(error_message) = patch.error_message {
        item.error_message = Some(error_message);
    }
    if let Some(metadata) = patch.metadata {
        item.metadata = Some(metadata);
    }
}
