//! Background scheduling loop and bounded worker pool.
//!
//! One long-lived task promotes due items, claims work while capacity
//! lasts, and parks on the queue's change notification with a short
//! timeout. Each claimed item gets a fresh [`CancelToken`], registered in
//! a concurrent map keyed by item id so `cancel_item` stays O(1). Workers
//! are tokio tasks holding an owned semaphore permit; the permit, the
//! token registration, and the active counter all release together when
//! the worker ends, whatever the outcome.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::config::MAX_CONCURRENT_CEILING;
use crate::core::{Core, DownloadCore};
use crate::error::CoreError;
use crate::queue::{CancelOutcome, ItemPatch, QueueStatus};
use crate::rate_limit::RateLimiter;

/// How long the loop parks when the queue is quiet.
const IDLE_WAIT: Duration = Duration::from_millis(500);

/// Default shutdown grace period.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Shared state between the scheduler handle, the loop, and workers.
struct Inner {
    core: Arc<Core>,
    tokens: DashMap<u64, CancelToken>,
    semaphore: Mutex<Arc<Semaphore>>,
    max_concurrent: AtomicUsize,
    active: Arc<AtomicUsize>,
    shutdown: AtomicBool,
    workers: tokio::sync::Mutex<JoinSet<()>>,
    pacing: Option<Arc<RateLimiter>>,
    pause_timeout: Duration,
}

/// Worker scheduler over a shared [`Core`].
pub struct Scheduler {
    inner: Arc<Inner>,
    loop_task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("active", &self.inner.active.load(Ordering::SeqCst))
            .field(
                "max_concurrent",
                &self.inner.max_concurrent.load(Ordering::SeqCst),
            )
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Creates a scheduler; concurrency comes from the core's config.
    #[must_use]
    pub fn new(core: Arc<Core>) -> Self {
        Self::with_submission_pacing(core, None)
    }

    /// Creates a scheduler that paces submissions through a token bucket.
    ///
    /// One token is taken per claim, which spreads out the submission burst
    /// a long queue would otherwise fire at a single server.
    #[must_use]
    pub fn with_submission_pacing(core: Arc<Core>, pacing: Option<Arc<RateLimiter>>) -> Self {
        let max = core
            .config
            .max_concurrent_downloads
            .clamp(1, MAX_CONCURRENT_CEILING);
        let pause_timeout = Duration::from_secs(core.config.pause_timeout_secs);
        Self {
            inner: Arc::new(Inner {
                core,
                tokens: DashMap::new(),
                semaphore: Mutex::new(Arc::new(Semaphore::new(max))),
                max_concurrent: AtomicUsize::new(max),
                active: Arc::new(AtomicUsize::new(0)),
                shutdown: AtomicBool::new(false),
                workers: tokio::sync::Mutex::new(JoinSet::new()),
                pacing,
                pause_timeout,
            }),
            loop_task: tokio::sync::Mutex::new(None),
        }
    }

    /// Starts the background loop. Idempotent per scheduler.
    pub async fn start(&self) {
        let mut slot = self.loop_task.lock().await;
        if slot.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *slot = Some(tokio::spawn(run_loop(inner)));
        info!(
            max_concurrent = self.inner.max_concurrent.load(Ordering::SeqCst),
            "scheduler started"
        );
    }

    /// Number of workers currently holding a slot.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Replaces the worker-pool bound. In-flight transfers drain under the
    /// old bound; new claims obey the new one immediately.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Validation`] outside `1..=32`.
    pub fn set_max_concurrency(&self, n: usize) -> Result<(), CoreError> {
        if !(1..=MAX_CONCURRENT_CEILING).contains(&n) {
            return Err(CoreError::validation(
                "max_concurrency",
                format!("{n} outside 1..={MAX_CONCURRENT_CEILING}"),
            ));
        }
        *self.inner.lock_semaphore() = Arc::new(Semaphore::new(n));
        self.inner.max_concurrent.store(n, Ordering::SeqCst);
        info!(max_concurrent = n, "concurrency updated");
        Ok(())
    }

    /// Cancels one item: O(1) token lookup plus the queue-side transition
    /// for items no worker has picked up yet.
    #[instrument(skip(self))]
    pub fn cancel_item(&self, id: u64) {
        self.inner.cancel_item(id);
    }

    /// Cancels every non-terminal item.
    pub fn cancel_all(&self) {
        self.inner.cancel_all();
    }

    /// Parks queued items and asks running workers to yield.
    pub fn pause_all(&self) {
        self.inner.core.queue.pause_all();
        for entry in self.inner.tokens.iter() {
            entry.value().request_pause(Some(self.inner.pause_timeout));
        }
        info!("pause requested for all items");
    }

    /// Releases parked items and resumes any paused tokens.
    pub fn resume_all(&self) {
        for entry in self.inner.tokens.iter() {
            entry.value().resume();
        }
        self.inner.core.queue.resume_all();
        info!("resume requested for all items");
    }

    /// Stops the loop, cancels in-flight work, and waits up to `grace`.
    ///
    /// Workers that ignore their token past the grace period are aborted,
    /// and their items are transitioned to `Cancelled` on their behalf.
    #[instrument(skip(self))]
    pub async fn shutdown(&self, grace: Duration) {
        info!("scheduler shutting down");
        self.inner.shutdown.store(true, Ordering::SeqCst);

        // Items that never started go straight to Cancelled; running
        // workers get their tokens cancelled and finish on their own.
        self.inner.cancel_all();

        let deadline = tokio::time::Instant::now() + grace;
        while self.inner.active.load(Ordering::SeqCst) > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let mut workers = self.inner.workers.lock().await;
        if self.inner.active.load(Ordering::SeqCst) > 0 {
            warn!(
                remaining = self.inner.active.load(Ordering::SeqCst),
                "grace period elapsed; aborting workers"
            );
            workers.abort_all();
        }
        while workers.join_next().await.is_some() {}
        drop(workers);

        // Aborted workers never ran their cleanup; finish it for them so
        // their items do not stay stuck in an active status.
        let orphaned: Vec<u64> = self.inner.tokens.iter().map(|entry| *entry.key()).collect();
        for id in orphaned {
            self.inner.tokens.remove(&id);
            let _ = self
                .inner
                .core
                .queue
                .update_status(id, QueueStatus::Cancelled, ItemPatch::default());
        }
        self.inner.active.store(0, Ordering::SeqCst);

        if let Some(handle) = self.loop_task.lock().await.take() {
            let _ = handle.await;
        }
        info!("scheduler stopped");
    }
}

impl Inner {
    fn cancel_item(&self, id: u64) {
        // Clone the token out of the map so cancel() never runs under the
        // shard lock.
        let token = self.tokens.get(&id).map(|entry| entry.value().clone());
        if let Some(token) = token {
            token.cancel();
        }
        match self.core.queue.cancel_item(id) {
            Ok(CancelOutcome::WorkerOwned) => {
                debug!("cancellation deferred to worker");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "cancel_item on unknown id"),
        }
    }

    fn cancel_all(&self) {
        for id in self.core.queue.non_terminal_ids() {
            self.cancel_item(id);
        }
    }

    fn lock_semaphore(&self) -> std::sync::MutexGuard<'_, Arc<Semaphore>> {
        match self.semaphore.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

async fn run_loop(inner: Arc<Inner>) {
    while !inner.shutdown.load(Ordering::SeqCst) {
        inner.core.queue.update_scheduled_items(SystemTime::now());
        claim_while_capacity(&inner).await;

        // Reap finished worker handles without blocking.
        {
            let mut workers = inner.workers.lock().await;
            while workers.try_join_next().is_some() {}
        }

        inner.core.queue.wait_for_change(IDLE_WAIT).await;
    }
}

async fn claim_while_capacity(inner: &Arc<Inner>) {
    loop {
        if inner.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let semaphore = Arc::clone(&*inner.lock_semaphore());
        let Ok(permit) = semaphore.try_acquire_owned() else {
            return;
        };
        let Some(item) = inner.core.queue.claim_next_downloadable() else {
            // Permit returns to the pool on drop.
            return;
        };

        if let Some(pacing) = &inner.pacing {
            pacing.acquire(1).await;
        }

        let token = CancelToken::new();
        inner.tokens.insert(item.id, token.clone());
        inner.active.fetch_add(1, Ordering::SeqCst);

        let core = Arc::clone(&inner.core);
        let worker_inner = Arc::clone(inner);
        let item_id = item.id;

        let mut workers = inner.workers.lock().await;
        workers.spawn(async move {
            let outcome = DownloadCore::run(&core, item_id, token).await;
            debug!(item_id, ?outcome, "worker finished");
            worker_inner.tokens.remove(&item_id);
            worker_inner.active.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
        });
    }
}
