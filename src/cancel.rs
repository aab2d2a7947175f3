//! Cooperative cancellation and pause signalling.
//!
//! A [`CancelToken`] belongs to exactly one queue item while that item is
//! claimed by a worker. Engines observe it at every progress tick and before
//! long I/O; the scheduler cancels it on user request or shutdown. Pause is
//! deadline-bounded so an abandoned pause cannot pin a token forever.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::CoreError;

/// Default pause deadline when the caller does not supply one.
pub const DEFAULT_PAUSE_TIMEOUT: Duration = Duration::from_secs(3600);

/// Interval between wakeups while blocked in a pause wait.
const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct TokenState {
    cancelled: bool,
    paused: bool,
    pause_deadline: Option<Instant>,
}

/// Cooperative cancellation token with pause support.
///
/// Cheap to clone; all clones share one state. Mutators and readers go
/// through a single lock, so observers only ever see atomic snapshots.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    state: Arc<Mutex<TokenState>>,
}

impl CancelToken {
    /// Creates a fresh, un-cancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotently marks the token cancelled and unblocks any pause wait.
    pub fn cancel(&self) {
        let mut state = self.lock();
        if !state.cancelled {
            debug!("cancel token triggered");
        }
        state.cancelled = true;
        state.paused = false;
        state.pause_deadline = None;
    }

    /// Requests a pause that auto-expires after `timeout`.
    ///
    /// Passing `None` uses [`DEFAULT_PAUSE_TIMEOUT`]. A cancelled token
    /// ignores pause requests.
    pub fn request_pause(&self, timeout: Option<Duration>) {
        let mut state = self.lock();
        if state.cancelled {
            return;
        }
        state.paused = true;
        state.pause_deadline = Some(Instant::now() + timeout.unwrap_or(DEFAULT_PAUSE_TIMEOUT));
    }

    /// Clears the paused flag, waking any blocked [`check`](Self::check).
    pub fn resume(&self) {
        let mut state = self.lock();
        state.paused = false;
        state.pause_deadline = None;
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// Returns whether a pause is currently requested and unexpired.
    ///
    /// Engines that can yield their worker slot (keeping a resumable partial
    /// file) use this probe instead of blocking in [`check`](Self::check).
    #[must_use]
    pub fn pause_requested(&self) -> bool {
        let mut state = self.lock();
        if !state.paused {
            return false;
        }
        if state
            .pause_deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
        {
            // Deadline elapsed: treated as resume().
            state.paused = false;
            state.pause_deadline = None;
            return false;
        }
        true
    }

    /// Errors with [`CoreError::Cancelled`] if cancelled; blocks while paused.
    ///
    /// The pause wait wakes in short intervals until `resume()`, `cancel()`,
    /// or the pause deadline. A deadline hit is treated as resume.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Cancelled`] once cancellation is observed.
    pub async fn check(&self) -> Result<(), CoreError> {
        loop {
            if self.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            if !self.pause_requested() {
                return Ok(());
            }
            tokio::time::sleep(PAUSE_POLL_INTERVAL).await;
        }
    }

    /// Races `fut` against cancellation, polling the flag in short
    /// intervals.
    ///
    /// This is the wrapper for long awaits the engine cannot chunk itself
    /// (request send, a stalled body read): the future is dropped as soon
    /// as cancellation is observed instead of running to completion.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Cancelled`] when cancellation wins the race.
    pub async fn guard<T, F>(&self, fut: F) -> Result<T, CoreError>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                out = &mut fut => return Ok(out),
                () = tokio::time::sleep(PAUSE_POLL_INTERVAL) => {
                    if self.is_cancelled() {
                        return Err(CoreError::Cancelled);
                    }
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TokenState> {
        // A poisoned token lock means a panic mid-flag-flip; the flags are
        // plain bools, so the state is still coherent.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_new_token_is_clear() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(!token.pause_requested());
    }

    #[test]
    fn test_cancel_is_idempotent_and_clears_pause() {
        let token = CancelToken::new();
        token.request_pause(None);
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
        assert!(!token.pause_requested());
    }

    #[test]
    fn test_pause_resume_cycle() {
        let token = CancelToken::new();
        token.request_pause(None);
        assert!(token.pause_requested());
        token.resume();
        assert!(!token.pause_requested());
    }

    #[test]
    fn test_pause_deadline_auto_resumes() {
        let token = CancelToken::new();
        token.request_pause(Some(Duration::from_millis(0)));
        // Deadline already elapsed; probe treats it as resume.
        assert!(!token.pause_requested());
    }

    #[test]
    fn test_cancelled_token_ignores_pause() {
        let token = CancelToken::new();
        token.cancel();
        token.request_pause(None);
        assert!(!token.pause_requested());
    }

    #[tokio::test]
    async fn test_check_errors_on_cancel() {
        let token = CancelToken::new();
        token.cancel();
        assert!(matches!(token.check().await, Err(CoreError::Cancelled)));
    }

    #[tokio::test]
    async fn test_check_passes_when_clear() {
        let token = CancelToken::new();
        assert!(token.check().await.is_ok());
    }

    #[tokio::test]
    async fn test_check_blocks_until_resume() {
        let token = CancelToken::new();
        token.request_pause(None);

        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.check().await });

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!handle.is_finished(), "check should block while paused");

        token.resume();
        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_unblocks_pause_wait() {
        let token = CancelToken::new();
        token.request_pause(None);

        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.check().await });

        tokio::time::sleep(Duration::from_millis(150)).await;
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(CoreError::Cancelled)));
    }

    #[tokio::test]
    async fn test_guard_returns_future_output() {
        let token = CancelToken::new();
        let value = token.guard(async { 42 }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_guard_aborts_on_cancel() {
        let token = CancelToken::new();
        let racer = token.clone();
        let handle = tokio::spawn(async move {
            racer
                .guard(tokio::time::sleep(Duration::from_secs(60)))
                .await
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        token.cancel();
        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(CoreError::Cancelled)));
    }

    #[tokio::test]
    async fn test_check_times_out_pause_as_resume() {
        let token = CancelToken::new();
        token.request_pause(Some(Duration::from_millis(150)));

        let start = Instant::now();
        token.check().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(100));
    }
}
