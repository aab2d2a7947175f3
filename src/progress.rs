//! Progress normalization and throttling between engines and the queue.
//!
//! Engines push raw byte counts; the reporter turns them into queue patches
//! at a bounded rate so a fast local transfer cannot flood listeners.
//! Phase changes and terminal updates always go through immediately.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::cancel::CancelToken;
use crate::error::CoreError;
use crate::queue::{ItemPatch, ItemProgress, QueueManager};

/// Maximum queue-visible updates per second per item.
const MAX_UPDATES_PER_SEC: u32 = 10;

/// Transfer phase carried with every update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Extractor/probe work before bytes move.
    Resolving,
    /// Bytes are moving.
    Downloading,
    /// Transfer is parked on a pause request.
    Paused,
    /// Post-processing after the transfer.
    Processing,
    /// Terminal; always delivered.
    Done,
}

/// One normalized progress sample from an engine.
#[derive(Debug, Clone, Copy)]
pub struct ProgressUpdate {
    /// Bytes written so far.
    pub bytes_done: u64,
    /// Expected total bytes when known.
    pub bytes_total: Option<u64>,
    /// Instantaneous transfer speed.
    pub speed_bps: Option<u64>,
    /// Estimated seconds remaining.
    pub eta_seconds: Option<u64>,
    /// Current phase.
    pub phase: Phase,
}

/// Creates per-item [`ProgressHandle`]s bound to the queue.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    queue: Arc<QueueManager>,
}

impl ProgressReporter {
    /// Creates a reporter over the authoritative queue.
    #[must_use]
    pub fn new(queue: Arc<QueueManager>) -> Self {
        Self { queue }
    }

    /// Binds a handle for one item and its cancellation token.
    #[must_use]
    pub fn handle(&self, item_id: u64, token: CancelToken) -> ProgressHandle {
        ProgressHandle {
            queue: Arc::clone(&self.queue),
            item_id,
            token,
            throttle: Mutex::new(Throttle {
                last_emit: None,
                last_phase: None,
            }),
        }
    }
}

#[derive(Debug)]
struct Throttle {
    last_emit: Option<Instant>,
    last_phase: Option<Phase>,
}

/// Per-item progress sink handed to engines.
#[derive(Debug)]
pub struct ProgressHandle {
    queue: Arc<QueueManager>,
    item_id: u64,
    token: CancelToken,
    throttle: Mutex<Throttle>,
}

impl ProgressHandle {
    /// Reports one sample; throttled except for phase changes and `Done`.
    ///
    /// Every call observes the token, so an engine that only ever reports
    /// progress still notices cancellation within one tick.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Cancelled`] once the token is cancelled.
    pub fn report(&self, update: ProgressUpdate) -> Result<(), CoreError> {
        if self.token.is_cancelled() {
            return Err(CoreError::Cancelled);
        }

        let emit = {
            let mut throttle = match self.throttle.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let phase_changed = throttle.last_phase != Some(update.phase);
            let interval = Duration::from_millis(1000 / u64::from(MAX_UPDATES_PER_SEC));
            let due = throttle
                .last_emit
                .is_none_or(|last| last.elapsed() >= interval);
            let emit = phase_changed || update.phase == Phase::Done || due;
            if emit {
                throttle.last_emit = Some(Instant::now());
                throttle.last_phase = Some(update.phase);
            }
            emit
        };

        if !emit {
            return Ok(());
        }

        let ratio = match update.bytes_total {
            Some(total) if total > 0 => (update.bytes_done as f64 / total as f64).min(1.0),
            _ => 0.0,
        };
        debug!(
            item_id = self.item_id,
            bytes_done = update.bytes_done,
            phase = ?update.phase,
            "progress"
        );
        // A missing item means the attempt raced a queue clear; drop silently.
        let _ = self.queue.apply_patch(
            self.item_id,
            ItemPatch {
                progress: Some(ItemProgress {
                    ratio,
                    bytes_done: update.bytes_done,
                    bytes_total: update.bytes_total,
                    speed_bps: update.speed_bps,
                    eta_seconds: update.eta_seconds,
                }),
                ..ItemPatch::default()
            },
        );
        Ok(())
    }

    /// The token this handle observes.
    #[must_use]
    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// The item this handle feeds.
    #[must_use]
    pub fn item_id(&self) -> u64 {
        self.item_id
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::options::DownloadOptions;

    fn setup() -> (Arc<QueueManager>, ProgressHandle, u64) {
        let queue = Arc::new(QueueManager::new(0));
        let id = queue
            .add(
                "https://example.com/a.mp4".to_string(),
                DownloadOptions::default(),
                None,
            )
            .unwrap();
        let reporter = ProgressReporter::new(Arc::clone(&queue));
        let handle = reporter.handle(id, CancelToken::new());
        (queue, handle, id)
    }

    fn sample(bytes: u64, phase: Phase) -> ProgressUpdate {
        ProgressUpdate {
            bytes_done: bytes,
            bytes_total: Some(1000),
            speed_bps: Some(512),
            eta_seconds: Some(1),
            phase,
        }
    }

    #[test]
    fn test_report_updates_queue_progress() {
        let (queue, handle, id) = setup();
        handle.report(sample(250, Phase::Downloading)).unwrap();

        let item = queue.get(id).unwrap();
        assert_eq!(item.progress.bytes_done, 250);
        assert!((item.progress.ratio - 0.25).abs() < 1e-9);
        assert_eq!(item.progress.speed_bps, Some(512));
    }

    #[test]
    fn test_same_phase_updates_are_throttled() {
        let (queue, handle, id) = setup();
        handle.report(sample(100, Phase::Downloading)).unwrap();
        // Immediately after: same phase, inside the throttle window.
        handle.report(sample(200, Phase::Downloading)).unwrap();

        let item = queue.get(id).unwrap();
        assert_eq!(item.progress.bytes_done, 100, "second sample suppressed");
    }

    #[test]
    fn test_phase_change_bypasses_throttle() {
        let (queue, handle, id) = setup();
        handle.report(sample(100, Phase::Downloading)).unwrap();
        handle.report(sample(1000, Phase::Done)).unwrap();

        let item = queue.get(id).unwrap();
        assert_eq!(item.progress.bytes_done, 1000);
        assert!((item.progress.ratio - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_report_errors_after_cancel() {
        let (_queue, handle, _id) = setup();
        handle.token().cancel();
        let err = handle.report(sample(1, Phase::Downloading)).unwrap_err();
        assert!(matches!(err, CoreError::Cancelled));
    }

    #[test]
    fn test_unknown_total_reports_zero_ratio() {
        let (queue, handle, id) = setup();
        handle
            .report(ProgressUpdate {
                bytes_done: 123,
                bytes_total: None,
                speed_bps: None,
                eta_seconds: None,
                phase: Phase::Downloading,
            })
            .unwrap();
        let item = queue.get(id).unwrap();
        assert_eq!(item.progress.ratio, 0.0);
        assert_eq!(item.progress.bytes_done, 123);
    }
}
