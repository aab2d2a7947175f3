//! Queue item types, status machine, and the legal-transition table.

use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::options::DownloadOptions;

/// Status of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting for its scheduled start time.
    Scheduled,
    /// Ready to be claimed by the scheduler.
    Queued,
    /// Claimed atomically; a worker is being assigned.
    Allocating,
    /// Bytes are moving.
    Downloading,
    /// Post-processing after a successful transfer.
    Processing,
    /// Parked; holds no worker slot.
    Paused,
    /// Finished successfully. Terminal.
    Completed,
    /// Cancelled cooperatively. Terminal.
    Cancelled,
    /// Failed. Terminal.
    Error,
}

impl QueueStatus {
    /// Returns the wire/display representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Queued => "queued",
            Self::Allocating => "allocating",
            Self::Downloading => "downloading",
            Self::Processing => "processing",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }

    /// Returns whether the status is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Error)
    }

    /// Returns whether a worker is associated with the item in this status.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Allocating | Self::Downloading | Self::Processing)
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "queued" => Ok(Self::Queued),
            "allocating" => Ok(Self::Allocating),
            "downloading" => Ok(Self::Downloading),
            "processing" => Ok(Self::Processing),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "error" => Ok(Self::Error),
            _ => Err(format!("invalid queue status: {s}")),
        }
    }
}

/// Returns whether `from → to` is a legal transition.
///
/// Terminal statuses may only be left through `retry_item`, which the queue
/// special-cases; this table covers everything else.
#[must_use]
pub fn is_valid_transition(from: QueueStatus, to: QueueStatus) -> bool {
    use QueueStatus as S;
    matches!(
        (from, to),
        (S::Scheduled, S::Queued)
            | (S::Queued, S::Allocating | S::Paused | S::Cancelled | S::Scheduled)
            | (S::Allocating, S::Downloading | S::Cancelled | S::Error)
            | (S::Downloading, S::Processing | S::Paused | S::Cancelled | S::Error)
            | (S::Processing, S::Completed | S::Cancelled | S::Error)
            | (S::Paused, S::Queued | S::Cancelled)
    )
}

/// Where the item's metadata came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    /// A dedicated site handler.
    Site,
    /// The public-page scraper.
    PublicPage,
    /// The generic HTTP probe.
    Generic,
}

/// Metadata snapshot attached after extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataSnapshot {
    /// Media title.
    pub title: Option<String>,
    /// Media duration in seconds.
    pub duration_seconds: Option<u64>,
    /// Thumbnail URL.
    pub thumbnail_url: Option<String>,
    /// Which extractor produced this snapshot.
    pub source_kind: SourceKind,
    /// The URL the engine should actually fetch.
    pub media_url: String,
    /// Filename suggested by headers or page context, already sanitized.
    pub suggested_filename: Option<String>,
    /// Expected size when the probe learned it.
    pub content_length: Option<u64>,
}

/// Live progress for the current attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemProgress {
    /// Fraction complete, monotone within one attempt.
    pub ratio: f64,
    /// Bytes written so far.
    pub bytes_done: u64,
    /// Expected total bytes when known.
    pub bytes_total: Option<u64>,
    /// Smoothed transfer speed.
    pub speed_bps: Option<u64>,
    /// Estimated seconds remaining.
    pub eta_seconds: Option<u64>,
}

/// One entry in the download queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    /// Opaque stable identifier.
    pub id: u64,
    /// The validated input URL.
    pub url: String,
    /// Options snapshot, immutable once a job begins.
    pub options: DownloadOptions,
    /// Start-no-earlier-than instant; the item sits in `Scheduled` until then.
    pub scheduled_at: Option<SystemTime>,
    /// Current status.
    pub status: QueueStatus,
    /// Progress of the current attempt.
    pub progress: ItemProgress,
    /// Final saved path on completion.
    pub filepath: Option<PathBuf>,
    /// Sanitized user-facing error text.
    pub error_message: Option<String>,
    /// Queue-level retry count.
    pub retry_count: u32,
    /// When the item reached its current terminal status.
    pub final_status_time: Option<SystemTime>,
    /// Metadata captured by the extractor.
    pub metadata: Option<MetadataSnapshot>,
}

impl QueueItem {
    /// Creates a new item; `Scheduled` iff `scheduled_at` is in the future.
    #[must_use]
    pub fn new(
        id: u64,
        url: String,
        options: DownloadOptions,
        scheduled_at: Option<SystemTime>,
    ) -> Self {
        let status = match scheduled_at {
            Some(at) if at > SystemTime::now() => QueueStatus::Scheduled,
            _ => QueueStatus::Queued,
        };
        Self {
            id,
            url,
            options,
            scheduled_at,
            status,
            progress: ItemProgress::default(),
            filepath: None,
            error_message: None,
            retry_count: 0,
            final_status_time: None,
            metadata: None,
        }
    }
}

impl fmt::Display for QueueItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QueueItem {{ id: {}, url: {}, status: {} }}",
            self.id, self.url, self.status
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_status_round_trip() {
        for status in [
            QueueStatus::Scheduled,
            QueueStatus::Queued,
            QueueStatus::Allocating,
            QueueStatus::Downloading,
            QueueStatus::Processing,
            QueueStatus::Paused,
            QueueStatus::Completed,
            QueueStatus::Cancelled,
            QueueStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<QueueStatus>().unwrap(), status);
        }
        assert!("pending".parse::<QueueStatus>().is_err());
    }

    #[test]
    fn test_status_serde_matches_as_str() {
        let json = serde_json::to_string(&QueueStatus::Downloading).unwrap();
        assert_eq!(json, "\"downloading\"");
        let parsed: QueueStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, QueueStatus::Downloading);
    }

    #[test]
    fn test_terminal_and_active_flags() {
        assert!(QueueStatus::Completed.is_terminal());
        assert!(QueueStatus::Cancelled.is_terminal());
        assert!(QueueStatus::Error.is_terminal());
        assert!(!QueueStatus::Paused.is_terminal());

        assert!(QueueStatus::Downloading.is_active());
        assert!(QueueStatus::Allocating.is_active());
        assert!(!QueueStatus::Paused.is_active());
        assert!(!QueueStatus::Queued.is_active());
    }

    #[test]
    fn test_transition_table_allows_documented_paths() {
        use QueueStatus as S;
        for (from, to) in [
            (S::Scheduled, S::Queued),
            (S::Queued, S::Allocating),
            (S::Queued, S::Paused),
            (S::Queued, S::Cancelled),
            (S::Queued, S::Scheduled),
            (S::Allocating, S::Downloading),
            (S::Allocating, S::Cancelled),
            (S::Allocating, S::Error),
            (S::Downloading, S::Processing),
            (S::Downloading, S::Paused),
            (S::Downloading, S::Cancelled),
            (S::Downloading, S::Error),
            (S::Processing, S::Completed),
            (S::Processing, S::Cancelled),
            (S::Processing, S::Error),
            (S::Paused, S::Queued),
            (S::Paused, S::Cancelled),
        ] {
            assert!(is_valid_transition(from, to), "{from} -> {to}");
        }
    }

    #[test]
    fn test_transition_table_rejects_everything_else() {
        use QueueStatus as S;
        for (from, to) in [
            (S::Scheduled, S::Downloading),
            (S::Queued, S::Downloading),
            (S::Queued, S::Completed),
            (S::Allocating, S::Queued),
            (S::Downloading, S::Queued),
            (S::Paused, S::Downloading),
            (S::Completed, S::Queued),
            (S::Cancelled, S::Queued),
            (S::Error, S::Queued),
            (S::Completed, S::Error),
            (S::Downloading, S::Downloading),
        ] {
            assert!(!is_valid_transition(from, to), "{from} -> {to}");
        }
    }

    #[test]
    fn test_new_item_scheduled_iff_future() {
        let future = SystemTime::now() + Duration::from_secs(60);
        let item = QueueItem::new(
            1,
            "https://example.com/a.mp4".to_string(),
            DownloadOptions::default(),
            Some(future),
        );
        assert_eq!(item.status, QueueStatus::Scheduled);

        let past = SystemTime::now() - Duration::from_secs(60);
        let item = QueueItem::new(
            2,
            "https://example.com/b.mp4".to_string(),
            DownloadOptions::default(),
            Some(past),
        );
        assert_eq!(item.status, QueueStatus::Queued);

        let item = QueueItem::new(
            3,
            "https://example.com/c.mp4".to_string(),
            DownloadOptions::default(),
            None,
        );
        assert_eq!(item.status, QueueStatus::Queued);
    }

    #[test]
    fn test_item_display() {
        let item = QueueItem::new(
            42,
            "https://example.com/file.mp4".to_string(),
            DownloadOptions::default(),
            None,
        );
        let display = item.to_string();
        assert!(display.contains("42"));
        assert!(display.contains("example.com"));
        assert!(display.contains("queued"));
    }
}
