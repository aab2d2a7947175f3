//! Top-level execution of a single queue item.
//!
//! [`Core`] is the context value that replaces every would-be singleton:
//! constructed once at startup, handed to the scheduler, and cloned into
//! workers. Tests build their own.
//!
//! [`DownloadCore::run`] walks one claimed item through validation, path
//! hardening, extraction, engine dispatch, post-processing, and the history
//! write. It owns every status transition after `Allocating` and never lets
//! an engine failure take the worker down.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, instrument, warn};
use url::Url;

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::engine::{DownloadJob, EngineOutcome, EngineRegistry, filename::extension_from_url};
use crate::error::{CoreError, ErrorKind};
use crate::extract::ExtractorRegistry;
use crate::history::{HistoryStatus, HistoryStore, NewHistoryEntry};
use crate::options::DownloadOptions;
use crate::paths::{check_disk_space, sanitize_output_dir, verify_inside};
use crate::postprocess::PostProcessor;
use crate::progress::ProgressReporter;
use crate::queue::{ItemPatch, ItemProgress, QueueItem, QueueManager, QueueStatus};
use crate::validate::{ensure_resolves_public, validate_url_with_policy};

/// Shared context for the scheduler and its workers.
#[derive(Debug)]
pub struct Core {
    /// Authoritative queue.
    pub queue: Arc<QueueManager>,
    /// Durable outcome log.
    pub history: Arc<HistoryStore>,
    /// Metadata extractors.
    pub extractors: Arc<ExtractorRegistry>,
    /// Download engines.
    pub engines: Arc<EngineRegistry>,
    /// Progress plumbing.
    pub reporter: ProgressReporter,
    /// Optional media post-processor.
    pub postprocessor: Arc<PostProcessor>,
    /// Validated configuration snapshot.
    pub config: Config,
}

impl Core {
    /// Assembles a context from its parts.
    #[must_use]
    pub fn new(
        queue: Arc<QueueManager>,
        history: Arc<HistoryStore>,
        extractors: Arc<ExtractorRegistry>,
        engines: Arc<EngineRegistry>,
        postprocessor: Arc<PostProcessor>,
        config: Config,
    ) -> Self {
        let reporter = ProgressReporter::new(Arc::clone(&queue));
        Self {
            queue,
            history,
            extractors,
            engines,
            reporter,
            postprocessor,
            config,
        }
    }
}

/// How one worker invocation ended, for scheduler bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Item completed.
    Completed,
    /// Item reached `Error`.
    Failed,
    /// Item reached `Cancelled`.
    Cancelled,
    /// Engine yielded on pause; item is `Paused`.
    Paused,
    /// The item vanished mid-run (cleared queue); nothing to do.
    Gone,
}

/// Executes one claimed item end-to-end.
pub struct DownloadCore;

impl DownloadCore {
    /// Runs the item with `id` through the full pipeline.
    ///
    /// The item must have been claimed (`Allocating`). All failure paths
    /// transition the item and write history; the returned outcome is for
    /// logging and scheduler accounting only.
    #[instrument(skip(core, token), fields(item_id = id))]
    pub async fn run(core: &Core, id: u64, token: CancelToken) -> WorkerOutcome {
        let Some(item) = core.queue.get(id) else {
            warn!("claimed item disappeared before start");
            return WorkerOutcome::Gone;
        };

        match Self::execute(core, &item, &token).await {
            Ok(EngineOutcome::Completed(_)) => WorkerOutcome::Completed,
            Ok(EngineOutcome::Paused { .. }) => {
                Self::park_paused(core, id);
                WorkerOutcome::Paused
            }
            Err(error) if error.kind() == ErrorKind::Cancelled => {
                Self::finish_cancelled(core, &item).await;
                WorkerOutcome::Cancelled
            }
            Err(error) => {
                Self::finish_failed(core, &item, &error).await;
                WorkerOutcome::Failed
            }
        }
    }

    /// The happy-path pipeline; any error is mapped by the caller.
    async fn execute(
        core: &Core,
        item: &QueueItem,
        token: &CancelToken,
    ) -> Result<EngineOutcome, CoreError> {
        // 1. Fast-fail validation, before any network traffic.
        let allow_private = core.config.allow_local_network;
        let url = validate_url_with_policy(&item.url, allow_private)?;
        item.options.validate()?;
        if !allow_private {
            ensure_resolves_public(&url).await?;
        }
        token.check().await?;

        // 2. Output directory hardening.
        let out = sanitize_output_dir(&item.options.output_dir)?;
        if out.fell_back_to_temp {
            warn!(item_id = item.id, "output directory unusable; using temp dir");
        }
        let space = check_disk_space(&out.path, item.metadata_size_hint())?;
        if !space.ok {
            return Err(CoreError::resource(format!(
                "insufficient disk space ({} bytes free)",
                space.free_bytes
            )));
        }

        // 3. Metadata extraction.
        let metadata = core.extractors.extract(&url, &item.options).await?;
        core.queue.apply_patch(
            item.id,
            ItemPatch {
                metadata: Some(metadata.clone()),
                ..ItemPatch::default()
            },
        )?;

        // The media endpoint gets the same scrutiny as the input URL; a
        // scraped page must not redirect the engine into private space.
        let media_url = validate_url_with_policy(&metadata.media_url, allow_private)?;
        if !allow_private {
            ensure_resolves_public(&media_url).await?;
        }
        token.check().await?;

        // 4. Engine selection over the rendered job.
        let (job_dir, preferred_name) =
            render_output_template(&out.path, &item.options, &metadata, &media_url)?;
        let mut options = item.options.clone();
        if options.filename.is_none() {
            options.filename = preferred_name;
        }
        if options.proxy.is_none() {
            options.proxy.clone_from(&core.config.proxy);
        }
        if options.rate_limit.is_none() {
            options.rate_limit.clone_from(&core.config.rate_limit);
        }
        let job = DownloadJob {
            item_id: item.id,
            media_url,
            original_url: item.url.clone(),
            options,
            output_dir: job_dir,
            metadata: metadata.clone(),
        };
        let engine = core.engines.select(&job)?;
        info!(engine = engine.name(), "engine selected");

        // 5. Transfer.
        core.queue
            .update_status(item.id, QueueStatus::Downloading, ItemPatch::default())?;
        let handle = core.reporter.handle(item.id, token.clone());
        let outcome = engine.download(&job, &handle, token).await?;

        let EngineOutcome::Completed(result) = outcome else {
            return Ok(outcome);
        };

        // 6. Post-steps under `Processing`, then containment re-check.
        core.queue
            .update_status(item.id, QueueStatus::Processing, ItemPatch::default())?;
        token.check().await?;
        core.postprocessor
            .apply(&result.path, &job.options, Some(&metadata))
            .await?;
        verify_inside(&result.path, &out.path)?;

        let final_size = tokio::fs::metadata(&result.path)
            .await
            .map(|m| m.len())
            .unwrap_or(result.bytes_downloaded);
        core.queue.update_status(
            item.id,
            QueueStatus::Completed,
            ItemPatch {
                filepath: Some(result.path.clone()),
                progress: Some(ItemProgress {
                    ratio: 1.0,
                    bytes_done: final_size,
                    bytes_total: Some(final_size),
                    speed_bps: None,
                    eta_seconds: None,
                }),
                ..ItemPatch::default()
            },
        )?;

        // 7. History.
        let entry = NewHistoryEntry {
            url: &item.url,
            title: metadata.title.as_deref(),
            output_path: result.path.to_str(),
            status: HistoryStatus::Completed,
            size_bytes: i64::try_from(final_size).ok(),
            duration_seconds: metadata
                .duration_seconds
                .and_then(|d| i64::try_from(d).ok()),
            error: None,
        };
        if let Err(e) = core.history.add(&entry).await {
            // History failures must not undo a finished download.
            error!(error = %e, "failed to record history entry");
        }

        Ok(EngineOutcome::Completed(result))
    }

    fn park_paused(core: &Core, id: u64) {
        if let Err(e) = core
            .queue
            .update_status(id, QueueStatus::Paused, ItemPatch::default())
        {
            warn!(item_id = id, error = %e, "could not park paused item");
        }
    }

    async fn finish_cancelled(core: &Core, item: &QueueItem) {
        if let Err(e) =
            core.queue
                .update_status(item.id, QueueStatus::Cancelled, ItemPatch::default())
        {
            warn!(item_id = item.id, error = %e, "could not mark item cancelled");
        }
        let entry = NewHistoryEntry {
            url: &item.url,
            title: item.metadata.as_ref().and_then(|m| m.title.as_deref()),
            output_path: None,
            status: HistoryStatus::Cancelled,
            size_bytes: None,
            duration_seconds: None,
            error: None,
        };
        if let Err(e) = core.history.add(&entry).await {
            error!(error = %e, "failed to record cancelled history entry");
        }
    }

    async fn finish_failed(core: &Core, item: &QueueItem, failure: &CoreError) {
        let message = failure.user_message();
        warn!(item_id = item.id, kind = ?failure.kind(), %message, "item failed");
        if let Err(e) = core.queue.update_status(
            item.id,
            QueueStatus::Error,
            ItemPatch {
                error_message: Some(message.clone()),
                ..ItemPatch::default()
            },
        ) {
            warn!(item_id = item.id, error = %e, "could not mark item failed");
        }
        let entry = NewHistoryEntry {
            url: &item.url,
            title: item.metadata.as_ref().and_then(|m| m.title.as_deref()),
            output_path: None,
            status: HistoryStatus::Error,
            size_bytes: None,
            duration_seconds: None,
            error: Some(&message),
        };
        if let Err(e) = core.history.add(&entry).await {
            error!(error = %e, "failed to record failed history entry");
        }
    }
}

impl QueueItem {
    /// Size hint for the disk-space check, when extraction ran early.
    fn metadata_size_hint(&self) -> u64 {
        self.metadata
            .as_ref()
            .and_then(|m| m.content_length)
            .unwrap_or(0)
    }
}

/// Renders `output_template` into (directory, filename) under `out`.
///
/// Supported tokens: `%(title)s` and `%(ext)s`. The rendered relative path
/// may add subdirectories; containment is verified before use. A template
/// left at its default with no title available falls back to header/URL
/// naming (`None` filename).
fn render_output_template(
    out: &std::path::Path,
    options: &DownloadOptions,
    metadata: &crate::queue::MetadataSnapshot,
    media_url: &Url,
) -> Result<(PathBuf, Option<String>), CoreError> {
    let ext = metadata
        .suggested_filename
        .as_deref()
        .and_then(|name| name.rsplit_once('.').map(|(_, e)| e.to_string()))
        .or_else(|| extension_from_url(media_url))
        .unwrap_or_else(|| "bin".to_string());

    let title = metadata.title.as_deref();
    if options.output_template == DownloadOptions::default().output_template && title.is_none() {
        return Ok((out.to_path_buf(), None));
    }

    let rendered = options
        .output_template
        .replace("%(title)s", title.unwrap_or("download"))
        .replace("%(ext)s", &ext);

    let relative = std::path::Path::new(&rendered);
    let filename = relative
        .file_name()
        .and_then(|n| n.to_str())
        .map(crate::validate::sanitize_filename)
        .transpose()?;

    let dir = match relative.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            let dir = out.join(parent);
            std::fs::create_dir_all(&dir).map_err(|e| CoreError::io(dir.clone(), e))?;
            verify_inside(&dir, out)?;
            dir
        }
        _ => out.to_path_buf(),
    };

    Ok((dir, filename))
}
