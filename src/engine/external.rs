//! Optional accelerated-transfer engine backed by an external binary.
//!
//! When `aria2c` is on PATH it is registered ahead of the HTTP engine and
//! used for plain direct-file transfers. Its absence is never an error; the
//! registry simply skips registration. Partial-file policy for this engine:
//! cancellation deletes partials (the tool owns its own resume state and a
//! half-written control file is worthless to us).

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use super::filename::{filename_from_url, resolve_unique_path};
use super::{DownloadJob, DownloadResult, Engine, EngineOutcome};
use crate::cancel::CancelToken;
use crate::error::CoreError;
use crate::paths::verify_inside;
use crate::progress::{Phase, ProgressHandle, ProgressUpdate};
use crate::validate::sanitize_filename;

/// Poll interval while waiting on the child process.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Binary names probed on PATH, in order.
const BINARY_NAMES: [&str; 2] = ["aria2c", "aria2c.exe"];

/// Engine that shells out to an external transfer tool.
pub struct ExternalEngine {
    binary: PathBuf,
}

impl ExternalEngine {
    /// Probes PATH for a known transfer binary; `None` when absent.
    #[must_use]
    pub fn from_path() -> Option<Self> {
        let path_var = std::env::var_os("PATH")?;
        for dir in std::env::split_paths(&path_var) {
            for name in BINARY_NAMES {
                let candidate = dir.join(name);
                if candidate.is_file() {
                    debug!(binary = %candidate.display(), "external transfer binary found");
                    return Some(Self { binary: candidate });
                }
            }
        }
        None
    }

    /// Creates the engine over an explicit binary path (tests, config).
    #[must_use]
    pub fn with_binary(binary: PathBuf) -> Self {
        Self { binary }
    }

    fn output_filename(job: &DownloadJob) -> Result<String, CoreError> {
        if let Some(explicit) = &job.options.filename {
            return sanitize_filename(explicit);
        }
        if let Some(suggested) = &job.metadata.suggested_filename {
            return sanitize_filename(suggested);
        }
        Ok(filename_from_url(&job.media_url))
    }
}

#[async_trait::async_trait]
impl Engine for ExternalEngine {
    fn name(&self) -> &str {
        "external"
    }

    fn supports(&self, job: &DownloadJob) -> bool {
        // Direct-file transfers only; anything needing header finesse or
        // HTML opt-ins goes to the HTTP engine.
        matches!(job.media_url.scheme(), "http" | "https") && !job.options.force_generic
    }

    #[instrument(skip(self, job, progress, cancel), fields(item_id = job.item_id, url = %job.media_url))]
    async fn download(
        &self,
        job: &DownloadJob,
        progress: &ProgressHandle,
        cancel: &CancelToken,
    ) -> Result<EngineOutcome, CoreError> {
        let filename = Self::output_filename(job)?;
        let final_path = resolve_unique_path(&job.output_dir, &filename);
        verify_inside(&final_path, &job.output_dir)?;
        let Some(final_name) = final_path.file_name().and_then(|n| n.to_str()) else {
            return Err(CoreError::internal("resolved path has no filename"));
        };

        let mut command = Command::new(&self.binary);
        command
            .arg(format!("--dir={}", job.output_dir.display()))
            .arg(format!("--out={final_name}"))
            .arg("--auto-file-renaming=false")
            .arg("--allow-overwrite=false")
            .arg("--quiet=true");
        if let Some(proxy) = &job.options.proxy {
            command.arg(format!("--all-proxy={proxy}"));
        }
        if let Some(rate) = &job.options.rate_limit {
            command.arg(format!("--max-download-limit={rate}"));
        }
        command.arg(job.media_url.as_str());
        command.stdout(Stdio::null()).stderr(Stdio::null());

        let mut child = command
            .spawn()
            .map_err(|e| CoreError::internal(format!("failed to spawn transfer binary: {e}")))?;

        progress.report(ProgressUpdate {
            bytes_done: 0,
            bytes_total: job.metadata.content_length,
            speed_bps: None,
            eta_seconds: None,
            phase: Phase::Downloading,
        })?;

        // Mid-transfer pause is not supported here; the tool owns the
        // connection. Queue-level pause still keeps unclaimed items parked.
        let status = loop {
            tokio::select! {
                status = child.wait() => {
                    break status.map_err(|e| {
                        CoreError::internal(format!("transfer binary wait failed: {e}"))
                    })?;
                }
                () = tokio::time::sleep(POLL_INTERVAL) => {
                    if cancel.is_cancelled() {
                        warn!("cancelling external transfer");
                        let _ = child.kill().await;
                        cleanup_partials(&final_path);
                        return Err(CoreError::Cancelled);
                    }
                }
            }
        };

        if !status.success() {
            cleanup_partials(&final_path);
            return Err(CoreError::transient(
                job.media_url.as_str(),
                format!("transfer binary exited with {status}"),
            ));
        }

        let bytes_downloaded = tokio::fs::metadata(&final_path)
            .await
            .map(|m| m.len())
            .map_err(|e| CoreError::io(final_path.clone(), e))?;

        progress.report(ProgressUpdate {
            bytes_done: bytes_downloaded,
            bytes_total: Some(bytes_downloaded),
            speed_bps: None,
            eta_seconds: None,
            phase: Phase::Done,
        })?;

        info!(path = %final_path.display(), bytes = bytes_downloaded, "external transfer complete");
        Ok(EngineOutcome::Completed(DownloadResult {
            path: final_path,
            bytes_downloaded,
            content_length: job.metadata.content_length,
            resumed: false,
        }))
    }
}

/// Removes the target and the tool's control file after a cancel/failure.
fn cleanup_partials(final_path: &Path) {
    let _ = std::fs::remove_file(final_path);
    let control = final_path.with_extension(format!(
        "{}.aria2",
        final_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
    ));
    let _ = std::fs::remove_file(control);
}
