//! Generic HTTP download engine: streaming, Range resume, bounded retries.
//!
//! Transfers stream into a `.part` file next to the final path and are
//! renamed into place on success, so a completed file is never appended to
//! and an interrupted one is always resumable. Cancellation and pause both
//! keep the partial (this engine's declared policy); the pause path yields
//! the worker slot instead of blocking mid-transfer.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use futures_util::StreamExt;
use rand::Rng;
use reqwest::header::{ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_TYPE, RANGE, RETRY_AFTER};
use reqwest::{Client, Proxy, StatusCode};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use super::filename::{
    extension_from_url, filename_from_url, parse_content_disposition, resolve_unique_path,
    safe_header_filename,
};
use super::{DownloadJob, DownloadResult, Engine, EngineOutcome};
use crate::cancel::CancelToken;
use crate::error::{CoreError, ErrorKind, classify_status};
use crate::paths::verify_inside;
use crate::progress::{Phase, ProgressHandle, ProgressUpdate};
use crate::rate_limit::{RateLimiter, parse_rate_limit};
use crate::validate::sanitize_filename;

/// Transient-failure retry schedule (exponential, before jitter).
const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(8),
];

/// Maximum jitter added to each retry delay.
const MAX_JITTER: Duration = Duration::from_millis(500);

/// Connect timeout for per-job clients.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Suffix for in-flight partial files.
const PART_SUFFIX: &str = ".part";

/// The built-in streaming HTTP engine.
pub struct HttpEngine {
    client: Client,
}

impl HttpEngine {
    /// Creates the engine over a shared HTTP client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Returns the client to use for a job (proxied jobs get their own).
    fn client_for(&self, job: &DownloadJob) -> Result<Client, CoreError> {
        match &job.options.proxy {
            None => Ok(self.client.clone()),
            Some(proxy_url) => {
                let proxy = Proxy::all(proxy_url.as_str()).map_err(|e| {
                    CoreError::validation("proxy", format!("rejected by HTTP client: {e}"))
                })?;
                Client::builder()
                    .proxy(proxy)
                    .connect_timeout(CONNECT_TIMEOUT)
                    .build()
                    .map_err(|e| CoreError::internal(format!("client build failed: {e}")))
            }
        }
    }

    /// One attempt: probe resume state, request, stream, finalize.
    #[allow(clippy::too_many_lines)]
    async fn attempt(
        &self,
        client: &Client,
        job: &DownloadJob,
        limiter: Option<&Arc<RateLimiter>>,
        progress: &ProgressHandle,
        cancel: &CancelToken,
    ) -> Result<EngineOutcome, CoreError> {
        let url = &job.media_url;

        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        if cancel.pause_requested() {
            return Ok(EngineOutcome::Paused { bytes_done: 0 });
        }

        let target_name = self.target_filename(job)?;
        let part_path = job
            .output_dir
            .join(format!("{target_name}{PART_SUFFIX}"));
        verify_inside(&part_path, &job.output_dir)?;

        // Resume probe: an existing .part plus server range support.
        let existing_bytes = tokio::fs::metadata(&part_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        let try_resume = existing_bytes > 0 && self.server_supports_ranges(client, url).await;

        let mut request = client.get(url.clone());
        if try_resume {
            request = request.header(RANGE, format!("bytes={existing_bytes}-"));
            debug!(existing_bytes, "attempting range resume");
        }

        let response = cancel.guard(request.send()).await?.map_err(|e| {
            if e.is_timeout() {
                CoreError::transient(url.as_str(), "request timed out")
            } else {
                CoreError::transient(url.as_str(), e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(error_for_status(url.as_str(), &response));
        }

        self.reject_unsafe_content_type(job, &response)?;

        let resumed = try_resume && status == StatusCode::PARTIAL_CONTENT;
        let base_bytes = if resumed { existing_bytes } else { 0 };
        let total = response
            .content_length()
            .map(|len| len.saturating_add(base_bytes))
            .or(job.metadata.content_length);

        // Prefer the GET response's own Content-Disposition for the final
        // name; it is the most authoritative source the server offers.
        let response_name = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_disposition);
        let final_name = match response_name {
            Some(raw) => safe_header_filename(&raw)?,
            None => target_name.clone(),
        };

        let mut file = if resumed {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(&part_path)
                .await
                .map_err(|e| CoreError::io(part_path.clone(), e))?
        } else {
            tokio::fs::File::create(&part_path)
                .await
                .map_err(|e| CoreError::io(part_path.clone(), e))?
        };

        let mut bytes_done = base_bytes;
        let mut attempt_bytes = 0u64;
        let started = Instant::now();
        let mut stream = response.bytes_stream();

        loop {
            if cancel.is_cancelled() {
                // Policy: the partial stays for Range resume on retry.
                let _ = file.flush().await;
                info!(bytes_done, "transfer cancelled, partial kept");
                return Err(CoreError::Cancelled);
            }
            if cancel.pause_requested() {
                let _ = file.flush().await;
                progress.report(ProgressUpdate {
                    bytes_done,
                    bytes_total: total,
                    speed_bps: None,
                    eta_seconds: None,
                    phase: Phase::Paused,
                })?;
                info!(bytes_done, "transfer paused, yielding worker slot");
                return Ok(EngineOutcome::Paused { bytes_done });
            }

            let next = match cancel.guard(stream.next()).await {
                Ok(next) => next,
                Err(cancelled) => {
                    let _ = file.flush().await;
                    info!(bytes_done, "transfer cancelled mid-read, partial kept");
                    return Err(cancelled);
                }
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk
                .map_err(|e| CoreError::transient(url.as_str(), format!("stream error: {e}")))?;

            if let Some(limiter) = limiter {
                limiter.acquire(chunk.len() as u64).await;
            }

            file.write_all(&chunk)
                .await
                .map_err(|e| CoreError::io(part_path.clone(), e))?;
            bytes_done += chunk.len() as u64;
            attempt_bytes += chunk.len() as u64;

            let elapsed = started.elapsed().as_secs_f64();
            let speed = if elapsed > 0.0 {
                Some((attempt_bytes as f64 / elapsed) as u64)
            } else {
                None
            };
            let eta = match (total, speed) {
                (Some(total), Some(speed)) if speed > 0 && bytes_done < total => {
                    Some((total - bytes_done) / speed)
                }
                _ => None,
            };
            progress.report(ProgressUpdate {
                bytes_done,
                bytes_total: total,
                speed_bps: speed,
                eta_seconds: eta,
                phase: Phase::Downloading,
            })?;
        }

        file.flush()
            .await
            .map_err(|e| CoreError::io(part_path.clone(), e))?;
        drop(file);

        if let Some(expected) = total
            && expected != bytes_done
        {
            // Short read; the partial stays so the retry can resume.
            return Err(CoreError::transient(
                url.as_str(),
                format!("incomplete body: expected {expected} bytes, got {bytes_done}"),
            ));
        }

        let final_path = self.finalize(&part_path, &job.output_dir, &final_name)?;
        info!(
            path = %final_path.display(),
            bytes = bytes_done,
            resumed,
            "download complete"
        );

        Ok(EngineOutcome::Completed(DownloadResult {
            path: final_path,
            bytes_downloaded: bytes_done,
            content_length: total,
            resumed,
        }))
    }

    /// HEAD probe for `Accept-Ranges: bytes`.
    async fn server_supports_ranges(&self, client: &Client, url: &url::Url) -> bool {
        match client.head(url.clone()).send().await {
            Ok(response) => response
                .headers()
                .get(ACCEPT_RANGES)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.eq_ignore_ascii_case("bytes")),
            Err(_) => false,
        }
    }

    /// Rejects served HTML unless the caller explicitly opted in.
    fn reject_unsafe_content_type(
        &self,
        job: &DownloadJob,
        response: &reqwest::Response,
    ) -> Result<(), CoreError> {
        let is_html = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.to_lowercase().starts_with("text/html"));
        if !is_html {
            return Ok(());
        }

        let html_extension = extension_from_url(&job.media_url)
            .is_some_and(|ext| matches!(ext.as_str(), "html" | "htm"));
        if job.options.force_generic && html_extension {
            return Ok(());
        }
        Err(CoreError::security(
            "server returned text/html for a media download",
        ))
    }

    /// Filename the transfer streams toward, before response headers refine it.
    fn target_filename(&self, job: &DownloadJob) -> Result<String, CoreError> {
        if let Some(explicit) = &job.options.filename {
            return sanitize_filename(explicit);
        }
        if let Some(suggested) = &job.metadata.suggested_filename {
            return sanitize_filename(suggested);
        }
        Ok(filename_from_url(&job.media_url))
    }

    /// Renames the finished partial to its final, collision-free path.
    fn finalize(
        &self,
        part_path: &Path,
        output_dir: &Path,
        final_name: &str,
    ) -> Result<PathBuf, CoreError> {
        let final_path = resolve_unique_path(output_dir, final_name);
        verify_inside(&final_path, output_dir)?;
        std::fs::rename(part_path, &final_path)
            .map_err(|e| CoreError::io(final_path.clone(), e))?;
        Ok(final_path)
    }
}

#[async_trait::async_trait]
impl Engine for HttpEngine {
    fn name(&self) -> &str {
        "http"
    }

    fn is_generic(&self) -> bool {
        true
    }

    fn supports(&self, job: &DownloadJob) -> bool {
        matches!(job.media_url.scheme(), "http" | "https")
    }

    #[instrument(skip(self, job, progress, cancel), fields(item_id = job.item_id, url = %job.media_url))]
    async fn download(
        &self,
        job: &DownloadJob,
        progress: &ProgressHandle,
        cancel: &CancelToken,
    ) -> Result<EngineOutcome, CoreError> {
        let client = self.client_for(job)?;
        let limiter = job
            .options
            .rate_limit
            .as_deref()
            .and_then(parse_rate_limit)
            .map(|bps| Arc::new(RateLimiter::per_second(bps)));

        let mut last_error: Option<CoreError> = None;
        for (attempt, base_delay) in std::iter::once(Duration::ZERO)
            .chain(RETRY_DELAYS.iter().copied())
            .enumerate()
        {
            if base_delay > Duration::ZERO {
                let delay = base_delay + jitter();
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying transient failure"
                );
                tokio::time::sleep(delay).await;
            }

            match self
                .attempt(&client, job, limiter.as_ref(), progress, cancel)
                .await
            {
                Ok(outcome) => return Ok(outcome),
                Err(error) if error.kind() == ErrorKind::NetworkTransient => {
                    debug!(attempt, %error, "attempt failed transiently");
                    last_error = Some(error);
                }
                Err(error) => return Err(error),
            }
        }

        Err(last_error
            .unwrap_or_else(|| CoreError::internal("retry loop ended without an error")))
    }
}

fn jitter() -> Duration {
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(0..=MAX_JITTER.as_millis() as u64))
}

/// Maps an error response to the taxonomy, honoring Retry-After on 429.
fn error_for_status(url: &str, response: &reqwest::Response) -> CoreError {
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    if let Some(delay) = retry_after {
        debug!(status, delay_secs = delay.as_secs(), "server sent Retry-After");
    }

    match classify_status(status) {
        ErrorKind::NetworkTransient => CoreError::transient(url, format!("HTTP {status}")),
        _ => CoreError::permanent(url, format!("HTTP {status}")),
    }
}

/// Parses a Retry-After value: delta-seconds or an HTTP-date.
#[must_use]
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let when = httpdate::parse_http_date(value).ok()?;
    when.duration_since(SystemTime::now()).ok()
}
