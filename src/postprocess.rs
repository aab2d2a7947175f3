//! Optional media post-processing through an external tool.
//!
//! Clip extraction and metadata/thumbnail embedding shell out to `ffmpeg`
//! when it is on PATH. A missing binary degrades every post step to a
//! logged no-op; it never fails the download.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::error::CoreError;
use crate::options::DownloadOptions;
use crate::queue::MetadataSnapshot;

/// Binary names probed on PATH.
const BINARY_NAMES: [&str; 2] = ["ffmpeg", "ffmpeg.exe"];

/// Post-processor wrapper; holds the tool path when one was found.
#[derive(Debug, Clone, Default)]
pub struct PostProcessor {
    binary: Option<PathBuf>,
}

impl PostProcessor {
    /// Probes PATH for the media tool.
    #[must_use]
    pub fn from_path() -> Self {
        let Some(path_var) = std::env::var_os("PATH") else {
            return Self::default();
        };
        for dir in std::env::split_paths(&path_var) {
            for name in BINARY_NAMES {
                let candidate = dir.join(name);
                if candidate.is_file() {
                    debug!(binary = %candidate.display(), "post-processor found");
                    return Self {
                        binary: Some(candidate),
                    };
                }
            }
        }
        Self::default()
    }

    /// Creates a processor with an explicit binary (tests, config).
    #[must_use]
    pub fn with_binary(binary: Option<PathBuf>) -> Self {
        Self { binary }
    }

    /// Returns whether any post step in `options` would actually run.
    #[must_use]
    pub fn wants_processing(options: &DownloadOptions) -> bool {
        options.time_range.is_some()
            || options.embed_metadata
            || options.embed_thumbnail
            || options.chapter_split
    }

    /// Applies the requested post steps to `path`, in place.
    ///
    /// Missing tool or missing inputs (no chapters, no title) degrade with
    /// a warning. Only real tool failures surface as errors.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Internal`] when the tool exits non-zero.
    #[instrument(skip(self, options, metadata), fields(path = %path.display()))]
    pub async fn apply(
        &self,
        path: &Path,
        options: &DownloadOptions,
        metadata: Option<&MetadataSnapshot>,
    ) -> Result<(), CoreError> {
        if !Self::wants_processing(options) {
            return Ok(());
        }
        let Some(binary) = &self.binary else {
            warn!("post-processing requested but no media tool found; skipping");
            return Ok(());
        };

        if let Some(range) = &options.time_range {
            self.run_in_place(binary, path, |input, output| {
                vec![
                    "-y".to_string(),
                    "-i".to_string(),
                    input.display().to_string(),
                    "-ss".to_string(),
                    range.start.to_string(),
                    "-to".to_string(),
                    range.end.to_string(),
                    "-c".to_string(),
                    "copy".to_string(),
                    output.display().to_string(),
                ]
            })
            .await?;
            info!(start = range.start, end = range.end, "clip extracted");
        }

        if options.embed_metadata {
            match metadata.and_then(|m| m.title.as_deref()) {
                Some(title) => {
                    let title = title.to_string();
                    self.run_in_place(binary, path, |input, output| {
                        vec![
                            "-y".to_string(),
                            "-i".to_string(),
                            input.display().to_string(),
                            "-metadata".to_string(),
                            format!("title={title}"),
                            "-c".to_string(),
                            "copy".to_string(),
                            output.display().to_string(),
                        ]
                    })
                    .await?;
                    info!("metadata embedded");
                }
                None => warn!("embed_metadata requested but no title available; skipping"),
            }
        }

        if options.embed_thumbnail {
            warn!("thumbnail embedding requires a fetched thumbnail; skipping");
        }
        if options.chapter_split {
            warn!("chapter split requires chapter markers; skipping");
        }
        Ok(())
    }

    /// Runs the tool writing to a sibling temp file, then renames over.
    async fn run_in_place<F>(
        &self,
        binary: &Path,
        path: &Path,
        build_args: F,
    ) -> Result<(), CoreError>
    where
        F: FnOnce(&Path, &Path) -> Vec<String>,
    {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("mp4");
        let output = path.with_extension(format!("pp.{extension}"));

        let args = build_args(path, &output);
        let status = Command::new(binary)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| CoreError::internal(format!("post-processor spawn failed: {e}")))?;

        if !status.success() {
            let _ = tokio::fs::remove_file(&output).await;
            return Err(CoreError::internal(format!(
                "post-processor exited with {status}"
            )));
        }

        tokio::fs::rename(&output, path)
            .await
            .map_err(|e| CoreError::io(path.to_path_buf(), e))?;
        Ok(())
    }
}
