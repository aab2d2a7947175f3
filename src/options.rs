//! Per-download options, immutable once a job begins.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::CoreError;
use crate::validate::{
    sanitize_filename, validate_output_template, validate_proxy, validate_rate_limit,
};

/// Requested quality/format handling for the transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatSpec {
    /// Best available quality.
    #[default]
    Best,
    /// Audio track only.
    AudioOnly,
    /// Cap video height at the given number of pixels.
    MaxHeight(u32),
    /// Cap audio bitrate at the given kbit/s.
    MaxBitrateKbps(u32),
}

/// Inclusive-exclusive clip range in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Clip start, seconds from media start.
    pub start: u64,
    /// Clip end, seconds from media start. Must exceed `start`.
    pub end: u64,
}

/// Options captured when an item is enqueued.
///
/// Workers receive this as an immutable snapshot together with the item id;
/// nothing here changes after the job starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadOptions {
    /// Target directory (sanitized by the path guard before use).
    pub output_dir: PathBuf,
    /// Relative filename template joined under `output_dir`.
    pub output_template: String,
    /// Explicit filename override; must be a bare name.
    pub filename: Option<String>,
    /// Quality selection.
    pub format_spec: FormatSpec,
    /// Subtitle languages to fetch when available.
    pub subtitle_langs: Vec<String>,
    /// Split output on chapter markers (needs the post-processor).
    pub chapter_split: bool,
    /// Embed source metadata into the container (needs the post-processor).
    pub embed_metadata: bool,
    /// Embed the thumbnail into the container (needs the post-processor).
    pub embed_thumbnail: bool,
    /// Optional clip range.
    pub time_range: Option<TimeRange>,
    /// Treat the URL as a playlist.
    pub playlist: bool,
    /// Regex filter over playlist entry titles.
    pub playlist_filter: Option<String>,
    /// Proxy URL for this download.
    pub proxy: Option<String>,
    /// Rate limit string, e.g. `5M` or `500K`.
    pub rate_limit: Option<String>,
    /// Browser profile to read cookies from, passed through to engines.
    pub cookies_from_browser: Option<String>,
    /// Skip site-specific handlers and force the generic pipeline.
    pub force_generic: bool,
    /// Ask engines to skip sponsored segments when they can.
    pub sponsor_segments_skip: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            output_template: "%(title)s.%(ext)s".to_string(),
            filename: None,
            format_spec: FormatSpec::default(),
            subtitle_langs: Vec::new(),
            chapter_split: false,
            embed_metadata: false,
            embed_thumbnail: false,
            time_range: None,
            playlist: false,
            playlist_filter: None,
            proxy: None,
            rate_limit: None,
            cookies_from_browser: None,
            force_generic: false,
            sponsor_segments_skip: false,
        }
    }
}

impl DownloadOptions {
    /// Validates every field that can fail, fast-failing the whole set.
    ///
    /// # Errors
    ///
    /// Returns the first [`CoreError`] found; `Validation` for malformed
    /// fields, `Security` for traversal attempts.
    pub fn validate(&self) -> Result<(), CoreError> {
        validate_output_template(&self.output_template)?;

        if let Some(name) = &self.filename {
            if name.contains('/') || name.contains('\\') {
                return Err(CoreError::security("filename contains path separators"));
            }
            sanitize_filename(name)?;
        }

        if let Some(range) = &self.time_range
            && range.start >= range.end
        {
            return Err(CoreError::validation(
                "time_range",
                "start must be before end",
            ));
        }

        if let Some(filter) = &self.playlist_filter {
            regex::Regex::new(filter).map_err(|e| {
                CoreError::validation("playlist_filter", format!("invalid regex: {e}"))
            })?;
        }

        if let Some(proxy) = &self.proxy {
            validate_proxy(proxy)?;
        }

        if let Some(rate) = &self.rate_limit {
            validate_rate_limit(rate)?;
        }

        Ok(())
    }
}
