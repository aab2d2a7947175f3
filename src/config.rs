//! Application configuration: the scalars the core reads, JSON on disk.
//!
//! Saves are crash-safe: the new document is written to a sibling temp
//! file, fsynced, then renamed over the old one, so a reader never sees a
//! truncated mix of old and new.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::instrument;

use crate::error::CoreError;
use crate::validate::{validate_proxy, validate_rate_limit};

/// Default worker-pool size.
pub const DEFAULT_MAX_CONCURRENT: usize = 3;

/// Hard ceiling for the worker pool.
pub const MAX_CONCURRENT_CEILING: usize = 32;

/// Errors from config load/save.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Filesystem failure.
    #[error("config IO error at {path}: {source}")]
    Io {
        /// The file involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file exists but is not valid JSON for this schema.
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Validated scalars consumed by the core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Worker-pool size, clamped to `1..=32`.
    pub max_concurrent_downloads: usize,
    /// Default output directory for new items.
    pub default_output_dir: PathBuf,
    /// Global proxy, applied when an item has none.
    pub proxy: Option<String>,
    /// Global rate limit string, applied when an item has none.
    pub rate_limit: Option<String>,
    /// Queue capacity.
    pub queue_size_limit: usize,
    /// Pause auto-expiry in seconds.
    pub pause_timeout_secs: u64,
    /// Permit downloads from loopback/private addresses (LAN media
    /// servers). Off by default; the SSRF guard applies when false.
    pub allow_local_network: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT,
            default_output_dir: PathBuf::from("downloads"),
            proxy: None,
            rate_limit: None,
            queue_size_limit: crate::queue::DEFAULT_QUEUE_SIZE_LIMIT,
            pause_timeout_secs: 3600,
            allow_local_network: false,
        }
    }
}

impl Config {
    /// Loads the config; a missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] for unreadable files and
    /// [`ConfigError::Parse`] for malformed JSON.
    #[instrument]
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
        };
        Ok(serde_json::from_str(&raw)?)
    }

    /// Saves atomically: temp file, fsync, rename.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] or [`ConfigError::Parse`].
    #[instrument(skip(self))]
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;

        let io_err = |e: std::io::Error| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        };

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        let temp_path = path.with_extension("json.tmp");
        {
            let mut file = std::fs::File::create(&temp_path).map_err(io_err)?;
            file.write_all(json.as_bytes()).map_err(io_err)?;
            file.sync_all().map_err(io_err)?;
        }
        std::fs::rename(&temp_path, path).map_err(io_err)?;
        Ok(())
    }

    /// Normalizes and validates all fields.
    ///
    /// Concurrency is clamped into range rather than rejected; strings go
    /// through the full validators.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Validation`] or [`CoreError::Security`] from
    /// the proxy/rate-limit validators.
    pub fn validated(mut self) -> Result<Self, CoreError> {
        self.max_concurrent_downloads = self
            .max_concurrent_downloads
            .clamp(1, MAX_CONCURRENT_CEILING);
        if self.queue_size_limit == 0 {
            self.queue_size_limit = crate::queue::DEFAULT_QUEUE_SIZE_LIMIT;
        }
        if self.pause_timeout_secs == 0 {
            self.pause_timeout_secs = 3600;
        }
        if let Some(proxy) = &self.proxy {
            validate_proxy(proxy)?;
        }
        if let Some(rate) = &self.rate_limit {
            validate_rate_limit(rate)?;
        }
        Ok(self)
    }
}
