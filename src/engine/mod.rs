//! Download engines: the components that move bytes.
//!
//! Engines sit behind the same registry pattern as extractors. A job is
//! dispatched to the first engine whose [`supports`](Engine::supports)
//! accepts it; `force_generic` and the fallback tier both land on the
//! built-in HTTP engine.

pub mod filename;

mod external;
mod http;

pub use external::ExternalEngine;
pub use http::HttpEngine;

use std::path::PathBuf;

use async_trait::async_trait;
use url::Url;

use crate::cancel::CancelToken;
use crate::error::CoreError;
use crate::options::DownloadOptions;
use crate::progress::ProgressHandle;
use crate::queue::MetadataSnapshot;

/// Everything an engine needs to run one transfer.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    /// Queue item id, for logs and progress.
    pub item_id: u64,
    /// The media URL to fetch (post-extraction).
    pub media_url: Url,
    /// The URL the user originally enqueued.
    pub original_url: String,
    /// Immutable options snapshot.
    pub options: DownloadOptions,
    /// Vetted output directory (canonical, writable).
    pub output_dir: PathBuf,
    /// Metadata captured by the extractor.
    pub metadata: MetadataSnapshot,
}

/// Result of a completed transfer.
#[derive(Debug, Clone)]
pub struct DownloadResult {
    /// Final saved path.
    pub path: PathBuf,
    /// Bytes on disk.
    pub bytes_downloaded: u64,
    /// Expected size when the server stated one.
    pub content_length: Option<u64>,
    /// Whether an HTTP Range resume contributed to the file.
    pub resumed: bool,
}

/// How an engine invocation ended without erroring.
#[derive(Debug, Clone)]
pub enum EngineOutcome {
    /// The transfer finished; the file is in place.
    Completed(DownloadResult),
    /// The engine yielded on a pause request, keeping a resumable partial.
    Paused {
        /// Bytes banked so far.
        bytes_done: u64,
    },
}

/// Trait implemented by every download engine.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Engine name for logs.
    fn name(&self) -> &str;

    /// Whether this engine is the generic fallback tier.
    fn is_generic(&self) -> bool {
        false
    }

    /// Cheap check whether this engine can run the job.
    fn supports(&self, job: &DownloadJob) -> bool;

    /// Runs the transfer.
    ///
    /// Engines observe `cancel` at least once per progress tick and before
    /// long I/O. Cancellation surfaces as [`CoreError::Cancelled`]; a pause
    /// request may surface as [`EngineOutcome::Paused`] if the engine can
    /// yield with a resumable partial.
    ///
    /// # Errors
    ///
    /// Transport failures per the taxonomy in [`crate::error`].
    async fn download(
        &self,
        job: &DownloadJob,
        progress: &ProgressHandle,
        cancel: &CancelToken,
    ) -> Result<EngineOutcome, CoreError>;
}

/// Priority-ordered collection of engines.
pub struct EngineRegistry {
    handlers: Vec<Box<dyn Engine>>,
}

impl std::fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRegistry")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl EngineRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Appends an engine; registration order is priority order.
    pub fn register(&mut self, engine: Box<dyn Engine>) {
        self.handlers.push(engine);
    }

    /// Selects the engine for a job.
    ///
    /// `force_generic` jumps straight to the generic engine; otherwise the
    /// first supporting engine wins, with the generic engine as fallback.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Internal`] when the registry holds no generic
    /// engine and nothing supports the job.
    pub fn select(&self, job: &DownloadJob) -> Result<&dyn Engine, CoreError> {
        if job.options.force_generic {
            return self
                .handlers
                .iter()
                .find(|e| e.is_generic())
                .map(AsRef::as_ref)
                .ok_or_else(|| CoreError::internal("no generic engine registered"));
        }

        self.handlers
            .iter()
            .find(|e| e.supports(job))
            .or_else(|| self.handlers.iter().find(|e| e.is_generic()))
            .map(AsRef::as_ref)
            .ok_or_else(|| CoreError::internal("no engine accepts the job"))
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the default registry: external accelerator (when present on PATH)
/// ahead of the generic HTTP engine.
#[must_use]
pub fn build_default_engine_registry(client: reqwest::Client) -> EngineRegistry {
    let mut registry = EngineRegistry::new();
    match ExternalEngine::from_path() {
        Some(engine) => registry.register(Box::new(engine)),
        None => tracing::debug!("no external transfer binary found; HTTP engine only"),
    }
    registry.register(Box::new(HttpEngine::new(client)));
    registry
}
