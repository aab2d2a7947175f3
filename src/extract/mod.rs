//! Metadata extraction: resolving an input URL into downloadable media.
//!
//! Extractors form a priority-ordered registry. Selection walks three tiers:
//! dedicated site handlers, the public-page scraper, and the generic HTTP
//! probe, with `force_generic` short-circuiting straight to the last. Each
//! handler answers a cheap [`supports`](Extractor::supports) check before
//! its [`extract`](Extractor::extract) is invoked.

mod generic;
mod page;

pub use generic::GenericExtractor;
pub use page::PageExtractor;

use async_trait::async_trait;
use url::Url;

use crate::error::CoreError;
use crate::options::DownloadOptions;
use crate::queue::{MetadataSnapshot, SourceKind};

/// Trait implemented by every metadata extractor.
///
/// `async_trait` keeps the registry object-safe (`Box<dyn Extractor>`);
/// Rust 2024 native async traits are not.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Handler name for logs.
    fn name(&self) -> &str;

    /// Which selection tier this handler belongs to.
    fn kind(&self) -> SourceKind;

    /// Cheap syntactic/domain check; no network allowed here.
    fn supports(&self, url: &Url) -> bool;

    /// Resolves a URL into a metadata snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Extract`] when no media can be resolved, or a
    /// transport-shaped error for probe failures.
    async fn extract(
        &self,
        url: &Url,
        options: &DownloadOptions,
    ) -> Result<MetadataSnapshot, CoreError>;
}

/// Priority-ordered collection of extractors.
pub struct ExtractorRegistry {
    handlers: Vec<Box<dyn Extractor>>,
}

impl std::fmt::Debug for ExtractorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractorRegistry")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl ExtractorRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Appends a handler; registration order is selection order within a tier.
    pub fn register(&mut self, handler: Box<dyn Extractor>) {
        self.handlers.push(handler);
    }

    /// Selects the handler for a URL per the tiered policy.
    ///
    /// 1. `force_generic` skips straight to the generic tier.
    /// 2. A supporting site handler wins.
    /// 3. A supporting public-page scraper is next.
    /// 4. The generic handler is the fallback.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Extract`] when no handler accepts the URL
    /// (only possible in a registry built without a generic fallback).
    pub fn select(
        &self,
        url: &Url,
        options: &DownloadOptions,
    ) -> Result<&dyn Extractor, CoreError> {
        let tiers: &[SourceKind] = if options.force_generic {
            &[SourceKind::Generic]
        } else {
            &[SourceKind::Site, SourceKind::PublicPage, SourceKind::Generic]
        };

        for tier in tiers {
            if let Some(handler) = self
                .handlers
                .iter()
                .find(|h| h.kind() == *tier && h.supports(url))
            {
                return Ok(handler.as_ref());
            }
        }
        Err(CoreError::extract(url.as_str(), "no suitable extractor"))
    }

    /// Selects and runs the extractor for `url`.
    ///
    /// # Errors
    ///
    /// Propagates selection and extraction failures.
    pub async fn extract(
        &self,
        url: &Url,
        options: &DownloadOptions,
    ) -> Result<MetadataSnapshot, CoreError> {
        let handler = self.select(url, options)?;
        tracing::debug!(handler = handler.name(), url = %url, "extractor selected");
        handler.extract(url, options).await
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the default registry: page scraper plus generic probe.
///
/// Dedicated site handlers register ahead of these at integration time; the
/// core itself ships none.
#[must_use]
pub fn build_default_extractor_registry(client: reqwest::Client) -> ExtractorRegistry {
    let mut registry = ExtractorRegistry::new();
    registry.register(Box::new(PageExtractor::new(client.clone())));
    registry.register(Box::new(GenericExtractor::new(client)));
    registry
}
