//! Public-page scraper: finds media links inside human-facing HTML pages.
//!
//! The body read is hard-capped to keep a hostile page from ballooning
//! memory; anything past the cap is simply not scanned.

use async_trait::async_trait;
use futures_util::StreamExt;
use scraper::{Html, Selector};
use tracing::{debug, instrument};
use url::Url;

use super::Extractor;
use crate::engine::filename::{extension_from_url, filename_from_url};
use crate::error::CoreError;
use crate::options::DownloadOptions;
use crate::queue::{MetadataSnapshot, SourceKind};

/// Maximum page bytes read before parsing.
pub const MAX_PAGE_BYTES: usize = 2 * 1024 * 1024;

/// File extensions treated as directly downloadable media.
const MEDIA_EXTENSIONS: [&str; 13] = [
    "mp4", "webm", "mkv", "mov", "avi", "ts", "mp3", "m4a", "opus", "ogg", "wav", "flac", "gif",
];

/// Extractor for public HTML pages (watch pages, public message pages).
///
/// Claims URLs that do not point at a file directly; the scrape looks for
/// OpenGraph media tags, `<video>`/`<audio>` sources, and media-extension
/// anchors, in that order.
pub struct PageExtractor {
    client: reqwest::Client,
}

impl PageExtractor {
    /// Creates the scraper over a shared HTTP client.
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn fetch_capped(&self, url: &Url) -> Result<String, CoreError> {
        let response = self
            .client
            .get(url.clone())
            .timeout(std::time::Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| map_request_error(url, &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CoreError::extract(
                url.as_str(),
                format!("page returned HTTP {status}"),
            ));
        }

        let mut body: Vec<u8> = Vec::with_capacity(64 * 1024);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| map_request_error(url, &e))?;
            let take = chunk.len().min(MAX_PAGE_BYTES - body.len());
            body.extend_from_slice(&chunk[..take]);
            if body.len() >= MAX_PAGE_BYTES {
                debug!(url = %url, "page body capped at {MAX_PAGE_BYTES} bytes");
                break;
            }
        }
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

#[async_trait]
impl Extractor for PageExtractor {
    fn name(&self) -> &str {
        "public-page"
    }

    fn kind(&self) -> SourceKind {
        SourceKind::PublicPage
    }

    fn supports(&self, url: &Url) -> bool {
        match extension_from_url(url) {
            None => true,
            Some(ext) => matches!(ext.as_str(), "html" | "htm" | "php"),
        }
    }

    #[instrument(skip(self, _options), fields(url = %url))]
    async fn extract(
        &self,
        url: &Url,
        _options: &DownloadOptions,
    ) -> Result<MetadataSnapshot, CoreError> {
        let body = self.fetch_capped(url).await?;

        // Html is parsed and dropped inside this block; it must not live
        // across an await (tendril is not Send).
        let scraped = scrape(&body, url);

        let Some(media_url) = scraped.media_url else {
            return Err(CoreError::extract(url.as_str(), "no media found on page"));
        };

        let media = Url::parse(&media_url)
            .map_err(|_| CoreError::extract(url.as_str(), "page media link is malformed"))?;

        Ok(MetadataSnapshot {
            title: scraped.title,
            duration_seconds: scraped.duration_seconds,
            thumbnail_url: scraped.thumbnail_url,
            source_kind: SourceKind::PublicPage,
            media_url: media.to_string(),
            suggested_filename: Some(filename_from_url(&media)),
            content_length: None,
        })
    }
}

struct Scraped {
    media_url: Option<String>,
    title: Option<String>,
    thumbnail_url: Option<String>,
    duration_seconds: Option<u64>,
}

fn scrape(body: &str, base: &Url) -> Scraped {
    let document = Html::parse_document(body);

    let meta_content = |property: &str| -> Option<String> {
        let selector =
            Selector::parse(&format!("meta[property=\"{property}\"]")).ok()?;
        document
            .select(&selector)
            .next()
            .and_then(|el| el.value().attr("content"))
            .map(str::to_string)
    };

    let mut media_url = meta_content("og:video:secure_url")
        .or_else(|| meta_content("og:video:url"))
        .or_else(|| meta_content("og:video"))
        .or_else(|| meta_content("og:audio"));

    if media_url.is_none() {
        media_url = first_attr(&document, "video[src], video source[src], audio[src], audio source[src]", "src");
    }

    if media_url.is_none()
        && let Ok(selector) = Selector::parse("a[href]")
    {
        media_url = document
            .select(&selector)
            .filter_map(|el| el.value().attr("href"))
            .find(|href| {
                base.join(href)
                    .ok()
                    .and_then(|joined| extension_from_url(&joined))
                    .is_some_and(|ext| MEDIA_EXTENSIONS.contains(&ext.as_str()))
            })
            .map(str::to_string);
    }

    let media_url = media_url.and_then(|raw| base.join(&raw).ok().map(|u| u.to_string()));

    let title = meta_content("og:title").or_else(|| {
        Selector::parse("title").ok().and_then(|selector| {
            document
                .select(&selector)
                .next()
                .map(|el| el.text().collect::<String>().trim().to_string())
                .filter(|t| !t.is_empty())
        })
    });

    let thumbnail_url = meta_content("og:image")
        .and_then(|raw| base.join(&raw).ok().map(|u| u.to_string()));

    let duration_seconds =
        meta_content("og:video:duration").and_then(|raw| raw.trim().parse::<u64>().ok());

    Scraped {
        media_url,
        title,
        thumbnail_url,
        duration_seconds,
    }
}

fn first_attr(document: &Html, selector: &str, attr: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    document
        .select(&selector)
        .filter_map(|el| el.value().attr(attr))
        .next()
        .map(str::to_string)
}

fn map_request_error(url: &Url, error: &reqwest::Error) -> CoreError {
    if error.is_timeout() || error.is_connect() {
        CoreError::transient(url.as_str(), error.to_string())
    } else {
        CoreError::extract(url.as_str(), error.to_string())
    }
}
