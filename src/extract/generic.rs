//! Generic HTTP metadata probe: the always-available fallback extractor.

use async_trait::async_trait;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_LENGTH};
use tracing::{debug, instrument, warn};
use url::Url;

use super::Extractor;
use crate::engine::filename::{filename_from_url, parse_content_disposition, safe_header_filename};
use crate::error::CoreError;
use crate::options::DownloadOptions;
use crate::queue::{MetadataSnapshot, SourceKind};

/// HEAD-only probe that derives metadata from response headers.
///
/// Servers that reject HEAD degrade to URL-derived metadata; the engine's
/// GET will surface any real transport failure. A `Content-Disposition`
/// filename that attempts traversal is a hard security failure here, before
/// any bytes are fetched.
pub struct GenericExtractor {
    client: reqwest::Client,
}

impl GenericExtractor {
    /// Creates the probe over a shared HTTP client.
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn url_only_snapshot(url: &Url) -> MetadataSnapshot {
        let filename = filename_from_url(url);
        MetadataSnapshot {
            title: Some(title_from_filename(&filename)),
            duration_seconds: None,
            thumbnail_url: None,
            source_kind: SourceKind::Generic,
            media_url: url.to_string(),
            suggested_filename: Some(filename),
            content_length: None,
        }
    }
}

#[async_trait]
impl Extractor for GenericExtractor {
    fn name(&self) -> &str {
        "generic"
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Generic
    }

    fn supports(&self, _url: &Url) -> bool {
        true
    }

    #[instrument(skip(self, _options), fields(url = %url))]
    async fn extract(
        &self,
        url: &Url,
        _options: &DownloadOptions,
    ) -> Result<MetadataSnapshot, CoreError> {
        let response = match self
            .client
            .head(url.clone())
            .timeout(std::time::Duration::from_secs(30))
            .send()
            .await
        {
            Ok(response) => response,
            Err(error) => {
                warn!(%error, "HEAD probe failed, using URL-derived metadata");
                return Ok(Self::url_only_snapshot(url));
            }
        };

        if !response.status().is_success() {
            debug!(status = %response.status(), "HEAD not accepted, using URL-derived metadata");
            return Ok(Self::url_only_snapshot(url));
        }

        let content_length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let header_name = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_disposition);

        let suggested_filename = match header_name {
            Some(raw) => Some(safe_header_filename(&raw)?),
            None => Some(filename_from_url(url)),
        };

        Ok(MetadataSnapshot {
            title: suggested_filename.as_deref().map(title_from_filename),
            duration_seconds: None,
            thumbnail_url: None,
            source_kind: SourceKind::Generic,
            media_url: url.to_string(),
            suggested_filename,
            content_length,
        })
    }
}

fn title_from_filename(filename: &str) -> String {
    match filename.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => filename.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn extractor() -> GenericExtractor {
        GenericExtractor::new(reqwest::Client::new())
    }

    #[tokio::test]
    async fn test_head_probe_reads_headers() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/clip.mp4"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Length", "1048576")
                    .insert_header(
                        "Content-Disposition",
                        "attachment; filename=\"fancy clip.mp4\"",
                    ),
            )
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/clip.mp4", server.uri())).unwrap();
        let snapshot = extractor()
            .extract(&url, &DownloadOptions::default())
            .await
            .unwrap();

        assert_eq!(snapshot.content_length, Some(1_048_576));
        assert_eq!(snapshot.suggested_filename.as_deref(), Some("fancy clip.mp4"));
        assert_eq!(snapshot.title.as_deref(), Some("fancy clip"));
        assert_eq!(snapshot.source_kind, SourceKind::Generic);
    }

    #[tokio::test]
    async fn test_traversal_in_disposition_is_security_error() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/evil"))
            .respond_with(ResponseTemplate::new(200).insert_header(
                "Content-Disposition",
                "attachment; filename=\"../../etc/passwd\"",
            ))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/evil", server.uri())).unwrap();
        let err = extractor()
            .extract(&url, &DownloadOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Security);
    }

    #[tokio::test]
    async fn test_head_rejection_degrades_to_url_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/clip.mp4"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/clip.mp4", server.uri())).unwrap();
        let snapshot = extractor()
            .extract(&url, &DownloadOptions::default())
            .await
            .unwrap();
        assert_eq!(snapshot.suggested_filename.as_deref(), Some("clip.mp4"));
        assert!(snapshot.content_length.is_none());
    }
}
