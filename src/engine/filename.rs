//! Filename derivation from response headers and URLs.
//!
//! The chain is: `Content-Disposition` (`filename*=` RFC 5987 form first,
//! then the quoted form, then the bare form), falling back to the URL path
//! basename. Every candidate passes through the sanitizer; a header that
//! smuggles path separators or `..` segments is a security failure, not a
//! cleanup job.

use std::path::{Path, PathBuf};

use url::Url;

use crate::error::CoreError;
use crate::validate::sanitize_filename;

/// Extracts a filename from a `Content-Disposition` header value.
///
/// Handles, in order of preference:
/// - `filename*=UTF-8''encoded%20name.mp4` (RFC 5987)
/// - `filename="quoted name.mp4"`
/// - `filename=bare-name.mp4`
#[must_use]
pub fn parse_content_disposition(header: &str) -> Option<String> {
    // RFC 5987 extended form first.
    if let Some(pos) = header.find("filename*=") {
        let value = header[pos + 10..].trim();
        // Format: charset'language'encoded_value
        if let Some(quote_pos) = value.find("''") {
            let encoded = &value[quote_pos + 2..];
            let end = encoded.find(';').unwrap_or(encoded.len());
            let encoded_name = encoded[..end].trim();
            if let Ok(decoded) = urlencoding::decode(encoded_name)
                && !decoded.is_empty()
            {
                return Some(decoded.into_owned());
            }
        }
    }

    if let Some(pos) = header.find("filename=") {
        let value = header[pos + 9..].trim();
        if let Some(stripped) = value.strip_prefix('"') {
            if let Some(end) = stripped.find('"') {
                return Some(stripped[..end].to_string());
            }
        } else {
            let end = value.find(';').unwrap_or(value.len());
            let filename = value[..end].trim();
            if !filename.is_empty() {
                return Some(filename.to_string());
            }
        }
    }

    None
}

/// Sanitizes a header-supplied filename, rejecting traversal outright.
///
/// # Errors
///
/// Returns [`CoreError::Security`] when the name carries path separators or
/// `..` segments, [`CoreError::Validation`] when nothing usable remains.
pub fn safe_header_filename(raw: &str) -> Result<String, CoreError> {
    if raw.contains('/') || raw.contains('\\') {
        return Err(CoreError::security(
            "Content-Disposition filename contains path separators",
        ));
    }
    if Path::new(raw)
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
        || raw.split('.').all(str::is_empty)
    {
        return Err(CoreError::security(
            "Content-Disposition filename attempts traversal",
        ));
    }
    sanitize_filename(raw)
}

/// Filename derived from the URL path basename, or a stable fallback.
#[must_use]
pub fn filename_from_url(url: &Url) -> String {
    if let Some(mut segments) = url.path_segments()
        && let Some(last) = segments.next_back()
        && !last.is_empty()
        && let Ok(decoded) = urlencoding::decode(last)
        && let Ok(clean) = sanitize_filename(&decoded)
    {
        return clean;
    }
    let host = url.host_str().unwrap_or("download").replace('.', "-");
    sanitize_filename(&host).unwrap_or_else(|_| "download".to_string())
}

/// Returns the lowercase extension of the URL path, if it looks like one.
#[must_use]
pub fn extension_from_url(url: &Url) -> Option<String> {
    let last = url.path_segments()?.next_back()?;
    let dot = last.rfind('.')?;
    let ext = &last[dot + 1..];
    if ext.is_empty() || ext.len() > 11 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_lowercase())
}

/// Resolves a unique path in `dir`, appending `_2`, `_3`, ... on collision.
#[must_use]
pub fn resolve_unique_path(dir: &Path, filename: &str) -> PathBuf {
    let base = dir.join(filename);
    if !base.exists() {
        return base;
    }

    let (stem, ext) = match filename.rfind('.') {
        Some(pos) => (&filename[..pos], &filename[pos..]),
        None => (filename, ""),
    };
    for i in 2..1000 {
        let candidate = dir.join(format!("{stem}_{i}{ext}"));
        if !candidate.exists() {
            return candidate;
        }
    }
    // 999 collisions means something is generating these adversarially;
    // fall back to a pid-qualified name.
    dir.join(format!("{stem}_{}{ext}", std::process::id()))
}
