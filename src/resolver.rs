//! Source resolvers: from a classified URL to a fetchable one.
//!
//! The [`Resolver`] trait is the seam where provider-repository and
//! video-site strategies would plug in; this crate ships the direct-HTTP
//! resolver and reports the other kinds as unsupported so the CLI can point
//! users at the right external tool.

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;
use url::Url;

use crate::classify::SourceKind;
use crate::download::DownloadError;

/// A URL ready to hand to the download engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSource {
    /// The URL to fetch.
    pub download_url: String,
    /// Filename to use when the caller did not pick a destination.
    pub suggested_filename: String,
}

/// Turns a user-supplied URL into a [`ResolvedSource`].
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolves `url` into a fetchable source.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::InvalidUrl`] when the URL cannot be used by
    /// this resolver.
    async fn resolve(&self, url: &str) -> Result<ResolvedSource, DownloadError>;
}

/// Resolver for plain HTTP(S) resources: the URL is fetched as-is and the
/// filename comes from the final path segment.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectResolver;

#[async_trait]
impl Resolver for DirectResolver {
    async fn resolve(&self, url: &str) -> Result<ResolvedSource, DownloadError> {
        let parsed = Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            return Err(DownloadError::invalid_url(url));
        }

        let suggested_filename = filename_from_url(&parsed);
        debug!(%url, %suggested_filename, "resolved direct source");
        Ok(ResolvedSource {
            download_url: url.to_string(),
            suggested_filename,
        })
    }
}

/// Picks the resolver for a source kind; `None` means the kind needs an
/// external tool this crate does not bundle.
#[must_use]
pub fn resolver_for(kind: SourceKind) -> Option<Box<dyn Resolver>> {
    match kind {
        SourceKind::DirectDownload | SourceKind::Unrecognized => {
            Some(Box::new(DirectResolver))
        }
        SourceKind::ProviderRepository | SourceKind::VideoSite | SourceKind::Invalid => None,
    }
}

/// Derives a filename from the URL's final path segment, percent-decoded and
/// sanitized. Falls back to a timestamped name when the path has no usable
/// segment.
fn filename_from_url(url: &Url) -> String {
    let segment = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty())
        .map(|s| urlencoding::decode(s).map_or_else(|_| s.to_string(), |d| d.into_owned()));

    match segment.map(|s| sanitize_filename(&s)).filter(|s| !s.is_empty()) {
        Some(name) => name,
        None => format!("download_{}", Utc::now().format("%Y%m%d_%H%M%S")),
    }
}

/// Strips path separators and characters unsafe on common file systems,
/// trims surrounding whitespace and dots, and caps the length at 200.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    const UNSAFE: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|', '\0'];

    let cleaned: String = name
        .chars()
        .map(|c| if UNSAFE.contains(&c) || c.is_control() { '_' } else { c })
        .collect();
    let trimmed = cleaned.trim().trim_matches('.');

    trimmed.chars().take(200).collect()
}
