//! URL classification into acquisition strategies.
//!
//! Pure, deterministic, no I/O: given a URL string, pick one of a closed set
//! of source kinds. The caller uses the kind to select which resolver feeds
//! the probe/stream pipeline; the transfer itself is identical for all kinds.

use std::sync::LazyLock;

use regex::Regex;
use tracing::trace;
use url::Url;

/// Closed tag set describing how a URL should be acquired.
///
/// Consumed once per URL to pick a strategy; never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Plain HTTP(S) resource fetched as-is.
    DirectDownload,
    /// Resource behind a repository-style API (filename/range negotiation
    /// handled by an external provider client).
    ProviderRepository,
    /// Video-hosting site handled by an external extractor.
    VideoSite,
    /// Not a well-formed HTTP(S) URL.
    Invalid,
    /// Well-formed but matching no known family.
    Unrecognized,
}

impl SourceKind {
    /// Human-readable label used in log lines and the CLI.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::DirectDownload => "direct download",
            Self::ProviderRepository => "provider repository",
            Self::VideoSite => "video site",
            Self::Invalid => "invalid URL",
            Self::Unrecognized => "unrecognized",
        }
    }
}

/// Host/path patterns for video-hosting sites.
///
/// Matched against the lowercased `host + path` (query excluded), so a
/// provider URL ending in a file-like extension cannot shadow these.
#[allow(clippy::expect_used)]
static VIDEO_HOST_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"youtube\.com/watch",
        r"youtu\.be/",
        r"youtube\.com/playlist",
        r"youtube\.com/channel/",
        r"youtube\.com/user/",
        r"youtube\.com/c/",
        r"twitter\.com/",
        r"x\.com/",
        r"instagram\.com/",
        r"tiktok\.com/",
        r"vm\.tiktok\.com/",
        r"facebook\.com/",
        r"fb\.watch/",
        r"reddit\.com/r/",
        r"redd\.it/",
        r"twitch\.tv/",
        r"clips\.twitch\.tv/",
        r"vimeo\.com/",
        r"dailymotion\.com/",
        r"soundcloud\.com/",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("video host pattern is valid"))
    .collect()
});

/// Host/path patterns for repository-style providers (`host/owner/repo`).
#[allow(clippy::expect_used)]
static PROVIDER_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"huggingface\.co/datasets/[^/]+/[^/]+",
        r"huggingface\.co/spaces/[^/]+/[^/]+",
        r"huggingface\.co/[^/]+/[^/]+",
        r"hf\.co/[^/]+/[^/]+",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("provider pattern is valid"))
    .collect()
});

/// File extensions indicating a direct download when they end the final path
/// segment.
const DOWNLOAD_EXTENSIONS: &[&str] = &[
    ".zip", ".rar", ".7z", ".tar", ".gz", ".bz2", ".xz", ".pdf", ".doc", ".docx", ".xls",
    ".xlsx", ".ppt", ".pptx", ".jpg", ".jpeg", ".png", ".gif", ".bmp", ".svg", ".webp", ".mp4",
    ".avi", ".mkv", ".mov", ".wmv", ".flv", ".webm", ".mp3", ".wav", ".flac", ".aac", ".ogg",
    ".wma", ".exe", ".msi", ".deb", ".rpm", ".dmg", ".pkg", ".iso", ".img", ".bin", ".json",
    ".xml", ".csv", ".txt", ".log", ".apk", ".ipa",
];

/// Hosts probably handled by the generic video extractor even though they
/// match no explicit pattern family.
const EXTRACTOR_HOSTS: &[&str] = &[
    "bandcamp.com",
    "mixcloud.com",
    "streamable.com",
    "ted.com",
    "bloomberg.com",
    "cnn.com",
];

/// Classifies a URL into a [`SourceKind`].
///
/// Family priority: video-hosting patterns, then provider-repository
/// patterns, then the extension allowlist on the final path segment, then
/// the generic-extractor host allowlist. Host comparison is
/// case-insensitive, and the query string never participates in extension
/// matching.
#[must_use]
pub fn classify(url: &str) -> SourceKind {
    let Some(parsed) = parse_http_url(url) else {
        return SourceKind::Invalid;
    };

    let host = parsed.host_str().unwrap_or("").to_ascii_lowercase();
    let host_and_path = format!("{}{}", host, parsed.path().to_ascii_lowercase());
    trace!(%host_and_path, "classifying URL");

    if VIDEO_HOST_PATTERNS.iter().any(|p| p.is_match(&host_and_path)) {
        return SourceKind::VideoSite;
    }

    if PROVIDER_PATTERNS.iter().any(|p| p.is_match(&host_and_path)) {
        return SourceKind::ProviderRepository;
    }

    if has_download_extension(&parsed) {
        return SourceKind::DirectDownload;
    }

    if EXTRACTOR_HOSTS
        .iter()
        .any(|candidate| host == *candidate || host.ends_with(&format!(".{candidate}")))
    {
        return SourceKind::VideoSite;
    }

    SourceKind::Unrecognized
}

/// Returns true if the URL looks like a playlist/collection rather than a
/// single resource. Informational only; the engine always fetches one
/// resource.
#[must_use]
pub fn looks_like_playlist(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    ["playlist", "list=", "album", "set", "collection", "series"]
        .iter()
        .any(|indicator| lower.contains(indicator))
}

/// Parses and validates an HTTP(S) URL: must have an http/https scheme and a
/// host.
fn parse_http_url(raw: &str) -> Option<Url> {
    let parsed = Url::parse(raw).ok()?;
    match parsed.scheme() {
        "http" | "https" => {}
        _ => return None,
    }
    parsed.host_str()?;
    Some(parsed)
}

/// Tests the final path segment against the extension allowlist.
///
/// `Url::path()` excludes the query string, so `?download=file.zip` cannot
/// fake an extension.
fn has_download_extension(url: &Url) -> bool {
    let path = url.path().to_ascii_lowercase();
    DOWNLOAD_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}
