//! Error types for the download engine.
//!
//! Every failure that crosses a component boundary is mapped into this
//! taxonomy before the coordinator decides retryable vs. fatal; no raw
//! `reqwest::Error` or `std::io::Error` escapes unlabeled.

use std::path::PathBuf;

use thiserror::Error;

use crate::state::StateError;

/// Errors that can occur while probing or transferring a resource.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The provided URL is malformed or missing scheme/host.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// Network-level error (DNS resolution, connection reset, TLS errors, etc.)
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL that failed to download.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout downloading {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// Server responded with an error status (4xx client, 5xx server).
    #[error("HTTP {status} downloading {url}")]
    RemoteStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// The Retry-After header value, if present (429/503 responses).
        retry_after: Option<String>,
    },

    /// Server would not serve the requested byte range: either it replied
    /// 200 with the full body, or 416 because the offset is past the end of
    /// a resource that changed since the probe.
    ///
    /// Not a terminal failure: the coordinator reacts by truncating the
    /// partial file and restarting from offset zero.
    #[error("server did not honor range request for {url}")]
    RangeNotHonored {
        /// The URL whose range request was not honored.
        url: String,
    },

    /// Final on-disk size disagrees with the probed total after a stream
    /// claimed success.
    #[error(
        "verification failed for {path}: expected {expected_bytes} bytes, got {actual_bytes}"
    )]
    VerificationMismatch {
        /// Partial-file path that failed verification.
        path: PathBuf,
        /// Expected size in bytes.
        expected_bytes: u64,
        /// Actual size in bytes.
        actual_bytes: u64,
    },

    /// Local file system error (create, write, flush, rename).
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

impl DownloadError {
    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates a remote status error.
    pub fn remote_status(url: impl Into<String>, status: u16) -> Self {
        Self::RemoteStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    /// Creates a remote status error carrying a Retry-After header value.
    pub fn remote_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::RemoteStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Creates a range-not-honored signal.
    pub fn range_not_honored(url: impl Into<String>) -> Self {
        Self::RangeNotHonored { url: url.into() }
    }

    /// Creates a verification mismatch error.
    pub fn verification(
        path: impl Into<PathBuf>,
        expected_bytes: u64,
        actual_bytes: u64,
    ) -> Self {
        Self::VerificationMismatch {
            path: path.into(),
            expected_bytes,
            actual_bytes,
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Maps a state-ledger failure into the taxonomy.
    ///
    /// Ledger failures are local resource problems, so they surface as
    /// [`DownloadError::Io`] and classify as fatal.
    pub fn from_state(error: StateError) -> Self {
        match error {
            StateError::Io { path, source } => Self::Io { path, source },
            StateError::Serialize { path, source } => Self::Io {
                path,
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, source),
            },
            StateError::InvalidTransition { .. } => Self::Io {
                path: PathBuf::new(),
                source: std::io::Error::other(error.to_string()),
            },
        }
    }

    /// Returns the HTTP status code carried by this error, if any.
    #[must_use]
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::RemoteStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

// We intentionally do NOT implement `From<reqwest::Error>` or
// `From<std::io::Error>`: the variants require context (url, path) that the
// source errors don't carry, so the helper constructors are the seam.
