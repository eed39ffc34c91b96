//! Pre-transfer probe: total size, range support, already-complete.
//!
//! One HEAD round-trip (with a `Range` header when a partial prefix exists)
//! answers the three questions the coordinator needs before streaming:
//! how big is the resource, will the server honor byte ranges, and is the
//! requested range already past the end (HTTP 416, meaning the file is
//! complete). Servers that reject HEAD get a GET probe whose body is
//! dropped unread.

use reqwest::StatusCode;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, RANGE, RETRY_AFTER};
use tracing::{debug, instrument};

use super::DownloadError;

/// What the probe learned about a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    /// Total resource size in bytes, when the server reported one.
    pub total_size: Option<u64>,
    /// Whether the server will honor byte-range requests.
    pub supports_range: bool,
    /// The probed range starts at or past the end of the resource (HTTP
    /// 416): every byte is already on disk.
    pub already_complete: bool,
}

/// Probes `url`, asking for bytes from `existing_bytes` onward when a
/// partial prefix is present.
///
/// # Errors
///
/// Returns [`DownloadError::Timeout`] / [`DownloadError::Network`] for
/// transport failures and [`DownloadError::RemoteStatus`] for error
/// statuses. A 416 response is NOT an error here; it comes back as
/// `already_complete`.
#[instrument(skip(client))]
pub async fn probe(
    client: &reqwest::Client,
    url: &str,
    existing_bytes: u64,
) -> Result<ProbeResult, DownloadError> {
    let response = send_probe(client, url, existing_bytes, reqwest::Method::HEAD).await?;

    // Some servers reject HEAD outright; probe again with GET and drop the
    // body unread.
    let response = if matches!(
        response.status(),
        StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED
    ) {
        debug!(%url, "HEAD rejected, probing with GET");
        send_probe(client, url, existing_bytes, reqwest::Method::GET).await?
    } else {
        response
    };

    interpret(url, existing_bytes, &response)
}

async fn send_probe(
    client: &reqwest::Client,
    url: &str,
    existing_bytes: u64,
    method: reqwest::Method,
) -> Result<reqwest::Response, DownloadError> {
    let mut request = client.request(method, url);
    if existing_bytes > 0 {
        request = request.header(RANGE, format!("bytes={existing_bytes}-"));
    }
    request.send().await.map_err(|e| {
        if e.is_timeout() {
            DownloadError::timeout(url)
        } else {
            DownloadError::network(url, e)
        }
    })
}

fn interpret(
    url: &str,
    existing_bytes: u64,
    response: &reqwest::Response,
) -> Result<ProbeResult, DownloadError> {
    let status = response.status();

    if status == StatusCode::RANGE_NOT_SATISFIABLE {
        // `Content-Range: bytes */<total>` confirms the real total if sent.
        let total_size = header_str(response, CONTENT_RANGE)
            .and_then(parse_unsatisfied_range_total)
            .or(Some(existing_bytes));
        debug!(%url, ?total_size, "range unsatisfiable, file already complete");
        return Ok(ProbeResult {
            total_size,
            supports_range: true,
            already_complete: true,
        });
    }

    if status == StatusCode::PARTIAL_CONTENT {
        let total_size = header_str(response, CONTENT_RANGE)
            .and_then(parse_content_range_total)
            .or_else(|| content_length(response).map(|len| existing_bytes + len));
        return Ok(ProbeResult {
            total_size,
            supports_range: true,
            already_complete: false,
        });
    }

    if status.is_success() {
        // Plain 200: range support is whatever Accept-Ranges advertises.
        let supports_range = header_str(response, ACCEPT_RANGES)
            .is_some_and(|v| v.to_ascii_lowercase().contains("bytes"));
        return Ok(ProbeResult {
            total_size: content_length(response),
            supports_range,
            already_complete: false,
        });
    }

    let retry_after = header_str(response, RETRY_AFTER).map(str::to_string);
    Err(DownloadError::remote_status_with_retry_after(
        url,
        status.as_u16(),
        retry_after,
    ))
}

fn header_str(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<&str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

fn content_length(response: &reqwest::Response) -> Option<u64> {
    // HEAD responses have no body, so `Response::content_length` can report
    // zero; read the header directly.
    header_str(response, CONTENT_LENGTH).and_then(|v| v.parse().ok())
}

/// Parses the total from `Content-Range: bytes <start>-<end>/<total>`.
/// A `*` total (size unknown) yields `None`.
fn parse_content_range_total(value: &str) -> Option<u64> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (_, total) = rest.rsplit_once('/')?;
    total.trim().parse().ok()
}

/// Parses the total from `Content-Range: bytes */<total>` on a 416.
fn parse_unsatisfied_range_total(value: &str) -> Option<u64> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let total = rest.strip_prefix("*/")?;
    total.trim().parse().ok()
}
