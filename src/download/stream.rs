//! Streaming transfer into a partial file.
//!
//! Pumps the response body into the `.part` file in fixed-size chunks,
//! flushing after every chunk so the on-disk length is trustworthy for
//! resume math. The streamer reports every chunk to its caller and does no
//! throttling of its own; checkpoint cadence is the coordinator's concern.
//!
//! Cancellation is checked between body reads. A cancelled stream is not an
//! error: the partial file and its flushed bytes remain valid resume state.

use std::path::Path;

use futures_util::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{RANGE, RETRY_AFTER};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

use super::DownloadError;

/// Byte and chunk counters for one streaming attempt (excluding any resumed
/// prefix).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamOutcome {
    /// Bytes written and flushed by this attempt.
    pub bytes_written: u64,
    /// Chunks written by this attempt.
    pub chunks_written: u64,
}

/// How a streaming attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The response body was fully consumed.
    Finished(StreamOutcome),
    /// Cancellation was requested; everything counted is flushed to disk.
    Cancelled(StreamOutcome),
}

/// Streams `url` into `part_path`, resuming from `offset` when nonzero.
///
/// `on_chunk` is invoked after each flushed chunk with
/// `(bytes_this_chunk, cumulative_bytes)` where cumulative includes the
/// resumed prefix. Cumulative values are strictly increasing within one
/// call.
///
/// # Errors
///
/// Returns [`DownloadError::RangeNotHonored`] when `offset > 0` but the
/// server replies 200 or 416 instead of 206 (nothing is written in that
/// case), plus the usual transport, status, and IO errors.
#[instrument(skip(client, cancel, on_chunk))]
pub async fn stream_to_part(
    client: &reqwest::Client,
    url: &str,
    part_path: &Path,
    offset: u64,
    chunk_size: usize,
    cancel: &CancellationToken,
    mut on_chunk: impl FnMut(u64, u64),
) -> Result<StreamEnd, DownloadError> {
    let chunk_size = chunk_size.max(1);

    let mut request = client.get(url);
    if offset > 0 {
        request = request.header(RANGE, format!("bytes={offset}-"));
    }
    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            DownloadError::timeout(url)
        } else {
            DownloadError::network(url, e)
        }
    })?;

    let status = response.status();
    if offset > 0 && matches!(status, StatusCode::OK | StatusCode::RANGE_NOT_SATISFIABLE) {
        // 200 means the server ignored the range; 416 means the offset is
        // past the end of a resource that shrank between probe and GET.
        // Either way the prefix cannot be extended. Bail before touching
        // the partial file; the coordinator truncates and restarts.
        return Err(DownloadError::range_not_honored(url));
    }
    if !status.is_success() {
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        return Err(DownloadError::remote_status_with_retry_after(
            url,
            status.as_u16(),
            retry_after,
        ));
    }

    let file = if offset > 0 {
        OpenOptions::new().append(true).open(part_path).await
    } else {
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(part_path)
            .await
    }
    .map_err(|e| DownloadError::io(part_path, e))?;
    let mut writer = BufWriter::with_capacity(chunk_size, file);

    let mut body = response.bytes_stream();
    let mut pending: Vec<u8> = Vec::with_capacity(chunk_size);
    let mut outcome = StreamOutcome::default();
    let io_err = |e| DownloadError::io(part_path, e);

    debug!(%url, offset, chunk_size, "streaming body");

    loop {
        let frame = tokio::select! {
            // Check cancellation before pulling another frame so a stop
            // request takes effect even on a fast, always-ready body.
            biased;
            () = cancel.cancelled() => {
                // Drain whatever is buffered so the file length reflects
                // every counted byte, then stop cleanly.
                if !pending.is_empty() {
                    write_chunk(&mut writer, &pending, offset, &mut outcome, &mut on_chunk)
                        .await
                        .map_err(io_err)?;
                    pending.clear();
                }
                writer.get_mut().sync_all().await.map_err(io_err)?;
                debug!(%url, bytes = outcome.bytes_written, "stream cancelled");
                return Ok(StreamEnd::Cancelled(outcome));
            }
            frame = body.next() => frame,
        };

        let Some(frame) = frame else {
            break;
        };
        let bytes = frame.map_err(|e| {
            if e.is_timeout() {
                DownloadError::timeout(url)
            } else {
                DownloadError::network(url, e)
            }
        })?;

        // Network frames arrive at arbitrary sizes; regroup them into
        // fixed-size chunks so checkpoint math is frame-size independent.
        pending.extend_from_slice(&bytes);
        while pending.len() >= chunk_size {
            let rest = pending.split_off(chunk_size);
            write_chunk(&mut writer, &pending, offset, &mut outcome, &mut on_chunk)
                .await
                .map_err(io_err)?;
            pending = rest;
        }
        trace!(buffered = pending.len(), written = outcome.bytes_written);
    }

    // Final short chunk.
    if !pending.is_empty() {
        write_chunk(&mut writer, &pending, offset, &mut outcome, &mut on_chunk)
            .await
            .map_err(io_err)?;
    }
    writer.get_mut().sync_all().await.map_err(io_err)?;

    debug!(%url, bytes = outcome.bytes_written, chunks = outcome.chunks_written, "stream finished");
    Ok(StreamEnd::Finished(outcome))
}

/// Writes one chunk, flushes it, and reports it.
async fn write_chunk(
    writer: &mut BufWriter<tokio::fs::File>,
    chunk: &[u8],
    offset: u64,
    outcome: &mut StreamOutcome,
    on_chunk: &mut impl FnMut(u64, u64),
) -> Result<(), std::io::Error> {
    writer.write_all(chunk).await?;
    writer.flush().await?;
    outcome.bytes_written += chunk.len() as u64;
    outcome.chunks_written += 1;
    on_chunk(chunk.len() as u64, offset + outcome.bytes_written);
    Ok(())
}
