//! Download orchestration: probe, resume decision, stream, retry, verify.
//!
//! The coordinator owns the attempt loop. Each attempt re-reads the partial
//! file length from disk, re-probes the server, and re-decides the resume
//! offset; nothing is trusted across attempts except the ledger and the
//! bytes actually on disk. Errors consume the retry budget; cancellation
//! and an ignored range request do not.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::config::EngineConfig;
use crate::progress::{ProgressEvent, ProgressSink, RateEstimator};
use crate::state::{DownloadStatus, RecordPatch, StateStore, partial_path};

use super::DownloadError;
use super::probe::{ProbeResult, probe};
use super::retry::{
    FailureType, RetryDecision, RetryPolicy, classify_error, retry_after_delay,
};
use super::stream::{StreamEnd, stream_to_part};

/// Terminal result of one coordinator run.
#[derive(Debug)]
pub enum Outcome {
    /// The destination file is complete and verified.
    Completed {
        /// Final destination path.
        final_path: PathBuf,
        /// Total bytes on disk.
        bytes_downloaded: u64,
    },
    /// The download failed; the ledger records the failure.
    Failed {
        /// The error that ended the run.
        error: DownloadError,
        /// Attempts consumed (1-indexed; 1 means no retry happened).
        attempts: u32,
    },
    /// Cancellation was requested; the record is paused and resumable.
    Cancelled {
        /// Cumulative bytes safely on disk.
        bytes_downloaded: u64,
    },
}

/// Drives downloads end to end against a shared ledger.
pub struct Coordinator {
    client: reqwest::Client,
    store: Arc<StateStore>,
    config: EngineConfig,
    policy: RetryPolicy,
}

impl Coordinator {
    /// Builds a coordinator (and its HTTP client) from engine settings.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Network`] if the TLS backend cannot be
    /// initialized.
    pub fn new(store: Arc<StateStore>, config: EngineConfig) -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .read_timeout(Duration::from_secs(config.read_timeout_secs))
            .build()
            .map_err(|e| DownloadError::network("<client setup>", e))?;
        // max_retries counts retries beyond the initial attempt, so the
        // attempt budget is one larger.
        let policy = RetryPolicy::new(
            config.max_retries.saturating_add(1),
            config.backoff_base,
            config.backoff_cap,
        );
        Ok(Self {
            client,
            store,
            config,
            policy,
        })
    }

    /// The ledger this coordinator checkpoints into.
    #[must_use]
    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Downloads `url` to `destination`, resuming any prior partial state.
    ///
    /// Runs to a terminal [`Outcome`]; errors are folded into
    /// [`Outcome::Failed`] rather than returned, so callers always get the
    /// attempts-consumed count alongside the error.
    #[instrument(skip(self, cancel, on_progress), fields(destination = %destination.display()))]
    pub async fn run(
        &self,
        url: &str,
        destination: &Path,
        cancel: &CancellationToken,
        on_progress: Option<&ProgressSink>,
    ) -> Outcome {
        if !is_http_url(url) {
            return Outcome::Failed {
                error: DownloadError::invalid_url(url),
                attempts: 0,
            };
        }

        let id = StateStore::download_id(url, destination);
        let part_path = partial_path(destination);

        // A completed record whose destination still matches needs no
        // network at all.
        if let Some(record) = self.store.get(&id) {
            if record.status == DownloadStatus::Completed {
                if let Ok(meta) = std::fs::metadata(destination) {
                    if record.total_size == 0 || meta.len() == record.total_size {
                        info!(%id, "already completed, nothing to do");
                        return Outcome::Completed {
                            final_path: destination.to_path_buf(),
                            bytes_downloaded: meta.len(),
                        };
                    }
                }
                // Destination missing or wrong size: explicit re-request
                // resets the record and downloads from scratch.
                warn!(%id, "completed record no longer matches destination, restarting");
            }
        }

        if let Some(parent) = destination.parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    return Outcome::Failed {
                        error: DownloadError::io(parent, e),
                        attempts: 0,
                    };
                }
            }
        }

        let recorded_total = self.store.get(&id).map_or(0, |r| r.total_size);
        if let Err(e) = self.store.begin(&id, url, destination, recorded_total) {
            return Outcome::Failed {
                error: DownloadError::from_state(e),
                attempts: 0,
            };
        }

        let mut attempt: u32 = 1;
        let mut range_fallback_used = false;

        loop {
            match self
                .attempt(url, &id, destination, &part_path, cancel, on_progress)
                .await
            {
                Ok(AttemptEnd::Done(outcome)) => return outcome,
                Ok(AttemptEnd::Paused { bytes_downloaded }) => {
                    self.checkpoint_paused(&id, bytes_downloaded, destination, on_progress);
                    return Outcome::Cancelled { bytes_downloaded };
                }
                Err(error) => {
                    // A range request the server would not serve gets one
                    // free restart from zero without consuming the retry
                    // budget.
                    if matches!(error, DownloadError::RangeNotHonored { .. })
                        && !range_fallback_used
                    {
                        warn!(%id, "server did not honor range request, restarting from zero");
                        range_fallback_used = true;
                        if let Err(e) = self.reset_partial(&id, &part_path) {
                            return self.fail(&id, e, attempt);
                        }
                        continue;
                    }

                    let failure_type = classify_error(&error);
                    if failure_type == FailureType::Permanent {
                        return self.fail(&id, error, attempt);
                    }

                    match self
                        .policy
                        .should_retry(failure_type, attempt, retry_after_delay(&error))
                    {
                        RetryDecision::DoNotRetry { reason } => {
                            debug!(%id, %reason, "giving up");
                            return self.fail(&id, error, attempt);
                        }
                        RetryDecision::Retry {
                            delay,
                            attempt: next,
                        } => {
                            info!(%id, attempt = next, delay_ms = delay.as_millis(), error = %error, "retrying");
                            tokio::select! {
                                () = cancel.cancelled() => {
                                    let bytes = file_len(&part_path);
                                    self.checkpoint_paused(&id, bytes, destination, on_progress);
                                    return Outcome::Cancelled { bytes_downloaded: bytes };
                                }
                                () = tokio::time::sleep(delay) => {}
                            }
                            attempt = next;
                        }
                    }
                }
            }
        }
    }

    /// One probe+stream attempt. `Err` means the attempt failed and the
    /// caller decides on a retry.
    async fn attempt(
        &self,
        url: &str,
        id: &str,
        destination: &Path,
        part_path: &Path,
        cancel: &CancellationToken,
        on_progress: Option<&ProgressSink>,
    ) -> Result<AttemptEnd, DownloadError> {
        let mut partial = file_len(part_path);
        let probed = probe(&self.client, url, partial).await?;

        if probed.already_complete {
            // HTTP 416 on our range. Only a prefix whose length equals the
            // server's total is actually the complete file; a longer prefix
            // means the resource shrank since those bytes were written.
            if probed.total_size.is_none_or(|total| total == partial) {
                return Ok(AttemptEnd::Done(self.finalize(
                    id,
                    part_path,
                    destination,
                    probed.total_size.unwrap_or(partial),
                    on_progress,
                )?));
            }
            warn!(
                %id,
                partial,
                total = ?probed.total_size,
                "range unsatisfiable but partial length disagrees with remote total, restarting from zero"
            );
            self.reset_partial(id, part_path)?;
            partial = 0;
        }

        let recorded_total = self.store.get(id).map_or(0, |r| r.total_size);
        let offset = resume_offset(partial, &probed, recorded_total);
        if offset == 0 && partial > 0 {
            info!(%id, partial, "partial prefix not trustworthy, restarting from zero");
            self.reset_partial(id, part_path)?;
        }

        let chunk_base = self.store.get(id).map_or(0, |r| r.chunks);
        let chunk_base = if offset == 0 { 0 } else { chunk_base };
        if let Some(total) = probed.total_size {
            self.store
                .upsert(
                    id,
                    &RecordPatch {
                        total_size: Some(total),
                        ..RecordPatch::default()
                    },
                )
                .map_err(DownloadError::from_state)?;
        }

        let display_name = display_name(destination);
        let estimator = RateEstimator::new(offset);
        let mut last_checkpoint = Instant::now();
        let mut first_chunk = true;
        let store = Arc::clone(&self.store);
        let interval = self.config.checkpoint_interval;
        let id_owned = id.to_string();

        let on_chunk = |_chunk_bytes: u64, cumulative: u64| {
            // Throttle ledger writes and progress events; byte math itself
            // is exact on every chunk because cumulative is recomputed from
            // the stream, not from the ledger.
            let due = first_chunk || last_checkpoint.elapsed() >= interval;
            if !due {
                return;
            }
            first_chunk = false;
            last_checkpoint = Instant::now();

            let chunk_size = self.config.chunk_size.max(1) as u64;
            let chunks = chunk_base + cumulative.saturating_sub(offset).div_ceil(chunk_size);
            if let Err(e) = store.upsert(&id_owned, &RecordPatch::checkpoint(cumulative, chunks)) {
                // A failed mid-stream checkpoint costs resume granularity,
                // not correctness; the terminal write will surface real
                // ledger problems.
                warn!(id = %id_owned, error = %e, "checkpoint write failed");
            }
            if let Some(sink) = on_progress {
                sink(ProgressEvent {
                    display_name: display_name.clone(),
                    downloaded_bytes: cumulative,
                    total_bytes: probed.total_size,
                    rate_label: estimator.rate_label(cumulative),
                    status_label: "downloading",
                });
            }
        };

        match stream_to_part(
            &self.client,
            url,
            part_path,
            offset,
            self.config.chunk_size,
            cancel,
            on_chunk,
        )
        .await?
        {
            StreamEnd::Cancelled(outcome) => Ok(AttemptEnd::Paused {
                bytes_downloaded: offset + outcome.bytes_written,
            }),
            StreamEnd::Finished(_) => {
                let actual = file_len(part_path);
                if let Some(total) = probed.total_size {
                    if actual != total {
                        return Err(DownloadError::verification(part_path, total, actual));
                    }
                }
                Ok(AttemptEnd::Done(self.finalize(
                    id,
                    part_path,
                    destination,
                    actual,
                    on_progress,
                )?))
            }
        }
    }

    /// Promotes the partial file to the destination and marks the record
    /// completed.
    fn finalize(
        &self,
        id: &str,
        part_path: &Path,
        destination: &Path,
        total_bytes: u64,
        on_progress: Option<&ProgressSink>,
    ) -> Result<Outcome, DownloadError> {
        if part_path.exists() {
            std::fs::rename(part_path, destination)
                .map_err(|e| DownloadError::io(destination, e))?;
        }

        let record = self.store.get(id);
        self.store
            .upsert(
                id,
                &RecordPatch {
                    total_size: Some(total_bytes),
                    downloaded_size: Some(total_bytes),
                    status: Some(DownloadStatus::Completed),
                    error: Some(None),
                    chunks: record.map(|r| r.chunks.max(1)),
                },
            )
            .map_err(DownloadError::from_state)?;

        if let Some(sink) = on_progress {
            sink(ProgressEvent {
                display_name: display_name(destination),
                downloaded_bytes: total_bytes,
                total_bytes: Some(total_bytes),
                rate_label: String::new(),
                status_label: "completed",
            });
        }

        info!(%id, total_bytes, "download completed");
        Ok(Outcome::Completed {
            final_path: destination.to_path_buf(),
            bytes_downloaded: total_bytes,
        })
    }

    /// Removes the partial file and zeroes the record's counters.
    fn reset_partial(&self, id: &str, part_path: &Path) -> Result<(), DownloadError> {
        if part_path.exists() {
            std::fs::remove_file(part_path).map_err(|e| DownloadError::io(part_path, e))?;
        }
        self.store
            .upsert(
                id,
                &RecordPatch {
                    downloaded_size: Some(0),
                    chunks: Some(0),
                    ..RecordPatch::default()
                },
            )
            .map_err(DownloadError::from_state)?;
        Ok(())
    }

    /// Terminal failure: record it in the ledger and build the outcome.
    fn fail(&self, id: &str, error: DownloadError, attempts: u32) -> Outcome {
        let patch = RecordPatch {
            status: Some(DownloadStatus::Failed),
            error: Some(Some(error.to_string())),
            ..RecordPatch::default()
        };
        if let Err(e) = self.store.upsert(id, &patch) {
            warn!(%id, error = %e, "could not record failure in ledger");
        }
        warn!(%id, attempts, error = %error, "download failed");
        Outcome::Failed { error, attempts }
    }

    /// Pause checkpoint after cancellation: flushable bytes are already on
    /// disk, so only the status and counters move.
    fn checkpoint_paused(
        &self,
        id: &str,
        bytes_downloaded: u64,
        destination: &Path,
        on_progress: Option<&ProgressSink>,
    ) {
        let patch = RecordPatch {
            downloaded_size: Some(bytes_downloaded),
            status: Some(DownloadStatus::Paused),
            ..RecordPatch::default()
        };
        if let Err(e) = self.store.upsert(id, &patch) {
            warn!(%id, error = %e, "could not record pause in ledger");
        }
        if let Some(sink) = on_progress {
            let total = self.store.get(id).map(|r| r.total_size).filter(|t| *t > 0);
            sink(ProgressEvent {
                display_name: display_name(destination),
                downloaded_bytes: bytes_downloaded,
                total_bytes: total,
                rate_label: String::new(),
                status_label: "paused",
            });
        }
        info!(%id, bytes_downloaded, "download paused");
    }
}

enum AttemptEnd {
    Done(Outcome),
    Paused { bytes_downloaded: u64 },
}

/// Decides the resume offset for an attempt.
///
/// The partial prefix is trusted only when all of these hold: the server
/// honors ranges, the prefix is strictly shorter than the probed total, and
/// the total recorded at checkpoint time (when known) matches the probed
/// total. Anything else restarts from zero.
fn resume_offset(partial: u64, probed: &ProbeResult, recorded_total: u64) -> u64 {
    if partial == 0 || !probed.supports_range {
        return 0;
    }
    match probed.total_size {
        Some(total) => {
            if partial >= total {
                return 0;
            }
            if recorded_total > 0 && recorded_total != total {
                // Resource changed size since the checkpoint; the prefix may
                // belong to different content.
                return 0;
            }
            partial
        }
        // Unknown total: a range-capable server plus a prefix is the best
        // evidence available.
        None => partial,
    }
}

fn is_http_url(raw: &str) -> bool {
    Url::parse(raw)
        .map(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some())
        .unwrap_or(false)
}

fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).map_or(0, |m| m.len())
}

fn display_name(destination: &Path) -> String {
    destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| destination.display().to_string())
}
