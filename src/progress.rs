//! Progress events and human-readable size/rate formatting.
//!
//! Events are ephemeral and purely informational: the engine never reads
//! them back, and resume math never depends on them. Sinks must return
//! promptly; a slow sink stalls the transfer loop.

use std::time::Instant;

/// Snapshot of a transfer's progress, emitted per (throttled) checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    /// Display name of the resource (usually the destination filename).
    pub display_name: String,
    /// Cumulative bytes written so far, including any resumed prefix.
    pub downloaded_bytes: u64,
    /// Total resource size when known; `None` while the server has not
    /// reported one.
    pub total_bytes: Option<u64>,
    /// Human-readable transfer rate, e.g. `"1.2 MB/s"`.
    pub rate_label: String,
    /// Human-readable status, e.g. `"downloading"`, `"paused"`.
    pub status_label: &'static str,
}

impl ProgressEvent {
    /// Percent complete, when the total is known and nonzero.
    #[must_use]
    pub fn percent(&self) -> Option<f64> {
        match self.total_bytes {
            Some(total) if total > 0 => {
                Some(self.downloaded_bytes as f64 / total as f64 * 100.0)
            }
            _ => None,
        }
    }
}

/// Callback consuming progress events.
///
/// Must tolerate out-of-order delivery across different downloads; events
/// for a single download arrive in non-decreasing `downloaded_bytes` order.
pub type ProgressSink = dyn Fn(ProgressEvent) + Send + Sync;

/// Estimates the average transfer rate for one attempt.
#[derive(Debug)]
pub struct RateEstimator {
    started: Instant,
    base_bytes: u64,
}

impl RateEstimator {
    /// Starts estimating from `base_bytes` (the resume offset).
    #[must_use]
    pub fn new(base_bytes: u64) -> Self {
        Self {
            started: Instant::now(),
            base_bytes,
        }
    }

    /// Average bytes per second since the attempt started.
    #[must_use]
    pub fn bytes_per_second(&self, cumulative_bytes: u64) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        cumulative_bytes.saturating_sub(self.base_bytes) as f64 / elapsed
    }

    /// Formatted rate label for the current cumulative byte count.
    #[must_use]
    pub fn rate_label(&self, cumulative_bytes: u64) -> String {
        format_rate(self.bytes_per_second(cumulative_bytes))
    }
}

/// Formats a byte count with binary units and one decimal, e.g. `"1.5 MB"`.
#[must_use]
pub fn format_size(bytes: u64) -> String {
    if bytes == 0 {
        return "0 B".to_string();
    }
    let mut value = bytes as f64;
    for unit in ["B", "KB", "MB", "GB", "TB"] {
        if value < 1024.0 {
            return format!("{value:.1} {unit}");
        }
        value /= 1024.0;
    }
    format!("{value:.1} PB")
}

/// Formats a transfer rate, e.g. `"340.2 KB/s"`.
#[must_use]
pub fn format_rate(bytes_per_second: f64) -> String {
    format!("{}/s", format_size(bytes_per_second.max(0.0) as u64))
}

/// Formats a duration in seconds as `"42s"`, `"3m 10s"`, or `"1h 5m"`.
#[must_use]
pub fn format_duration(seconds: f64) -> String {
    let secs = seconds.max(0.0);
    if secs < 60.0 {
        format!("{secs:.0}s")
    } else if secs < 3600.0 {
        format!("{:.0}m {:.0}s", (secs / 60.0).floor(), secs % 60.0)
    } else {
        format!(
            "{:.0}h {:.0}m",
            (secs / 3600.0).floor(),
            ((secs % 3600.0) / 60.0).floor()
        )
    }
}
