//! Constants for the download engine (timeouts, chunking, retry defaults).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (5 minutes for large files).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Default transfer chunk size (1 MiB).
///
/// Chunk size is a tuning knob, not a correctness parameter: larger chunks
/// reduce checkpoint frequency but do not change resume semantics.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Default maximum retry attempts for transient failures.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay for exponential backoff (1 second).
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Default backoff delay cap (32 seconds).
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(32);

/// Default minimum interval between state checkpoints and progress events.
///
/// Cumulative byte counters update on every chunk regardless; this only
/// throttles how often the ledger is rewritten and the sink is notified.
pub const DEFAULT_CHECKPOINT_INTERVAL: Duration = Duration::from_millis(500);

/// Maximum honored Retry-After header value (1 hour) to prevent excessive delays.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Suffix appended to the destination path while a transfer is incomplete.
pub const PART_SUFFIX: &str = ".part";
