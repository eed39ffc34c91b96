//! Durable download-state ledger.
//!
//! Maps a download id to its last known progress and survives process
//! restart. Every [`StateStore::upsert`] is fully persisted before the call
//! returns: the resume offset is derived from this ledger (cross-checked
//! against the actual file length), so a crash immediately after a
//! checkpoint must not lose that checkpoint.
//!
//! The ledger is a pretty-printed JSON document under the user's
//! configuration area, deliberately separate from the download directory so
//! state survives a cleared downloads folder. Entries are never
//! auto-evicted; removal is an explicit caller action.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::download::constants::PART_SUFFIX;

/// Errors from ledger operations.
#[derive(Debug, Error)]
pub enum StateError {
    /// File system error reading or writing the ledger.
    #[error("state ledger IO error at {path}: {source}")]
    Io {
        /// Ledger (or lock) file path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The ledger document could not be serialized or parsed.
    #[error("state ledger serialization error at {path}: {source}")]
    Serialize {
        /// Ledger file path.
        path: PathBuf,
        /// The underlying serde error.
        #[source]
        source: serde_json::Error,
    },

    /// A status change violated the download state machine.
    #[error("invalid status transition for {id}: {from:?} -> {to:?}")]
    InvalidTransition {
        /// Download id whose record rejected the change.
        id: String,
        /// Current status.
        from: DownloadStatus,
        /// Requested status.
        to: DownloadStatus,
    },
}

/// Lifecycle status of a download record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    /// Record created, no bytes transferred yet.
    Started,
    /// Bytes are flowing (or were, when the process last ran).
    Downloading,
    /// Transfer suspended by the user; counters preserved.
    Paused,
    /// Terminal: byte count and on-disk size both match the total.
    Completed,
    /// Terminal for the attempt; a fresh attempt reuses the same record.
    Failed,
}

impl DownloadStatus {
    /// Whether a transition from `self` to `next` is allowed.
    ///
    /// `completed` is set-once; the only exit is an explicit re-request
    /// (`completed -> started`) after the destination file stopped matching
    /// the record. `failed` re-enters `downloading` on a fresh attempt.
    #[must_use]
    pub fn can_transition(self, next: Self) -> bool {
        use DownloadStatus::{Completed, Downloading, Failed, Paused, Started};
        match (self, next) {
            (Completed, Completed | Started) => true,
            (Completed, _) => false,
            (Failed, Started | Downloading | Failed) => true,
            (Failed, _) => false,
            (Paused, Downloading | Paused | Failed | Started) => true,
            (Paused, Completed) => false,
            (Started | Downloading, _) => true,
        }
    }

    /// Terminal statuses end a coordinator run.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One download's persisted progress.
///
/// Field names match the on-disk document layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRecord {
    /// Source URL, immutable after creation.
    pub url: String,
    /// Final destination path, immutable after creation.
    pub filepath: String,
    /// Total resource size in bytes; 0 while unknown.
    #[serde(default)]
    pub total_size: u64,
    /// Bytes confirmed written; non-decreasing except on explicit reset.
    #[serde(default)]
    pub downloaded_size: u64,
    /// Chunk writes applied so far; a coarse heartbeat independent of bytes.
    #[serde(default)]
    pub chunks: u64,
    /// Current lifecycle status.
    pub status: DownloadStatus,
    /// When the record was created.
    pub started_at: DateTime<Utc>,
    /// When the record was last checkpointed.
    pub last_update: DateTime<Utc>,
    /// Set once, on verified completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Last failure message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Partial update merged into an existing record by [`StateStore::upsert`].
///
/// Omitted fields retain their prior values.
#[derive(Debug, Clone, Default)]
pub struct RecordPatch {
    /// New total size (a fresh probe wins over a stale one).
    pub total_size: Option<u64>,
    /// New cumulative byte count.
    pub downloaded_size: Option<u64>,
    /// New chunk count.
    pub chunks: Option<u64>,
    /// New status (validated against the state machine).
    pub status: Option<DownloadStatus>,
    /// New failure message; `Some(None)` clears a stale one.
    pub error: Option<Option<String>>,
}

impl RecordPatch {
    /// Patch that only moves the status.
    #[must_use]
    pub fn status(status: DownloadStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Patch for a chunk checkpoint.
    #[must_use]
    pub fn checkpoint(downloaded_size: u64, chunks: u64) -> Self {
        Self {
            downloaded_size: Some(downloaded_size),
            chunks: Some(chunks),
            status: Some(DownloadStatus::Downloading),
            ..Self::default()
        }
    }
}

/// A download whose record plus on-disk partial file indicate it can safely
/// continue rather than restart.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeCandidate {
    /// Download id.
    pub id: String,
    /// Source URL.
    pub url: String,
    /// Final destination path.
    pub filepath: PathBuf,
    /// Bytes already on disk.
    pub partial_size: u64,
    /// Recorded total size (0 if unknown).
    pub total_size: u64,
    /// Recorded chunk count.
    pub chunks: u64,
    /// Percent complete, 0.0 when the total is unknown.
    pub progress_percent: f64,
}

/// Durable key-value ledger of download progress.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    records: Mutex<BTreeMap<String, DownloadRecord>>,
}

impl StateStore {
    /// Opens (or creates) the ledger at `path`, loading any existing
    /// document.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] if the parent directory cannot be created or
    /// an existing document cannot be read. A corrupt document is treated
    /// as empty with a warning rather than an error, so one bad write never
    /// bricks the engine.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StateError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let records = if path.exists() {
            let _lock = LedgerLock::acquire(&path)?;
            let raw = fs::read_to_string(&path).map_err(|e| StateError::Io {
                path: path.clone(),
                source: e,
            })?;
            match serde_json::from_str(&raw) {
                Ok(map) => map,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "state ledger unreadable, starting empty");
                    BTreeMap::new()
                }
            }
        } else {
            BTreeMap::new()
        };

        debug!(path = %path.display(), entries = records.len(), "state ledger loaded");
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    /// Opens the ledger at its well-known per-user location.
    ///
    /// # Errors
    ///
    /// Returns the same errors as [`open`](Self::open).
    pub fn open_default() -> Result<Self, StateError> {
        Self::open(Self::default_path())
    }

    /// Well-known ledger path under the user's configuration area.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("downdraft")
            .join("downloads.json")
    }

    /// Stable download id for a (url, destination) pair.
    #[must_use]
    pub fn download_id(url: &str, filepath: &Path) -> String {
        format!("{}|{}", url, filepath.display())
    }

    /// Returns a copy of the record for `id`, if present.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<DownloadRecord> {
        self.lock().get(id).cloned()
    }

    /// Returns a copy of every record in the ledger.
    #[must_use]
    pub fn all(&self) -> BTreeMap<String, DownloadRecord> {
        self.lock().clone()
    }

    /// Creates a record for a newly requested download, or refreshes an
    /// existing one for a fresh attempt (counters preserved).
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] if the record cannot leave its current status
    /// or the ledger cannot be persisted.
    pub fn begin(
        &self,
        id: &str,
        url: &str,
        filepath: &Path,
        total_size: u64,
    ) -> Result<DownloadRecord, StateError> {
        let mut records = self.lock();
        let now = Utc::now();

        let record = match records.get_mut(id) {
            Some(existing) => {
                if !existing.status.can_transition(DownloadStatus::Started) {
                    return Err(StateError::InvalidTransition {
                        id: id.to_string(),
                        from: existing.status,
                        to: DownloadStatus::Started,
                    });
                }
                existing.status = DownloadStatus::Started;
                existing.total_size = total_size;
                existing.completed_at = None;
                existing.error = None;
                existing.last_update = now;
                existing.clone()
            }
            None => {
                let record = DownloadRecord {
                    url: url.to_string(),
                    filepath: filepath.display().to_string(),
                    total_size,
                    downloaded_size: 0,
                    chunks: 0,
                    status: DownloadStatus::Started,
                    started_at: now,
                    last_update: now,
                    completed_at: None,
                    error: None,
                };
                records.insert(id.to_string(), record.clone());
                record
            }
        };

        self.persist(&records)?;
        Ok(record)
    }

    /// Merges `patch` into the record for `id` and persists the full ledger
    /// before returning.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::InvalidTransition`] when the patch's status
    /// violates the state machine, and IO/serialization errors when the
    /// document cannot be written.
    pub fn upsert(&self, id: &str, patch: &RecordPatch) -> Result<DownloadRecord, StateError> {
        let mut records = self.lock();
        let Some(record) = records.get_mut(id) else {
            return Err(StateError::Io {
                path: self.path.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no record for download id {id}"),
                ),
            });
        };

        if let Some(next) = patch.status {
            if !record.status.can_transition(next) {
                return Err(StateError::InvalidTransition {
                    id: id.to_string(),
                    from: record.status,
                    to: next,
                });
            }
            if next == DownloadStatus::Completed && record.completed_at.is_none() {
                record.completed_at = Some(Utc::now());
            }
            record.status = next;
        }
        if let Some(total) = patch.total_size {
            record.total_size = total;
        }
        if let Some(downloaded) = patch.downloaded_size {
            record.downloaded_size = downloaded;
        }
        if let Some(chunks) = patch.chunks {
            record.chunks = chunks;
        }
        if let Some(error) = &patch.error {
            record.error = error.clone();
        }
        record.last_update = Utc::now();

        let snapshot = record.clone();
        self.persist(&records)?;
        Ok(snapshot)
    }

    /// Removes the record for `id`. Explicit removal is the only way an
    /// entry ever leaves the ledger.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] if the ledger cannot be persisted.
    pub fn remove(&self, id: &str) -> Result<bool, StateError> {
        let mut records = self.lock();
        let removed = records.remove(id).is_some();
        if removed {
            self.persist(&records)?;
        }
        Ok(removed)
    }

    /// Cross-references records in `{downloading, paused}` against actual
    /// on-disk sizes and returns only the genuinely resumable ones.
    ///
    /// When `destination_dir` is given, only records whose destination lives
    /// under it are considered.
    #[must_use]
    pub fn find_resumable(&self, destination_dir: Option<&Path>) -> Vec<ResumeCandidate> {
        let records = self.lock();
        let mut candidates = Vec::new();

        for (id, record) in records.iter() {
            if !matches!(
                record.status,
                DownloadStatus::Downloading | DownloadStatus::Paused
            ) {
                continue;
            }

            let filepath = PathBuf::from(&record.filepath);
            if let Some(dir) = destination_dir {
                if !filepath.starts_with(dir) {
                    continue;
                }
            }

            let part_path = partial_path(&filepath);
            let partial_size = if let Ok(meta) = fs::metadata(&part_path) {
                meta.len()
            } else if let Ok(meta) = fs::metadata(&filepath) {
                meta.len()
            } else {
                continue;
            };

            // Resumable only while strictly short of the recorded total.
            if record.total_size > 0 && partial_size >= record.total_size {
                continue;
            }

            let progress_percent = if record.total_size > 0 {
                partial_size as f64 / record.total_size as f64 * 100.0
            } else {
                0.0
            };

            candidates.push(ResumeCandidate {
                id: id.clone(),
                url: record.url.clone(),
                filepath,
                partial_size,
                total_size: record.total_size,
                chunks: record.chunks,
                progress_percent,
            });
        }

        candidates
    }

    /// Ledger file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, DownloadRecord>> {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Writes the full mapping durably: serialize, write to a sibling temp
    /// file, fsync, rename over the document. Holds the advisory file lock
    /// so concurrent processes cannot interleave writes.
    fn persist(&self, records: &BTreeMap<String, DownloadRecord>) -> Result<(), StateError> {
        let _lock = LedgerLock::acquire(&self.path)?;

        let body = serde_json::to_vec_pretty(records).map_err(|e| StateError::Serialize {
            path: self.path.clone(),
            source: e,
        })?;

        let tmp_path = self.path.with_extension("json.tmp");
        let io_err = |path: &Path, e: std::io::Error| StateError::Io {
            path: path.to_path_buf(),
            source: e,
        };

        let mut tmp = File::create(&tmp_path).map_err(|e| io_err(&tmp_path, e))?;
        tmp.write_all(&body).map_err(|e| io_err(&tmp_path, e))?;
        tmp.sync_all().map_err(|e| io_err(&tmp_path, e))?;
        drop(tmp);

        fs::rename(&tmp_path, &self.path).map_err(|e| io_err(&self.path, e))?;
        Ok(())
    }
}

/// Path of the in-progress sibling for a destination file.
#[must_use]
pub fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(PART_SUFFIX);
    destination.with_file_name(name)
}

/// Advisory lock on the ledger, released on drop.
struct LedgerLock {
    file: File,
}

impl LedgerLock {
    fn acquire(ledger_path: &Path) -> Result<Self, StateError> {
        let lock_path = ledger_path.with_extension("json.lock");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| StateError::Io {
                path: lock_path.clone(),
                source: e,
            })?;
        file.lock_exclusive().map_err(|e| StateError::Io {
            path: lock_path,
            source: e,
        })?;
        Ok(Self { file })
    }
}

impl Drop for LedgerLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}
