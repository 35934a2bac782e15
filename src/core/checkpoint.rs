//! Durable per-export progress records.
//!
//! A checkpoint file is replaced atomically on every save: the document is
//! written to a temporary sibling, synced, then renamed over the target. A
//! reader therefore only ever sees the previous or the new complete version.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Format version written by this build.
pub const CHECKPOINT_VERSION: &str = "1.0";

const CHECKPOINT_MAJOR: &str = "1";

const HASH_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("checkpoint {} is corrupt: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("checkpoint {} has version {found}, expected {expected}", path.display())]
    IncompatibleVersion {
        path: PathBuf,
        found: String,
        expected: &'static str,
    },

    #[error("checkpoint {}: {context}: {source}", path.display())]
    Io {
        path: PathBuf,
        context: &'static str,
        #[source]
        source: io::Error,
    },
}

impl CheckpointError {
    fn io(path: &Path, context: &'static str, source: io::Error) -> Self {
        CheckpointError::Io {
            path: path.to_path_buf(),
            context,
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    #[default]
    Pending,
    Downloading,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FileCheckpoint {
    /// Destination, relative to the checkpoint's output path when possible.
    pub path: String,
    pub source: String,
    pub total_size: u64,
    pub downloaded_size: u64,
    pub checksum: Option<String>,
    pub status: FileStatus,
    pub last_modified: Option<DateTime<Utc>>,
    pub retry_count: u32,
}

impl FileCheckpoint {
    pub fn is_completed(&self) -> bool {
        self.status == FileStatus::Completed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Checkpoint {
    pub version: String,
    pub subject_name: String,
    pub provider: String,
    pub format: String,
    pub output_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub files: Vec<FileCheckpoint>,
}

impl Checkpoint {
    pub fn new(
        subject_name: impl Into<String>,
        provider: impl Into<String>,
        format: impl Into<String>,
        output_path: impl Into<PathBuf>,
    ) -> Self {
        let now = Utc::now();
        Self {
            version: CHECKPOINT_VERSION.to_string(),
            subject_name: subject_name.into(),
            provider: provider.into(),
            format: format.into(),
            output_path: output_path.into(),
            created_at: now,
            updated_at: now,
            metadata: BTreeMap::new(),
            files: Vec::new(),
        }
    }

    /// Key under which `destination` is tracked.
    pub fn key_for(&self, destination: &Path) -> String {
        entry_key(&self.output_path, destination)
    }

    /// Register a file. An existing entry keeps its progress unless its
    /// total size changed, in which case it starts over. A `total_size` of 0
    /// means unknown and leaves a recorded size alone.
    pub fn add_file(&mut self, path: impl Into<String>, source: impl Into<String>, total_size: u64) {
        let path = path.into();
        let source = source.into();
        self.updated_at = Utc::now();
        if let Some(entry) = self.file_mut(&path) {
            entry.source = source;
            if total_size > 0 && entry.total_size != total_size {
                entry.total_size = total_size;
                entry.downloaded_size = 0;
                entry.checksum = None;
                entry.status = FileStatus::Pending;
            }
            return;
        }
        self.files.push(FileCheckpoint {
            path,
            source,
            total_size,
            ..FileCheckpoint::default()
        });
    }

    pub fn file(&self, path: &str) -> Option<&FileCheckpoint> {
        self.files.iter().find(|f| f.path == path)
    }

    pub fn file_mut(&mut self, path: &str) -> Option<&mut FileCheckpoint> {
        self.files.iter_mut().find(|f| f.path == path)
    }

    /// Record `downloaded` bytes for `path`, clamped to the total size.
    /// While the total is unknown the downloaded size stays at 0, so such a
    /// file restarts rather than resumes. Returns false when the file is not
    /// tracked.
    pub fn update_file_progress(&mut self, path: &str, downloaded: u64) -> bool {
        let now = Utc::now();
        let Some(entry) = self.file_mut(path) else {
            return false;
        };
        entry.downloaded_size = downloaded.min(entry.total_size);
        if entry.status != FileStatus::Completed {
            entry.status = FileStatus::Downloading;
        }
        entry.last_modified = Some(now);
        self.updated_at = now;
        true
    }

    /// Change the status of `path`. Completing an entry also pins its
    /// downloaded size to the total.
    pub fn mark_status(&mut self, path: &str, status: FileStatus) -> bool {
        let now = Utc::now();
        let Some(entry) = self.file_mut(path) else {
            return false;
        };
        if status == FileStatus::Completed {
            if entry.total_size == 0 {
                entry.total_size = entry.downloaded_size;
            }
            entry.downloaded_size = entry.total_size;
        }
        if status == FileStatus::Pending {
            entry.downloaded_size = 0;
            entry.checksum = None;
        }
        entry.status = status;
        entry.last_modified = Some(now);
        self.updated_at = now;
        true
    }

    /// Fill in the size of an entry registered without one. A size that is
    /// already known is kept.
    pub fn record_total_size(&mut self, path: &str, total_size: u64) -> bool {
        let Some(entry) = self.file_mut(path) else {
            return false;
        };
        if entry.total_size == 0 {
            entry.total_size = total_size;
        }
        true
    }

    pub fn set_checksum(&mut self, path: &str, checksum: String) {
        if let Some(entry) = self.file_mut(path) {
            entry.checksum = Some(checksum);
        }
    }

    pub fn record_retry(&mut self, path: &str) {
        if let Some(entry) = self.file_mut(path) {
            entry.retry_count += 1;
        }
    }

    pub fn is_complete(&self) -> bool {
        self.files.iter().all(FileCheckpoint::is_completed)
    }

    /// Fraction of bytes downloaded across all files, in `0.0..=1.0`.
    pub fn progress(&self) -> f64 {
        let total: u64 = self.files.iter().map(|f| f.total_size).sum();
        if total == 0 {
            return if self.is_complete() { 1.0 } else { 0.0 };
        }
        let downloaded: u64 = self.files.iter().map(|f| f.downloaded_size).sum();
        (downloaded as f64 / total as f64).min(1.0)
    }

    fn validate(&self, path: &Path) -> Result<(), CheckpointError> {
        if !self.version.is_empty() && self.version.split('.').next() != Some(CHECKPOINT_MAJOR) {
            return Err(CheckpointError::IncompatibleVersion {
                path: path.to_path_buf(),
                found: self.version.clone(),
                expected: CHECKPOINT_VERSION,
            });
        }
        for entry in &self.files {
            if entry.downloaded_size > entry.total_size {
                return Err(CheckpointError::Corrupt {
                    path: path.to_path_buf(),
                    reason: format!(
                        "{}: downloaded {} exceeds total {}",
                        entry.path, entry.downloaded_size, entry.total_size
                    ),
                });
            }
            if entry.is_completed() && entry.downloaded_size != entry.total_size {
                return Err(CheckpointError::Corrupt {
                    path: path.to_path_buf(),
                    reason: format!("{}: completed with {} of {} bytes", entry.path, entry.downloaded_size, entry.total_size),
                });
            }
        }
        Ok(())
    }
}

/// Path of `destination` relative to `output_path`, or the full path when it
/// lives elsewhere.
pub fn entry_key(output_path: &Path, destination: &Path) -> String {
    destination
        .strip_prefix(output_path)
        .unwrap_or(destination)
        .to_string_lossy()
        .into_owned()
}

/// File-level operations on checkpoint documents.
pub struct CheckpointStore;

impl CheckpointStore {
    /// `{output_dir}/.{subject}.checkpoint`
    pub fn default_path(output_dir: &Path, subject: &str) -> PathBuf {
        output_dir.join(format!(".{subject}.checkpoint"))
    }

    pub fn exists(path: &Path) -> bool {
        path.is_file()
    }

    /// Atomically replace the checkpoint at `path`.
    pub fn save(checkpoint: &Checkpoint, path: &Path) -> Result<(), CheckpointError> {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent)
            .map_err(|e| CheckpointError::io(path, "create checkpoint directory", e))?;

        let json = serde_json::to_vec_pretty(checkpoint)
            .map_err(|e| CheckpointError::io(path, "serialize checkpoint", io::Error::other(e)))?;

        let mut temp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| CheckpointError::io(path, "create temp file", e))?;
        temp.write_all(&json)
            .map_err(|e| CheckpointError::io(path, "write temp file", e))?;
        temp.flush()
            .map_err(|e| CheckpointError::io(path, "flush temp file", e))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| CheckpointError::io(path, "sync temp file", e))?;
        temp.persist(path)
            .map_err(|e| CheckpointError::io(path, "rename temp file", e.error))?;

        if let Ok(dir) = std::fs::File::open(parent) {
            let _ = dir.sync_all();
        }

        debug!(path = %path.display(), files = checkpoint.files.len(), "checkpoint saved");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Checkpoint, CheckpointError> {
        let contents = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CheckpointError::NotFound {
                    path: path.to_path_buf(),
                });
            }
            Err(e) => return Err(CheckpointError::io(path, "read checkpoint", e)),
        };

        let checkpoint: Checkpoint =
            serde_json::from_slice(&contents).map_err(|e| CheckpointError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        checkpoint.validate(path)?;

        info!(
            path = %path.display(),
            files = checkpoint.files.len(),
            progress_pct = checkpoint.progress() * 100.0,
            "checkpoint loaded"
        );
        Ok(checkpoint)
    }

    /// Remove the checkpoint. A missing file is fine.
    pub fn delete(path: &Path) -> Result<(), CheckpointError> {
        match std::fs::remove_file(path) {
            Ok(()) => {
                debug!(path = %path.display(), "checkpoint deleted");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CheckpointError::io(path, "delete checkpoint", e)),
        }
    }
}

/// Hex BLAKE3 digest of the file at `path`.
pub fn file_checksum(path: &Path) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

struct SharedState {
    checkpoint: Checkpoint,
    last_save: Instant,
}

/// A checkpoint shared by all workers of a pool.
///
/// Every mutation and save happens under one lock, so each save is a
/// consistent snapshot. With a zero interval the document is saved whenever a
/// file finishes; otherwise progress updates also save once the interval has
/// elapsed since the previous save.
pub struct SharedCheckpoint {
    state: Mutex<SharedState>,
    path: PathBuf,
    interval: Duration,
    output_path: PathBuf,
}

impl SharedCheckpoint {
    pub fn new(checkpoint: Checkpoint, path: PathBuf, interval: Duration) -> Self {
        let output_path = checkpoint.output_path.clone();
        Self {
            state: Mutex::new(SharedState {
                checkpoint,
                last_save: Instant::now(),
            }),
            path,
            interval,
            output_path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn key_for(&self, destination: &Path) -> String {
        entry_key(&self.output_path, destination)
    }

    pub async fn snapshot(&self) -> Checkpoint {
        self.state.lock().await.checkpoint.clone()
    }

    /// Save now, regardless of cadence.
    pub async fn save(&self) -> Result<(), CheckpointError> {
        let mut state = self.state.lock().await;
        self.persist(&mut state).await
    }

    async fn persist(&self, state: &mut SharedState) -> Result<(), CheckpointError> {
        let snapshot = state.checkpoint.clone();
        let path = self.path.clone();
        let result = tokio::task::spawn_blocking(move || CheckpointStore::save(&snapshot, &path))
            .await
            .map_err(|e| CheckpointError::io(&self.path, "checkpoint save task", io::Error::other(e)))?;
        if result.is_ok() {
            state.last_save = Instant::now();
        }
        result
    }

    fn interval_due(&self, state: &SharedState) -> bool {
        !self.interval.is_zero() && state.last_save.elapsed() >= self.interval
    }

    pub async fn mark_downloading(&self, key: &str) {
        let mut state = self.state.lock().await;
        state.checkpoint.mark_status(key, FileStatus::Downloading);
    }

    /// Record progress, saving when the interval is due.
    pub async fn update_progress(&self, key: &str, downloaded: u64) {
        let mut state = self.state.lock().await;
        state.checkpoint.update_file_progress(key, downloaded);
        if self.interval_due(&state) {
            if let Err(e) = self.persist(&mut state).await {
                warn!(error = %e, "periodic checkpoint save failed");
            }
        }
    }

    /// Size reported by the source for a file registered without one.
    pub async fn record_total_size(&self, key: &str, total_size: u64) {
        self.state.lock().await.checkpoint.record_total_size(key, total_size);
    }

    /// `size` is the final length of the file; it becomes the entry's total
    /// when none was known.
    pub async fn mark_completed(&self, key: &str, size: u64, checksum: Option<String>) {
        let mut state = self.state.lock().await;
        state.checkpoint.record_total_size(key, size);
        state.checkpoint.mark_status(key, FileStatus::Completed);
        if let Some(checksum) = checksum {
            state.checkpoint.set_checksum(key, checksum);
        }
        if self.interval.is_zero() || self.interval_due(&state) {
            if let Err(e) = self.persist(&mut state).await {
                warn!(file = key, error = %e, "checkpoint save after completion failed");
            }
        }
    }

    pub async fn record_retry(&self, key: &str) {
        self.state.lock().await.checkpoint.record_retry(key);
    }

    pub async fn mark_failed(&self, key: &str) {
        let mut state = self.state.lock().await;
        state.checkpoint.mark_status(key, FileStatus::Failed);
        if let Err(e) = self.persist(&mut state).await {
            warn!(file = key, error = %e, "checkpoint save after failure failed");
        }
    }
}
