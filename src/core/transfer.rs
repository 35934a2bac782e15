//! Transfer tasks and the per-task download algorithm.

use bytes::Bytes;
use futures_util::{StreamExt, stream};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span};

use crate::core::checkpoint::SharedCheckpoint;
use crate::core::rate_limit::{Bandwidth, RateLimiter, throttle};
use crate::core::retry::{RetryContext, RetryPolicy};
use crate::core::source::{ByteStream, SourceClient};
use crate::error::TransferError;
use crate::logging::LogThrottle;

/// Copy granularity between source and destination.
pub const CHUNK_SIZE: usize = 32 * 1024;

const NOT_STARTED: u64 = u64::MAX;

/// One file to transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTask {
    /// URL or provider handle understood by the pool's [`SourceClient`].
    pub source: String,
    pub destination: PathBuf,
    /// Expected size in bytes; 0 when unknown.
    pub expected_size: u64,
    pub name: String,
    /// Byte offset to resume from.
    #[serde(default)]
    pub offset: u64,
}

impl TransferTask {
    pub fn new(
        source: impl Into<String>,
        destination: impl Into<PathBuf>,
        expected_size: u64,
        name: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            expected_size,
            name: name.into(),
            offset: 0,
        }
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }
}

/// Outcome of one task.
#[derive(Debug)]
pub struct TransferResult {
    pub task: TransferTask,
    pub success: bool,
    pub error: Option<TransferError>,
    pub duration: Duration,
    /// Length of the destination file when the task finished.
    pub bytes_written: u64,
}

impl TransferResult {
    pub(crate) fn succeeded(task: TransferTask, duration: Duration, bytes_written: u64) -> Self {
        Self {
            task,
            success: true,
            error: None,
            duration,
            bytes_written,
        }
    }

    pub(crate) fn failed(
        task: TransferTask,
        error: TransferError,
        duration: Duration,
        bytes_written: u64,
    ) -> Self {
        Self {
            task,
            success: false,
            error: Some(error),
            duration,
            bytes_written,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.error.as_ref().is_some_and(TransferError::is_cancelled)
    }
}

/// Aggregate progress of a pool.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub downloaded: u64,
    pub total: u64,
    /// Cumulative average since the pool started.
    pub speed_mbps: f64,
}

impl Progress {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.downloaded as f64 / self.total as f64).min(1.0)
    }
}

/// Lock-free progress counters shared by all workers.
#[derive(Debug)]
pub(crate) struct ProgressCounters {
    downloaded: AtomicU64,
    total: AtomicU64,
    skipped: AtomicU64,
    created: Instant,
    started_ms: AtomicU64,
}

impl ProgressCounters {
    pub(crate) fn new() -> Self {
        Self {
            downloaded: AtomicU64::new(0),
            total: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            created: Instant::now(),
            started_ms: AtomicU64::new(NOT_STARTED),
        }
    }

    pub(crate) fn mark_started(&self) {
        let now = self.created.elapsed().as_millis() as u64;
        let _ = self
            .started_ms
            .compare_exchange(NOT_STARTED, now, Ordering::Relaxed, Ordering::Relaxed);
    }

    pub(crate) fn add_total(&self, bytes: u64) {
        self.total.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn add_downloaded(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Bytes of a skipped file count toward both totals.
    pub(crate) fn add_skipped(&self, bytes: u64) {
        self.total.fetch_add(bytes, Ordering::Relaxed);
        self.add_resumed(bytes);
    }

    /// Bytes already on disk before a resumed task starts.
    pub(crate) fn add_resumed(&self, bytes: u64) {
        self.skipped.fetch_add(bytes, Ordering::Relaxed);
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> Progress {
        let downloaded = self.downloaded.load(Ordering::Relaxed);
        let total = self.total.load(Ordering::Relaxed);
        let started = self.started_ms.load(Ordering::Relaxed);
        let speed_mbps = if started == NOT_STARTED {
            0.0
        } else {
            let now = self.created.elapsed().as_millis() as u64;
            let elapsed_secs = now.saturating_sub(started) as f64 / 1000.0;
            let transferred = downloaded.saturating_sub(self.skipped.load(Ordering::Relaxed));
            if elapsed_secs > 0.0 {
                transferred as f64 / (1024.0 * 1024.0) / elapsed_secs
            } else {
                0.0
            }
        };
        Progress {
            downloaded,
            total,
            speed_mbps,
        }
    }
}

/// Split source chunks into pieces of at most [`CHUNK_SIZE`].
fn chunked(body: ByteStream) -> ByteStream {
    body.flat_map(|item| {
        let pieces: Vec<Result<Bytes, TransferError>> = match item {
            Ok(mut chunk) => {
                let mut pieces = Vec::with_capacity(chunk.len() / CHUNK_SIZE + 1);
                while chunk.len() > CHUNK_SIZE {
                    pieces.push(Ok(chunk.split_to(CHUNK_SIZE)));
                }
                if !chunk.is_empty() {
                    pieces.push(Ok(chunk));
                }
                pieces
            }
            Err(e) => vec![Err(e)],
        };
        stream::iter(pieces)
    })
    .boxed()
}

/// Hash the first `len` bytes of `path`.
fn hash_prefix(path: &Path, len: u64) -> io::Result<blake3::Hasher> {
    let mut reader = std::fs::File::open(path)?.take(len);
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(hasher)
}

/// Per-task state that survives across retry attempts.
struct TaskState {
    /// Highest destination offset already counted into the pool totals.
    high_water: AtomicU64,
}

impl TaskState {
    /// The resume offset was counted when the task was submitted.
    fn new(task: &TransferTask) -> Self {
        Self {
            high_water: AtomicU64::new(task.offset),
        }
    }
}

struct Completed {
    size: u64,
    checksum: String,
}

/// Everything a worker needs to execute tasks.
pub(crate) struct TaskRunner {
    pub(crate) source: Arc<dyn SourceClient>,
    pub(crate) retry: RetryPolicy,
    pub(crate) bandwidth: Bandwidth,
    pub(crate) checkpoint: Option<Arc<SharedCheckpoint>>,
    pub(crate) counters: Arc<ProgressCounters>,
    pub(crate) cancel: CancellationToken,
}

impl TaskRunner {
    /// Run `task` to completion through the retry policy.
    pub(crate) async fn run(&self, task: TransferTask, worker: usize) -> TransferResult {
        let started = Instant::now();
        let key = self
            .checkpoint
            .as_ref()
            .map(|cp| cp.key_for(&task.destination));
        if let (Some(cp), Some(key)) = (&self.checkpoint, &key) {
            cp.mark_downloading(key).await;
        }

        let span = info_span!("transfer", worker, file = %task.name);
        let state = TaskState::new(&task);
        let limiter = self.bandwidth.limiter_for_task();
        let operation = format!("download {}", task.name);

        let outcome = self
            .retry
            .run_with_result(&operation, &self.cancel, |ctx| {
                let limiter = limiter.clone();
                let task = &task;
                let state = &state;
                let key = key.as_deref();
                async move {
                    let result = self.attempt(task, state, limiter, ctx, key).await;
                    match &result {
                        Ok(_) => self.bandwidth.record_success(),
                        Err(e) if !e.is_cancelled() => {
                            self.bandwidth.record_error();
                            if let (Some(cp), Some(key)) = (&self.checkpoint, key) {
                                cp.record_retry(key).await;
                            }
                        }
                        Err(_) => {}
                    }
                    result
                }
            })
            .instrument(span)
            .await;

        let duration = started.elapsed();
        match outcome {
            Ok(done) => {
                if let (Some(cp), Some(key)) = (&self.checkpoint, &key) {
                    cp.mark_completed(key, done.size, Some(done.checksum)).await;
                }
                let secs = duration.as_secs_f64();
                let speed_mbps = if secs > 0.0 {
                    done.size as f64 / (1024.0 * 1024.0) / secs
                } else {
                    0.0
                };
                info!(
                    worker,
                    file = %task.name,
                    bytes = done.size,
                    duration_ms = duration.as_millis() as u64,
                    speed_mbps = format!("{:.2}", speed_mbps),
                    "transfer complete"
                );
                TransferResult::succeeded(task, duration, done.size)
            }
            Err(err) => {
                let err = TransferError::from(err);
                let written = state.high_water.load(Ordering::Relaxed);
                if err.is_cancelled() {
                    info!(worker, file = %task.name, bytes = written, "transfer cancelled, partial output kept");
                } else {
                    if let (Some(cp), Some(key)) = (&self.checkpoint, &key) {
                        cp.mark_failed(key).await;
                    }
                    error!(worker, file = %task.name, error = %err, "transfer failed");
                }
                TransferResult::failed(task, err, duration, written)
            }
        }
    }

    /// Offset to request for this attempt.
    async fn resume_offset(&self, task: &TransferTask, ctx: RetryContext) -> u64 {
        let on_disk = tokio::fs::metadata(&task.destination)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        let wanted = if ctx.is_first() { task.offset } else { on_disk };
        if wanted > on_disk || (task.expected_size > 0 && wanted > task.expected_size) {
            0
        } else {
            wanted
        }
    }

    async fn attempt(
        &self,
        task: &TransferTask,
        state: &TaskState,
        limiter: Option<Arc<RateLimiter>>,
        ctx: RetryContext,
        key: Option<&str>,
    ) -> Result<Completed, TransferError> {
        if let Some(parent) = task.destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TransferError::io("create destination directory", e))?;
        }

        let offset = self.resume_offset(task, ctx).await;
        let opened = tokio::select! {
            _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
            opened = self.source.open(&task.source, offset) => opened?,
        };
        let start = if opened.resumed { offset } else { 0 };

        let (mut file, mut hasher) = if start > 0 {
            let file = OpenOptions::new()
                .write(true)
                .open(&task.destination)
                .await
                .map_err(|e| TransferError::io("open destination for resume", e))?;
            file.set_len(start)
                .await
                .map_err(|e| TransferError::io("truncate destination", e))?;
            let path = task.destination.clone();
            let hasher = tokio::task::spawn_blocking(move || hash_prefix(&path, start))
                .await
                .map_err(|e| TransferError::io("hash existing bytes", io::Error::other(e)))?
                .map_err(|e| TransferError::io("hash existing bytes", e))?;
            (file, hasher)
        } else {
            let file = File::create(&task.destination)
                .await
                .map_err(|e| TransferError::io("create destination file", e))?;
            (file, blake3::Hasher::new())
        };
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|e| TransferError::io("seek destination", e))?;

        debug!(offset = start, resumed = opened.resumed, attempt = ctx.attempt, "source opened");

        let expected = if task.expected_size > 0 {
            Some(task.expected_size)
        } else {
            opened.total_size
        };
        if task.expected_size == 0 {
            if let (Some(cp), Some(key), Some(total)) = (&self.checkpoint, key, opened.total_size) {
                cp.record_total_size(key, total).await;
            }
        }
        let mut body = throttle(chunked(opened.body), limiter, self.cancel.clone());
        let progress_log = LogThrottle::new(Duration::from_secs(1));
        let mut position = start;

        let copied = loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                next = body.next() => Some(next),
            };
            let chunk = match next {
                None => break Err(TransferError::Cancelled),
                Some(None) => break Ok(()),
                Some(Some(Err(e))) => break Err(e),
                Some(Some(Ok(chunk))) => chunk,
            };

            if let Err(e) = file.write_all(&chunk).await {
                break Err(TransferError::io("write destination", e));
            }
            hasher.update(&chunk);
            position += chunk.len() as u64;

            let counted = state.high_water.fetch_max(position, Ordering::Relaxed);
            if position > counted {
                self.counters.add_downloaded(position - counted);
            }
            if let (Some(cp), Some(key)) = (&self.checkpoint, key) {
                cp.update_progress(key, position).await;
            }
            if progress_log.should_log() {
                debug!(
                    downloaded = position,
                    total = expected.unwrap_or(0),
                    updates = progress_log.take_suppressed() + 1,
                    "transfer progress"
                );
            }
        };

        // Partial output is kept for a later resume, so land it before bailing.
        let flushed = file.flush().await;
        copied?;
        flushed.map_err(|e| TransferError::io("flush destination", e))?;
        file.sync_all()
            .await
            .map_err(|e| TransferError::io("sync destination", e))?;

        match expected {
            Some(expected) if position < expected => Err(TransferError::ShortWrite {
                written: position,
                expected,
            }),
            Some(expected) if position > expected => Err(TransferError::SizeMismatch {
                expected,
                actual: position,
            }),
            _ => Ok(Completed {
                size: position,
                checksum: hasher.finalize().to_hex().to_string(),
            }),
        }
    }
}
