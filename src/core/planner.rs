//! Reconciles a loaded checkpoint with what is actually on disk.

use std::path::Path;
use tracing::{debug, info, warn};

use crate::core::checkpoint::{Checkpoint, FileStatus, file_checksum};
use crate::core::transfer::TransferTask;

#[derive(Debug, Default)]
pub struct ResumePlan {
    /// Tasks to run, with resume offsets applied.
    pub tasks: Vec<TransferTask>,
    /// Tasks whose destination is already complete.
    pub skipped: Vec<TransferTask>,
    pub skipped_bytes: u64,
}

impl ResumePlan {
    pub fn resumed(&self) -> usize {
        self.tasks.iter().filter(|t| t.offset > 0).count()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResumePlanner {
    verify_checksums: bool,
}

async fn disk_len(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path).await.ok().map(|m| m.len())
}

impl ResumePlanner {
    /// With `verify_checksums`, completed files are re-hashed and compared to
    /// the recorded checksum instead of trusting a size match.
    pub fn new(verify_checksums: bool) -> Self {
        Self { verify_checksums }
    }

    /// Decide, per task, whether to skip, resume or restart. Every task is
    /// registered in `checkpoint`; entries that must restart are demoted to
    /// pending.
    pub async fn plan(&self, checkpoint: &mut Checkpoint, tasks: Vec<TransferTask>) -> ResumePlan {
        let mut plan = ResumePlan::default();

        for mut task in tasks {
            let key = checkpoint.key_for(&task.destination);
            checkpoint.add_file(key.clone(), task.source.clone(), task.expected_size);
            let Some(entry) = checkpoint.file(&key).cloned() else {
                plan.tasks.push(task.with_offset(0));
                continue;
            };

            match entry.status {
                FileStatus::Completed => {
                    let on_disk = disk_len(&task.destination).await;
                    if on_disk == Some(entry.total_size) && self.checksum_matches(&task, entry.checksum.as_deref()).await {
                        debug!(file = %task.name, bytes = entry.total_size, "already complete, skipping");
                        plan.skipped_bytes += entry.total_size;
                        task.expected_size = entry.total_size;
                        plan.skipped.push(task);
                    } else {
                        warn!(
                            file = %task.name,
                            recorded = entry.total_size,
                            on_disk = ?on_disk,
                            "completed file missing or changed, restarting"
                        );
                        checkpoint.mark_status(&key, FileStatus::Pending);
                        plan.tasks.push(task.with_offset(0));
                    }
                }
                FileStatus::Pending | FileStatus::Failed => {
                    plan.tasks.push(task.with_offset(0));
                }
                FileStatus::Downloading => {
                    let on_disk = disk_len(&task.destination).await.unwrap_or(0);
                    let offset = entry.downloaded_size;
                    if offset > 0 && on_disk >= offset {
                        // Only a recorded size makes a partial file resumable.
                        if task.expected_size == 0 {
                            task.expected_size = entry.total_size;
                        }
                        debug!(file = %task.name, offset, "resuming partial download");
                        plan.tasks.push(task.with_offset(offset));
                    } else {
                        debug!(file = %task.name, recorded = offset, on_disk, "partial file unusable, restarting");
                        checkpoint.mark_status(&key, FileStatus::Pending);
                        plan.tasks.push(task.with_offset(0));
                    }
                }
            }
        }

        info!(
            run = plan.tasks.len(),
            resumed = plan.resumed(),
            skipped = plan.skipped.len(),
            skipped_bytes = plan.skipped_bytes,
            "resume plan ready"
        );
        plan
    }

    async fn checksum_matches(&self, task: &TransferTask, recorded: Option<&str>) -> bool {
        if !self.verify_checksums {
            return true;
        }
        let Some(recorded) = recorded else {
            warn!(file = %task.name, "no recorded checksum to verify against");
            return false;
        };
        let path = task.destination.clone();
        match tokio::task::spawn_blocking(move || file_checksum(&path)).await {
            Ok(Ok(actual)) if actual == recorded => true,
            Ok(Ok(_)) => {
                warn!(file = %task.name, "checksum mismatch on completed file");
                false
            }
            Ok(Err(e)) => {
                warn!(file = %task.name, error = %e, "cannot hash completed file");
                false
            }
            Err(e) => {
                warn!(file = %task.name, error = %e, "checksum task failed");
                false
            }
        }
    }
}
