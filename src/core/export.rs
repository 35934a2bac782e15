//! One export run: checkpoint handling around a transfer pool.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

use crate::config::TransferConfig;
use crate::core::checkpoint::{Checkpoint, CheckpointError, CheckpointStore, SharedCheckpoint};
use crate::core::planner::ResumePlanner;
use crate::core::pool::TransferPool;
use crate::core::source::SourceClient;
use crate::core::transfer::{Progress, TransferResult, TransferTask};
use crate::error::TransferError;

/// What is being exported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportSubject {
    pub name: String,
    pub provider: String,
    pub format: String,
    pub output_dir: PathBuf,
}

#[derive(Debug)]
pub struct ExportReport {
    /// Results of the tasks that ran, in completion order.
    pub results: Vec<TransferResult>,
    /// Number of tasks handed to the pool.
    pub scheduled: usize,
    /// Tasks that were already complete on disk.
    pub skipped: Vec<TransferTask>,
    pub progress: Progress,
    pub duration: Duration,
    /// Where the checkpoint was kept, if it was not deleted.
    pub checkpoint_path: Option<PathBuf>,
}

impl ExportReport {
    pub fn succeeded(&self) -> bool {
        self.results.len() == self.scheduled && self.results.iter().all(|r| r.success)
    }

    pub fn failed(&self) -> impl Iterator<Item = &TransferResult> {
        self.results.iter().filter(|r| !r.success && !r.is_cancelled())
    }

    pub fn cancelled(&self) -> usize {
        self.results.iter().filter(|r| r.is_cancelled()).count()
    }

    pub fn bytes_written(&self) -> u64 {
        self.results.iter().map(|r| r.bytes_written).sum()
    }
}

pub struct ExportSession {
    config: TransferConfig,
    source: Arc<dyn SourceClient>,
}

impl ExportSession {
    pub fn new(config: TransferConfig, source: Arc<dyn SourceClient>) -> Self {
        Self {
            config: config.normalized(),
            source,
        }
    }

    pub fn checkpoint_path(&self, subject: &ExportSubject) -> PathBuf {
        self.config
            .checkpoint_path
            .clone()
            .unwrap_or_else(|| CheckpointStore::default_path(&subject.output_dir, &subject.name))
    }

    fn load_or_fresh(&self, subject: &ExportSubject, path: &Path) -> Checkpoint {
        let fresh = || {
            Checkpoint::new(
                subject.name.clone(),
                subject.provider.clone(),
                subject.format.clone(),
                subject.output_dir.clone(),
            )
        };
        if !self.config.resume_from_checkpoint {
            return fresh();
        }
        match CheckpointStore::load(path) {
            Ok(checkpoint) => checkpoint,
            Err(CheckpointError::NotFound { .. }) => {
                info!(path = %path.display(), "no checkpoint to resume, starting fresh");
                fresh()
            }
            Err(e) => {
                warn!(error = %e, "failed to load checkpoint, starting fresh");
                fresh()
            }
        }
    }

    /// Transfer every task of `subject`.
    ///
    /// With checkpoints enabled the checkpoint is written before the first
    /// byte moves, kept on failure or cancellation, and deleted only when
    /// every file succeeded.
    pub async fn run<F>(
        &self,
        subject: &ExportSubject,
        tasks: Vec<TransferTask>,
        cancel: &CancellationToken,
        on_progress: F,
    ) -> Result<ExportReport, TransferError>
    where
        F: FnMut(Progress),
    {
        let span = info_span!("export", subject = %subject.name, provider = %subject.provider);
        self.run_inner(subject, tasks, cancel, on_progress)
            .instrument(span)
            .await
    }

    async fn run_inner<F>(
        &self,
        subject: &ExportSubject,
        tasks: Vec<TransferTask>,
        cancel: &CancellationToken,
        on_progress: F,
    ) -> Result<ExportReport, TransferError>
    where
        F: FnMut(Progress),
    {
        let started = Instant::now();
        info!(files = tasks.len(), workers = self.config.parallelism, "export started");

        if !self.config.enable_checkpoints {
            let pool = TransferPool::new(self.source.clone(), self.config.pool_options(None), cancel);
            let scheduled = tasks.len();
            let results = pool.download_batch(tasks, on_progress).await;
            let progress = pool.progress();
            pool.close().await?;
            return Ok(self.finish(results, scheduled, Vec::new(), progress, started, None));
        }

        let path = self.checkpoint_path(subject);
        let mut checkpoint = self.load_or_fresh(subject, &path);
        let plan = ResumePlanner::new(self.config.verify_checksums)
            .plan(&mut checkpoint, tasks)
            .await;

        let checkpoint = Arc::new(SharedCheckpoint::new(
            checkpoint,
            path.clone(),
            self.config.checkpoint_interval(),
        ));
        if let Err(e) = checkpoint.save().await {
            warn!(error = %e, "failed to save initial checkpoint");
        }

        let pool = TransferPool::new(
            self.source.clone(),
            self.config.pool_options(Some(checkpoint.clone())),
            cancel,
        );
        pool.account_skipped(plan.skipped_bytes);
        let scheduled = plan.tasks.len();
        let results = pool.download_batch(plan.tasks, on_progress).await;
        let progress = pool.progress();
        pool.close().await?;

        let all_done = results.len() == scheduled && results.iter().all(|r| r.success);
        let kept = if all_done {
            CheckpointStore::delete(&path)?;
            None
        } else {
            checkpoint.save().await?;
            info!(path = %path.display(), "checkpoint kept for resume");
            Some(path)
        };

        Ok(self.finish(results, scheduled, plan.skipped, progress, started, kept))
    }

    fn finish(
        &self,
        results: Vec<TransferResult>,
        scheduled: usize,
        skipped: Vec<TransferTask>,
        progress: Progress,
        started: Instant,
        checkpoint_path: Option<PathBuf>,
    ) -> ExportReport {
        let report = ExportReport {
            results,
            scheduled,
            skipped,
            progress,
            duration: started.elapsed(),
            checkpoint_path,
        };
        let failed = report.failed().count();
        info!(
            succeeded = report.results.iter().filter(|r| r.success).count(),
            failed,
            cancelled = report.cancelled(),
            skipped = report.skipped.len(),
            bytes = report.bytes_written(),
            duration_ms = report.duration.as_millis() as u64,
            "export finished"
        );
        report
    }
}
