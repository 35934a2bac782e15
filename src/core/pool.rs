//! Fixed-size worker pool for parallel transfers.
//!
//! Tasks go in through a bounded queue shared by all workers, results come
//! out through a second bounded queue in completion order. Aggregate
//! progress is kept in atomic counters that every worker updates per chunk.

use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::checkpoint::SharedCheckpoint;
use crate::core::rate_limit::Bandwidth;
use crate::core::retry::RetryPolicy;
use crate::core::source::SourceClient;
use crate::core::transfer::{Progress, ProgressCounters, TaskRunner, TransferResult, TransferTask};
use crate::error::TransferError;

/// Cadence of the progress callback in [`TransferPool::download_batch`].
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

type TaskQueue = Arc<tokio::sync::Mutex<mpsc::Receiver<TransferTask>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone)]
pub struct PoolOptions {
    pub workers: usize,
    pub retry: RetryPolicy,
    pub bandwidth: Bandwidth,
    pub checkpoint: Option<Arc<SharedCheckpoint>>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            retry: RetryPolicy::default(),
            bandwidth: Bandwidth::Unlimited,
            checkpoint: None,
        }
    }
}

pub struct TransferPool {
    workers: usize,
    runner: Arc<TaskRunner>,
    task_tx: Mutex<Option<mpsc::Sender<TransferTask>>>,
    task_rx: TaskQueue,
    result_tx: Mutex<Option<mpsc::Sender<TransferResult>>>,
    result_rx: tokio::sync::Mutex<mpsc::Receiver<TransferResult>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<ProgressCounters>,
    cancel: CancellationToken,
    started: AtomicBool,
    closed: AtomicBool,
}

impl TransferPool {
    /// Create a pool whose cancellation token is a child of `parent`.
    pub fn new(
        source: Arc<dyn SourceClient>,
        options: PoolOptions,
        parent: &CancellationToken,
    ) -> Self {
        let workers = options.workers.max(1);
        let capacity = workers * 2;
        let (task_tx, task_rx) = mpsc::channel(capacity);
        let (result_tx, result_rx) = mpsc::channel(capacity);
        let cancel = parent.child_token();
        let counters = Arc::new(ProgressCounters::new());

        let runner = Arc::new(TaskRunner {
            source,
            retry: options.retry,
            bandwidth: options.bandwidth,
            checkpoint: options.checkpoint,
            counters: counters.clone(),
            cancel: cancel.clone(),
        });

        Self {
            workers,
            runner,
            task_tx: Mutex::new(Some(task_tx)),
            task_rx: Arc::new(tokio::sync::Mutex::new(task_rx)),
            result_tx: Mutex::new(Some(result_tx)),
            result_rx: tokio::sync::Mutex::new(result_rx),
            handles: Mutex::new(Vec::new()),
            counters,
            cancel,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Stop all work. Queued tasks are reported as cancelled.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    fn sender(&self) -> Result<mpsc::Sender<TransferTask>, TransferError> {
        if self.cancel.is_cancelled() {
            return Err(TransferError::PoolShuttingDown);
        }
        lock(&self.task_tx)
            .as_ref()
            .cloned()
            .ok_or(TransferError::PoolShuttingDown)
    }

    fn account_submitted(&self, expected_size: u64, offset: u64) {
        self.counters.add_total(expected_size);
        self.counters.add_resumed(offset.min(expected_size));
    }

    /// Enqueue without waiting.
    pub fn submit(&self, task: TransferTask) -> Result<(), TransferError> {
        let tx = self.sender()?;
        let (size, offset) = (task.expected_size, task.offset);
        match tx.try_send(task) {
            Ok(()) => {
                self.account_submitted(size, offset);
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(TransferError::QueueFull),
            Err(TrySendError::Closed(_)) => Err(TransferError::PoolShuttingDown),
        }
    }

    /// Enqueue, waiting for queue capacity.
    pub async fn submit_wait(&self, task: TransferTask) -> Result<(), TransferError> {
        let tx = self.sender()?;
        let (size, offset) = (task.expected_size, task.offset);
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TransferError::PoolShuttingDown),
            sent = tx.send(task) => match sent {
                Ok(()) => {
                    self.account_submitted(size, offset);
                    Ok(())
                }
                Err(_) => Err(TransferError::PoolShuttingDown),
            },
        }
    }

    /// Spawn the workers. Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), TransferError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransferError::AlreadyClosed);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TransferError::AlreadyStarted);
        }
        let Some(results) = lock(&self.result_tx).take() else {
            return Err(TransferError::AlreadyStarted);
        };

        self.counters.mark_started();
        let mut handles = lock(&self.handles);
        for id in 0..self.workers {
            handles.push(tokio::spawn(worker_loop(
                id,
                self.runner.clone(),
                self.task_rx.clone(),
                results.clone(),
            )));
        }
        info!(workers = self.workers, "transfer pool started");
        Ok(())
    }

    /// Next result in completion order, or `None` once every worker exited.
    pub async fn next_result(&self) -> Option<TransferResult> {
        self.result_rx.lock().await.recv().await
    }

    pub fn progress(&self) -> Progress {
        self.counters.snapshot()
    }

    /// Count bytes of a file that needs no transfer toward progress.
    pub fn account_skipped(&self, bytes: u64) {
        self.counters.add_skipped(bytes);
    }

    /// Submit every task, report progress every [`PROGRESS_INTERVAL`] and
    /// collect the results. Starts the pool if needed. Returns once every
    /// submitted task has a result or the workers are gone.
    pub async fn download_batch<F>(
        &self,
        tasks: Vec<TransferTask>,
        mut on_progress: F,
    ) -> Vec<TransferResult>
    where
        F: FnMut(Progress),
    {
        match self.start() {
            Ok(()) | Err(TransferError::AlreadyStarted) => {}
            Err(e) => {
                warn!(error = %e, "cannot run batch");
                return Vec::new();
            }
        }

        let total = tasks.len();
        let submitted = std::sync::atomic::AtomicUsize::new(usize::MAX);

        let submit = async {
            let mut count = 0;
            for task in tasks {
                let name = task.name.clone();
                if let Err(e) = self.submit_wait(task).await {
                    warn!(file = %name, error = %e, "stopped submitting batch");
                    break;
                }
                count += 1;
            }
            submitted.store(count, Ordering::SeqCst);
        };

        let collect = async {
            let mut results = Vec::with_capacity(total);
            let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut rx = self.result_rx.lock().await;
            loop {
                let target = submitted.load(Ordering::SeqCst).min(total);
                if results.len() >= target {
                    break;
                }
                tokio::select! {
                    result = rx.recv() => match result {
                        Some(result) => results.push(result),
                        None => break,
                    },
                    _ = ticker.tick() => on_progress(self.counters.snapshot()),
                }
            }
            results
        };

        let ((), results) = tokio::join!(submit, collect);
        on_progress(self.counters.snapshot());
        results
    }

    /// Close the task queue, wait for the workers to drain it and exit, then
    /// cancel the pool token. A second call fails with `AlreadyClosed`.
    ///
    /// Results still queued are not discarded, but workers block while the
    /// result queue is full, so read results before or while closing.
    pub async fn close(&self) -> Result<(), TransferError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(TransferError::AlreadyClosed);
        }
        drop(lock(&self.task_tx).take());

        let handles = std::mem::take(&mut *lock(&self.handles));
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "transfer worker terminated abnormally");
            }
        }
        drop(lock(&self.result_tx).take());
        self.cancel.cancel();

        let progress = self.counters.snapshot();
        info!(
            downloaded = progress.downloaded,
            total = progress.total,
            "transfer pool closed"
        );
        Ok(())
    }
}

async fn recv_task(queue: &TaskQueue) -> Option<TransferTask> {
    queue.lock().await.recv().await
}

/// Report every queued task as cancelled without starting it.
async fn drain_cancelled(id: usize, queue: &TaskQueue, results: &mpsc::Sender<TransferResult>) {
    let mut rx = queue.lock().await;
    let mut drained = 0usize;
    while let Ok(task) = rx.try_recv() {
        drained += 1;
        let result = TransferResult::failed(task, TransferError::Cancelled, Duration::ZERO, 0);
        if results.send(result).await.is_err() {
            break;
        }
    }
    if drained > 0 {
        debug!(worker = id, drained, "cancelled queued tasks");
    }
}

async fn worker_loop(
    id: usize,
    runner: Arc<TaskRunner>,
    queue: TaskQueue,
    results: mpsc::Sender<TransferResult>,
) {
    debug!(worker = id, "worker started");
    loop {
        let task = tokio::select! {
            biased;
            _ = runner.cancel.cancelled() => {
                drain_cancelled(id, &queue, &results).await;
                break;
            }
            task = recv_task(&queue) => match task {
                Some(task) => task,
                None => break,
            },
        };

        let result = if runner.cancel.is_cancelled() {
            TransferResult::failed(task, TransferError::Cancelled, Duration::ZERO, 0)
        } else {
            let started = Instant::now();
            let fallback = task.clone();
            match AssertUnwindSafe(runner.run(task, id)).catch_unwind().await {
                Ok(result) => result,
                Err(_) => {
                    error!(worker = id, file = %fallback.name, "worker panicked while processing task");
                    TransferResult::failed(
                        fallback,
                        TransferError::WorkerPanicked,
                        started.elapsed(),
                        0,
                    )
                }
            }
        };

        if results.send(result).await.is_err() {
            break;
        }
    }
    debug!(worker = id, "worker stopped");
}
