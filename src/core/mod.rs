pub mod checkpoint;
pub mod export;
pub mod planner;
pub mod pool;
pub mod rate_limit;
pub mod retry;
pub mod source;
pub mod transfer;

pub use checkpoint::{Checkpoint, CheckpointError, CheckpointStore, FileCheckpoint, FileStatus, SharedCheckpoint};
pub use export::{ExportReport, ExportSession, ExportSubject};
pub use planner::{ResumePlan, ResumePlanner};
pub use pool::{PoolOptions, TransferPool};
pub use rate_limit::{AdaptiveBandwidth, AdaptiveRateLimiter, Bandwidth, RateLimiter, RateLimiterStats};
pub use retry::{Classify, ErrorClass, NonRetryable, RetryConfig, RetryContext, RetryError, RetryPolicy};
pub use source::{ByteStream, HttpSource, SourceClient, SourceStream};
pub use transfer::{Progress, TransferResult, TransferTask};
