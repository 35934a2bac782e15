//! Error taxonomy for the transfer engine.
//!
//! Every error knows its own retry class, so the retry policy never has to
//! guess about local filesystem failures, integrity failures or cancellation.

use std::io;
use thiserror::Error;

use crate::core::checkpoint::CheckpointError;
use crate::core::retry::{Classify, ErrorClass};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("pool is shutting down")]
    PoolShuttingDown,

    #[error("task queue is full")]
    QueueFull,

    #[error("pool already started")]
    AlreadyStarted,

    #[error("pool already closed")]
    AlreadyClosed,

    #[error("transfer cancelled")]
    Cancelled,

    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("short write: wrote {written} of {expected} bytes")]
    ShortWrite { written: u64, expected: u64 },

    #[error("unexpected status code {status} from {url}")]
    Status { status: u16, url: String },

    #[error("http request: {0}")]
    Request(#[from] reqwest::Error),

    #[error("read from source: {0}")]
    Stream(String),

    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("worker panicked while processing task")]
    WorkerPanicked,

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("{operation} failed after {attempts} attempt(s): {source}")]
    Failed {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<TransferError>,
    },
}

impl TransferError {
    pub fn io(context: &'static str, source: io::Error) -> Self {
        TransferError::Io { context, source }
    }

    /// True for a user-initiated stop, including one reported through a
    /// wrapped retry failure.
    pub fn is_cancelled(&self) -> bool {
        match self {
            TransferError::Cancelled => true,
            TransferError::Failed { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// Innermost error behind any retry wrapping.
    pub fn root(&self) -> &TransferError {
        match self {
            TransferError::Failed { source, .. } => source.root(),
            other => other,
        }
    }
}

impl Classify for TransferError {
    fn class(&self) -> ErrorClass {
        match self {
            TransferError::Cancelled => ErrorClass::Cancelled,
            TransferError::Status { status, .. } => match status {
                408 | 429 => ErrorClass::Transient,
                500..=599 => ErrorClass::Transient,
                _ => ErrorClass::Permanent,
            },
            TransferError::Request(e) if e.is_timeout() || e.is_connect() || e.is_body() => {
                ErrorClass::Transient
            }
            TransferError::Request(_) | TransferError::Stream(_) => ErrorClass::Unclassified,
            TransferError::Failed { source, .. } => match source.class() {
                ErrorClass::Cancelled => ErrorClass::Cancelled,
                _ => ErrorClass::Permanent,
            },
            TransferError::PoolShuttingDown
            | TransferError::QueueFull
            | TransferError::AlreadyStarted
            | TransferError::AlreadyClosed
            | TransferError::SizeMismatch { .. }
            | TransferError::ShortWrite { .. }
            | TransferError::Io { .. }
            | TransferError::WorkerPanicked
            | TransferError::Checkpoint(_) => ErrorClass::Permanent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_and_throttling_are_transient() {
        for status in [429, 500, 502, 503, 504] {
            let err = TransferError::Status {
                status,
                url: "http://host/disk.vmdk".into(),
            };
            assert_eq!(err.class(), ErrorClass::Transient, "status {status}");
        }
    }

    #[test]
    fn client_errors_are_permanent() {
        for status in [400, 401, 403, 404] {
            let err = TransferError::Status {
                status,
                url: "http://host/disk.vmdk".into(),
            };
            assert_eq!(err.class(), ErrorClass::Permanent, "status {status}");
        }
    }

    #[test]
    fn local_and_integrity_failures_are_permanent() {
        let io = TransferError::io(
            "create file",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(io.class(), ErrorClass::Permanent);

        let mismatch = TransferError::SizeMismatch {
            expected: 10,
            actual: 4,
        };
        assert_eq!(mismatch.class(), ErrorClass::Permanent);
    }

    #[test]
    fn cancellation_is_visible_through_retry_wrapping() {
        let err = TransferError::Failed {
            operation: "download disk-0.vmdk".into(),
            attempts: 2,
            source: Box::new(TransferError::Cancelled),
        };
        assert!(err.is_cancelled());
        assert_eq!(err.class(), ErrorClass::Cancelled);
        assert!(matches!(err.root(), TransferError::Cancelled));
    }
}
