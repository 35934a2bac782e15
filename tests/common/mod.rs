#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{StreamExt, stream};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use vmxport::TransferError;
use vmxport::core::retry::RetryConfig;
use vmxport::core::{SourceClient, SourceStream};

/// Deterministic bytes for a fixture file.
pub fn payload(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

/// Retries that do not slow the test suite down.
pub fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_delay_ms: 5,
        max_delay_ms: 20,
        multiplier: 2.0,
        jitter: false,
    }
}

/// In-memory source with failure injection.
#[derive(Default)]
pub struct MockSource {
    files: HashMap<String, Vec<u8>>,
    /// Serve only this many bytes of the file.
    truncate: HashMap<String, usize>,
    /// Respond with 503 this many times before serving.
    fail_first: Mutex<HashMap<String, u32>>,
    /// Drop the connection after this many bytes, once.
    break_after: Mutex<HashMap<String, usize>>,
    panic_on: Option<String>,
    status: HashMap<String, u16>,
    ignore_ranges: bool,
    /// Do not report the object size.
    hide_size: bool,
    chunk_size: Option<usize>,
    chunk_delay: Option<Duration>,
    requests: AtomicUsize,
    opens: Mutex<Vec<(String, u64)>>,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, locator: &str, data: Vec<u8>) -> Self {
        self.files.insert(locator.to_string(), data);
        self
    }

    pub fn truncated(mut self, locator: &str, len: usize) -> Self {
        self.truncate.insert(locator.to_string(), len);
        self
    }

    pub fn failing_first(self, locator: &str, times: u32) -> Self {
        self.fail_first
            .lock()
            .unwrap()
            .insert(locator.to_string(), times);
        self
    }

    pub fn breaking_after(self, locator: &str, bytes: usize) -> Self {
        self.break_after
            .lock()
            .unwrap()
            .insert(locator.to_string(), bytes);
        self
    }

    pub fn panicking_on(mut self, locator: &str) -> Self {
        self.panic_on = Some(locator.to_string());
        self
    }

    pub fn with_status(mut self, locator: &str, status: u16) -> Self {
        self.status.insert(locator.to_string(), status);
        self
    }

    pub fn ignoring_ranges(mut self) -> Self {
        self.ignore_ranges = true;
        self
    }

    pub fn without_size(mut self) -> Self {
        self.hide_size = true;
        self
    }

    /// Serve bodies in `size`-byte chunks, each delayed by `delay`.
    pub fn slow(mut self, size: usize, delay: Duration) -> Self {
        self.chunk_size = Some(size);
        self.chunk_delay = Some(delay);
        self
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> Vec<(String, u64)> {
        self.opens.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourceClient for MockSource {
    async fn open(&self, locator: &str, offset: u64) -> Result<SourceStream, TransferError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.opens
            .lock()
            .unwrap()
            .push((locator.to_string(), offset));

        if self.panic_on.as_deref() == Some(locator) {
            panic!("mock source exploded on {locator}");
        }
        if let Some(status) = self.status.get(locator) {
            return Err(TransferError::Status {
                status: *status,
                url: locator.to_string(),
            });
        }
        {
            let mut fail_first = self.fail_first.lock().unwrap();
            if let Some(remaining) = fail_first.get_mut(locator) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(TransferError::Status {
                        status: 503,
                        url: locator.to_string(),
                    });
                }
            }
        }

        let data = self.files.get(locator).ok_or_else(|| TransferError::Status {
            status: 404,
            url: locator.to_string(),
        })?;
        let total = data.len() as u64;
        let served = self.truncate.get(locator).copied().unwrap_or(data.len());
        let resumed = offset > 0 && !self.ignore_ranges && offset <= total;
        let start = if resumed { offset as usize } else { 0 };
        let mut body = data[start.min(served)..served].to_vec();

        let break_at = self.break_after.lock().unwrap().remove(locator);
        let chunk_size = self.chunk_size.unwrap_or(16 * 1024);
        let mut items: Vec<Result<Bytes, TransferError>> = Vec::new();
        if let Some(limit) = break_at {
            body.truncate(limit);
        }
        for piece in body.chunks(chunk_size) {
            items.push(Ok(Bytes::copy_from_slice(piece)));
        }
        if break_at.is_some() {
            items.push(Err(TransferError::Stream(
                "connection reset by peer".to_string(),
            )));
        }

        let delay = self.chunk_delay;
        let body = stream::iter(items)
            .then(move |item| async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                item
            })
            .boxed();

        Ok(SourceStream {
            body,
            resumed,
            total_size: (!self.hide_size).then_some(total),
        })
    }
}
