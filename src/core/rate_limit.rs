//! Token-bucket bandwidth limiting for transfer streams.
//!
//! Limiting is applied by wrapping the byte stream, so a limiter can be
//! private to one task or shared by every worker in a pool.

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::source::ByteStream;
use crate::error::TransferError;

/// Smallest burst chosen when the burst is left on auto.
pub const MIN_AUTO_BURST: u64 = 64 * 1024;

/// Longest single sleep inside `wait_n`; bounds cancellation latency.
const REFILL_TICK: Duration = Duration::from_millis(100);

/// Consecutive successes before the adaptive limiter raises its rate.
const SUCCESS_STREAK: u32 = 8;

/// Multiplicative decrease applied on error.
const DECREASE_FACTOR: f64 = 0.8;

fn auto_burst(bytes_per_second: u64) -> u64 {
    (bytes_per_second / 10).max(MIN_AUTO_BURST)
}

#[derive(Debug)]
struct Bucket {
    rate: u64,
    configured_burst: u64,
    burst: u64,
    tokens: f64,
    last_refill: Instant,
    granted: u64,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + self.rate as f64 * elapsed).min(self.burst as f64);
        self.last_refill = now;
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterStats {
    pub bytes_granted: u64,
    pub elapsed: Duration,
    pub average_bytes_per_second: f64,
    /// Current limit; 0 when disabled.
    pub limit_bytes_per_second: u64,
    pub burst: u64,
}

/// Token bucket with lazy continuous refill.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
    created: Instant,
}

impl RateLimiter {
    /// `bytes_per_second == 0` disables limiting. `burst == 0` picks
    /// `max(bytes_per_second / 10, 64 KiB)`.
    pub fn new(bytes_per_second: u64, burst: u64) -> Self {
        let now = Instant::now();
        let effective_burst = if burst == 0 {
            auto_burst(bytes_per_second)
        } else {
            burst
        };
        Self {
            bucket: Mutex::new(Bucket {
                rate: bytes_per_second,
                configured_burst: burst,
                burst: effective_burst,
                tokens: effective_burst as f64,
                last_refill: now,
                granted: 0,
            }),
            created: now,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0, 0)
    }

    fn lock(&self) -> MutexGuard<'_, Bucket> {
        self.bucket.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().rate > 0
    }

    pub fn rate(&self) -> u64 {
        self.lock().rate
    }

    pub fn burst(&self) -> u64 {
        self.lock().burst
    }

    /// Tokens available right now, after refilling.
    pub fn tokens(&self) -> f64 {
        let mut bucket = self.lock();
        bucket.refill(Instant::now());
        bucket.tokens
    }

    /// Change the rate live. An auto burst follows the new rate.
    pub fn set_rate(&self, bytes_per_second: u64) {
        let mut bucket = self.lock();
        bucket.refill(Instant::now());
        bucket.rate = bytes_per_second;
        if bucket.configured_burst == 0 {
            bucket.burst = auto_burst(bytes_per_second);
        }
        bucket.tokens = bucket.tokens.min(bucket.burst as f64);
    }

    /// Wait until `n` bytes may pass, then deduct them.
    ///
    /// Requests larger than the burst are granted in burst-sized portions.
    /// Each sleep is capped at one refill tick and raced against `cancel`.
    pub async fn wait_n(&self, n: u64, cancel: &CancellationToken) -> Result<(), TransferError> {
        let mut remaining = n;
        while remaining > 0 {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }

            let wait = {
                let mut bucket = self.lock();
                if bucket.rate == 0 {
                    bucket.granted += remaining;
                    return Ok(());
                }
                bucket.refill(Instant::now());
                let want = remaining.min(bucket.burst);
                if bucket.tokens >= want as f64 {
                    bucket.tokens -= want as f64;
                    bucket.granted += want;
                    remaining -= want;
                    continue;
                }
                let deficit = want as f64 - bucket.tokens;
                Duration::from_secs_f64(deficit / bucket.rate as f64)
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                _ = tokio::time::sleep(wait.min(REFILL_TICK)) => {}
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> RateLimiterStats {
        let bucket = self.lock();
        let elapsed = self.created.elapsed();
        let secs = elapsed.as_secs_f64();
        RateLimiterStats {
            bytes_granted: bucket.granted,
            elapsed,
            average_bytes_per_second: if secs > 0.0 {
                bucket.granted as f64 / secs
            } else {
                0.0
            },
            limit_bytes_per_second: bucket.rate,
            burst: bucket.burst,
        }
    }
}

/// Bounds for the adaptive limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveBandwidth {
    pub min_bytes_per_second: u64,
    pub max_bytes_per_second: u64,
}

impl Default for AdaptiveBandwidth {
    fn default() -> Self {
        Self {
            min_bytes_per_second: 1024 * 1024,
            max_bytes_per_second: 100 * 1024 * 1024,
        }
    }
}

/// AIMD controller over a shared [`RateLimiter`].
#[derive(Debug)]
pub struct AdaptiveRateLimiter {
    limiter: Arc<RateLimiter>,
    min: u64,
    max: u64,
    successes: Mutex<u32>,
}

impl AdaptiveRateLimiter {
    /// Starts halfway between the bounds.
    pub fn new(bounds: AdaptiveBandwidth) -> Self {
        let min = bounds.min_bytes_per_second.max(1);
        let max = bounds.max_bytes_per_second.max(min);
        let start = min + (max - min) / 2;
        Self {
            limiter: Arc::new(RateLimiter::new(start, 0)),
            min,
            max,
            successes: Mutex::new(0),
        }
    }

    pub fn limiter(&self) -> Arc<RateLimiter> {
        self.limiter.clone()
    }

    pub fn rate(&self) -> u64 {
        self.limiter.rate()
    }

    fn streak(&self) -> MutexGuard<'_, u32> {
        self.successes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Additive increase after a streak of successes.
    pub fn record_success(&self) {
        let mut streak = self.streak();
        *streak += 1;
        if *streak < SUCCESS_STREAK {
            return;
        }
        *streak = 0;
        let current = self.limiter.rate();
        let step = (self.max / 20).max(1);
        let next = current.saturating_add(step).min(self.max);
        if next != current {
            self.limiter.set_rate(next);
            debug!(from = current, to = next, "adaptive bandwidth increased");
        }
    }

    /// Multiplicative decrease.
    pub fn record_error(&self) {
        let mut streak = self.streak();
        *streak = 0;
        let current = self.limiter.rate();
        let next = ((current as f64 * DECREASE_FACTOR) as u64).max(self.min);
        if next != current {
            self.limiter.set_rate(next);
            debug!(from = current, to = next, "adaptive bandwidth decreased");
        }
    }
}

/// How bandwidth is shared between the workers of one pool.
#[derive(Debug, Clone, Default)]
pub enum Bandwidth {
    #[default]
    Unlimited,
    /// Every task gets its own fresh limiter.
    PerTask { bytes_per_second: u64, burst: u64 },
    /// One limiter caps the aggregate.
    Shared(Arc<RateLimiter>),
    Adaptive(Arc<AdaptiveRateLimiter>),
}

impl Bandwidth {
    pub fn limiter_for_task(&self) -> Option<Arc<RateLimiter>> {
        match self {
            Bandwidth::Unlimited => None,
            Bandwidth::PerTask { bytes_per_second: 0, .. } => None,
            Bandwidth::PerTask {
                bytes_per_second,
                burst,
            } => Some(Arc::new(RateLimiter::new(*bytes_per_second, *burst))),
            Bandwidth::Shared(limiter) => Some(limiter.clone()),
            Bandwidth::Adaptive(adaptive) => Some(adaptive.limiter()),
        }
    }

    pub fn record_success(&self) {
        if let Bandwidth::Adaptive(adaptive) = self {
            adaptive.record_success();
        }
    }

    pub fn record_error(&self) {
        if let Bandwidth::Adaptive(adaptive) = self {
            adaptive.record_error();
        }
    }
}

/// Wrap `body` so every chunk waits for tokens before it is yielded.
/// A missing or disabled limiter returns `body` untouched.
pub fn throttle(
    body: ByteStream,
    limiter: Option<Arc<RateLimiter>>,
    cancel: CancellationToken,
) -> ByteStream {
    let Some(limiter) = limiter.filter(|l| l.is_enabled()) else {
        return body;
    };
    body.then(move |item| {
        let limiter = limiter.clone();
        let cancel = cancel.clone();
        async move {
            let chunk = item?;
            limiter.wait_n(chunk.len() as u64, &cancel).await?;
            Ok(chunk)
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures_util::stream;

    #[test]
    fn auto_burst_is_a_tenth_of_the_rate_with_a_floor() {
        assert_eq!(RateLimiter::new(10 * 1024 * 1024, 0).burst(), 1024 * 1024);
        assert_eq!(RateLimiter::new(100_000, 0).burst(), MIN_AUTO_BURST);
        assert_eq!(RateLimiter::new(100_000, 5_000).burst(), 5_000);
    }

    #[tokio::test]
    async fn disabled_limiter_never_waits() {
        let limiter = RateLimiter::unlimited();
        let cancel = CancellationToken::new();
        let started = Instant::now();
        limiter.wait_n(u64::MAX / 2, &cancel).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(50));
        assert!(!limiter.is_enabled());
    }

    #[tokio::test]
    async fn tokens_never_exceed_burst_after_idle() {
        let limiter = RateLimiter::new(1_000_000, 10_000);
        let cancel = CancellationToken::new();
        limiter.wait_n(10_000, &cancel).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(limiter.tokens() <= 10_000.0);
    }

    #[tokio::test]
    async fn throughput_is_bounded_by_rate_after_burst() {
        // (T - B) / R = (120_000 - 20_000) / 200_000 = 0.5s
        let limiter = RateLimiter::new(200_000, 20_000);
        let cancel = CancellationToken::new();
        let started = Instant::now();
        for _ in 0..4 {
            limiter.wait_n(30_000, &cancel).await.unwrap();
        }
        let elapsed = started.elapsed();
        assert!(
            elapsed >= Duration::from_millis(480),
            "finished too fast: {elapsed:?}"
        );
        assert_eq!(limiter.stats().bytes_granted, 120_000);
    }

    #[tokio::test]
    async fn cancellation_unblocks_a_pending_wait() {
        let limiter = Arc::new(RateLimiter::new(1_000, 1_000));
        let cancel = CancellationToken::new();
        limiter.wait_n(1_000, &cancel).await.unwrap();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = limiter.wait_n(1_000, &cancel).await.unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
        assert!(started.elapsed() < Duration::from_millis(300));
    }

    #[test]
    fn set_rate_recomputes_auto_burst() {
        let limiter = RateLimiter::new(10 * 1024 * 1024, 0);
        limiter.set_rate(1024);
        assert_eq!(limiter.rate(), 1024);
        assert_eq!(limiter.burst(), MIN_AUTO_BURST);
        assert!(limiter.tokens() <= MIN_AUTO_BURST as f64);
    }

    #[test]
    fn adaptive_limiter_stays_within_bounds() {
        let adaptive = AdaptiveRateLimiter::new(AdaptiveBandwidth {
            min_bytes_per_second: 1_000,
            max_bytes_per_second: 3_000,
        });
        assert_eq!(adaptive.rate(), 2_000);

        adaptive.record_error();
        assert_eq!(adaptive.rate(), 1_600);
        for _ in 0..10 {
            adaptive.record_error();
        }
        assert_eq!(adaptive.rate(), 1_000);

        for _ in 0..(SUCCESS_STREAK * 100) {
            adaptive.record_success();
        }
        assert_eq!(adaptive.rate(), 3_000);
    }

    #[test]
    fn error_resets_the_success_streak() {
        let adaptive = AdaptiveRateLimiter::new(AdaptiveBandwidth {
            min_bytes_per_second: 1_000,
            max_bytes_per_second: 100_000,
        });
        for _ in 0..SUCCESS_STREAK - 1 {
            adaptive.record_success();
        }
        adaptive.record_error();
        let after_error = adaptive.rate();
        adaptive.record_success();
        assert_eq!(adaptive.rate(), after_error);
    }

    #[test]
    fn per_task_scope_hands_out_independent_limiters() {
        let bandwidth = Bandwidth::PerTask {
            bytes_per_second: 1_000,
            burst: 0,
        };
        let a = bandwidth.limiter_for_task().unwrap();
        let b = bandwidth.limiter_for_task().unwrap();
        assert!(!Arc::ptr_eq(&a, &b));

        let shared = Bandwidth::Shared(Arc::new(RateLimiter::new(1_000, 0)));
        let a = shared.limiter_for_task().unwrap();
        let b = shared.limiter_for_task().unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        assert!(Bandwidth::Unlimited.limiter_for_task().is_none());
    }

    #[tokio::test]
    async fn throttled_stream_yields_every_chunk() {
        let body: ByteStream = stream::iter(vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ])
        .boxed();
        let limiter = Arc::new(RateLimiter::new(1_000_000, 0));
        let mut throttled = throttle(body, Some(limiter.clone()), CancellationToken::new());

        let mut out = Vec::new();
        while let Some(chunk) = throttled.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(out, b"hello world");
        assert_eq!(limiter.stats().bytes_granted, 11);
    }
}
