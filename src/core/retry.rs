//! Retry with exponential backoff and jitter.
//!
//! A [`RetryPolicy`] is an explicit value handed to whatever needs it; there
//! is no process-wide default. Errors tell the policy whether they are worth
//! retrying through [`Classify`]; anything left unclassified is matched
//! against known transient signatures.

use rand::Rng;
use regex::RegexSet;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::TransferError;

/// Maximum extra delay added by jitter, as a fraction of the base delay.
const JITTER_FRACTION: f64 = 0.25;

/// Error text fragments that indicate a transient network or service fault.
const TRANSIENT_SIGNATURES: &[&str] = &[
    // Network
    "connection refused",
    "connection reset",
    "connection timeout",
    "connection closed",
    "network unreachable",
    "no such host",
    "dns error",
    "temporary failure",
    "timed out",
    "timeout",
    "broken pipe",
    "unexpected eof",
    // HTTP / service
    "500 internal server error",
    "502 bad gateway",
    "503 service unavailable",
    "504 gateway timeout",
    "429 too many requests",
    "requesttimeout",
    "serviceunavailable",
    "internalerror",
    "slowdown",
    "throttlingexception",
    // Cloud providers
    "requestlimitexceeded",
    "provisionedthroughputexceededexception",
    "transactioninprogressexception",
    "toomanyrequests",
];

static TRANSIENT_MATCHER: LazyLock<RegexSet> = LazyLock::new(|| {
    let patterns = TRANSIENT_SIGNATURES
        .iter()
        .map(|p| format!("(?i){}", regex::escape(p)));
    RegexSet::new(patterns).unwrap_or_else(|_| RegexSet::empty())
});

/// How an error should be treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
    Cancelled,
    /// No explicit marking; decided by matching the error text.
    Unclassified,
}

/// Implemented by errors that can say whether they are retryable.
pub trait Classify: Display {
    fn class(&self) -> ErrorClass {
        ErrorClass::Unclassified
    }
}

/// Marks an arbitrary error as terminal so retries stop immediately.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct NonRetryable(pub anyhow::Error);

/// Wrap `err` so that [`RetryPolicy`] gives up on the first occurrence.
pub fn non_retryable(err: impl Into<anyhow::Error>) -> anyhow::Error {
    anyhow::Error::new(NonRetryable(err.into()))
}

impl Classify for anyhow::Error {
    fn class(&self) -> ErrorClass {
        if self.downcast_ref::<NonRetryable>().is_some() {
            return ErrorClass::Permanent;
        }
        match self.downcast_ref::<TransferError>() {
            Some(e) => e.class(),
            None => ErrorClass::Unclassified,
        }
    }
}

/// True when `message` contains a known transient signature.
pub fn is_transient_message(message: &str) -> bool {
    TRANSIENT_MATCHER.is_match(message)
}

/// Retry configuration. Non-positive values fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if self.max_attempts == 0 {
            self.max_attempts = defaults.max_attempts;
        }
        if self.initial_delay_ms == 0 {
            self.initial_delay_ms = defaults.initial_delay_ms;
        }
        if self.max_delay_ms == 0 {
            self.max_delay_ms = defaults.max_delay_ms;
        }
        if !(self.multiplier > 0.0) {
            self.multiplier = defaults.multiplier;
        }
        self
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Per-invocation counters handed to the operation on every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryContext {
    /// 1-based attempt number.
    pub attempt: u32,
    pub max_attempts: u32,
    /// Delay waited before this attempt (zero for the first).
    pub delay: Duration,
}

impl RetryContext {
    pub fn is_first(&self) -> bool {
        self.attempt == 1
    }

    pub fn is_last(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("{operation}: cancelled after {attempts} attempt(s)")]
    Cancelled { operation: String, attempts: u32 },

    #[error("{operation} (attempt {attempt}/{max_attempts}): {error}")]
    Permanent {
        operation: String,
        attempt: u32,
        max_attempts: u32,
        error: E,
    },

    #[error("{operation} failed after {attempts} attempts: {error}")]
    Exhausted {
        operation: String,
        attempts: u32,
        error: E,
    },
}

impl<E> RetryError<E> {
    /// Number of attempts that actually ran.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Cancelled { attempts, .. } | RetryError::Exhausted { attempts, .. } => {
                *attempts
            }
            RetryError::Permanent { attempt, .. } => *attempt,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }

    /// The last error the operation returned, if any.
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Cancelled { .. } => None,
            RetryError::Permanent { error, .. } | RetryError::Exhausted { error, .. } => Some(error),
        }
    }
}

impl From<RetryError<TransferError>> for TransferError {
    fn from(err: RetryError<TransferError>) -> Self {
        match err {
            RetryError::Cancelled { .. } => TransferError::Cancelled,
            RetryError::Permanent {
                operation,
                attempt,
                error,
                ..
            } => TransferError::Failed {
                operation,
                attempts: attempt,
                source: Box::new(error),
            },
            RetryError::Exhausted {
                operation,
                attempts,
                error,
            } => TransferError::Failed {
                operation,
                attempts,
                source: Box::new(error),
            },
        }
    }
}

/// Exponential backoff retry policy.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config: config.normalized(),
        }
    }

    /// A policy that runs the operation exactly once.
    pub fn no_retry() -> Self {
        Self::new(RetryConfig {
            max_attempts: 1,
            ..RetryConfig::default()
        })
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Pre-jitter delay after `attempt` (1-based) failed:
    /// `min(max_delay, initial_delay * multiplier^(attempt-1))`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let initial = self.config.initial_delay().as_secs_f64();
        let max = self.config.max_delay();
        let delay = initial * self.config.multiplier.powi(exponent);
        if !delay.is_finite() || delay >= max.as_secs_f64() {
            return max;
        }
        Duration::from_secs_f64(delay)
    }

    /// Delay actually slept after `attempt` failed, including jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.config.jitter {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0.0..=JITTER_FRACTION);
        base + base.mul_f64(extra)
    }

    pub fn is_retryable<E: Classify>(&self, err: &E) -> bool {
        match err.class() {
            ErrorClass::Transient => true,
            ErrorClass::Permanent | ErrorClass::Cancelled => false,
            ErrorClass::Unclassified => is_transient_message(&err.to_string()),
        }
    }

    /// Run `op` until it succeeds, fails terminally, exhausts its attempts or
    /// `cancel` fires.
    pub async fn run<E, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<(), RetryError<E>>
    where
        E: Classify,
        F: FnMut(RetryContext) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        self.run_with_result(operation, cancel, op).await
    }

    /// Like [`RetryPolicy::run`], threading the operation's value through.
    pub async fn run_with_result<T, E, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        E: Classify,
        F: FnMut(RetryContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.config.max_attempts;
        let mut delay = Duration::ZERO;

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled {
                    operation: operation.to_string(),
                    attempts: attempt - 1,
                });
            }

            let ctx = RetryContext {
                attempt,
                max_attempts,
                delay,
            };

            let err = match op(ctx).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(operation, attempt, max_attempts, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if err.class() == ErrorClass::Cancelled || cancel.is_cancelled() {
                return Err(RetryError::Cancelled {
                    operation: operation.to_string(),
                    attempts: attempt,
                });
            }

            if !self.is_retryable(&err) {
                warn!(operation, attempt, error = %err, "operation failed with non-retryable error");
                return Err(RetryError::Permanent {
                    operation: operation.to_string(),
                    attempt,
                    max_attempts,
                    error: err,
                });
            }

            if attempt >= max_attempts {
                error!(operation, attempts = max_attempts, error = %err, "operation failed after max attempts");
                return Err(RetryError::Exhausted {
                    operation: operation.to_string(),
                    attempts: max_attempts,
                    error: err,
                });
            }

            delay = self.delay_for(attempt);
            warn!(
                operation,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "operation failed, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RetryError::Cancelled {
                        operation: operation.to_string(),
                        attempts: attempt,
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        // max_attempts is normalized to at least 1, so the loop always returns.
        Err(RetryError::Cancelled {
            operation: operation.to_string(),
            attempts: max_attempts,
        })
    }
}

impl fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} attempts, {}ms..{}ms x{}{}",
            self.config.max_attempts,
            self.config.initial_delay_ms,
            self.config.max_delay_ms,
            self.config.multiplier,
            if self.config.jitter { " +jitter" } else { "" }
        )
    }
}
