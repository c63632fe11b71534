//! Retry logic with exponential backoff
//!
//! This module provides the retry policy for transient download failures.
//! The delay before attempt `n` (n >= 2) is `initial_delay * multiplier^(n-2)`,
//! capped at `max_delay`, plus up to 25% random jitter so concurrently failing
//! jobs do not retry in lockstep. Waiting goes through a [`Sleeper`] so the
//! policy is testable without real time.
//!
//! # Example
//!
//! ```no_run
//! use yt_merge::retry::{Cancelled, IsRetryable, RetryPolicy, retry_with_backoff};
//! use yt_merge::config::RetryConfig;
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(Debug)]
//! enum MyError {
//!     Transient,
//!     Permanent,
//!     Cancelled,
//! }
//!
//! impl std::fmt::Display for MyError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "{:?}", self)
//!     }
//! }
//!
//! impl IsRetryable for MyError {
//!     fn is_retryable(&self) -> bool {
//!         matches!(self, MyError::Transient)
//!     }
//! }
//!
//! impl From<Cancelled> for MyError {
//!     fn from(_: Cancelled) -> Self {
//!         MyError::Cancelled
//!     }
//! }
//!
//! # async fn example() -> Result<(), MyError> {
//! let policy = RetryPolicy::new(RetryConfig::default());
//! let cancel = CancellationToken::new();
//! let result = retry_with_backoff(&policy, &cancel, |_| {}, |_attempt| async {
//!     // Your operation here
//!     Ok::<_, MyError>(())
//! }).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::{DownloadError, Error};
use async_trait::async_trait;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Upper bound of the random jitter, as a fraction of the base delay
///
/// Kept below 1.0 so jittered delays still strictly increase with a 2x multiplier.
pub const MAX_JITTER_RATIO: f64 = 0.25;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (network timeouts, rate limiting, connection reset) should return `true`.
/// Permanent failures (unavailable, private, region-locked) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for DownloadError {
    fn is_retryable(&self) -> bool {
        match self {
            DownloadError::Transient { .. } => true,
            // A hung worker is treated like a dropped connection
            DownloadError::Timeout(_) => true,
            // yt-dlp occasionally renames the merged file after a partial failure
            DownloadError::MissingOutput { .. } => true,
            DownloadError::Permanent { .. } => false,
            DownloadError::Cancelled => false,
        }
    }
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Download(e) => e.is_retryable(),
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
            ),
            // External tool errors might be retryable (temporary failures)
            Error::ExternalTool(msg) => {
                let msg = msg.to_ascii_lowercase();
                msg.contains("timeout") || msg.contains("busy") || msg.contains("temporary")
            }
            // Processing failures have their own GPU -> CPU fallback, not a retry loop
            Error::Processing(_) => false,
            Error::Merge { .. } => false,
            Error::Database(_) | Error::Sqlx(_) => false,
            Error::Config { .. } => false,
            Error::InvalidTransition { .. } => false,
            Error::InvalidBatchLine { .. } | Error::InvalidTimestamp(_) => false,
            Error::AlreadyRunning | Error::Cancelled => false,
            Error::Serialization(_) => false,
            Error::NotSupported(_) => false,
            // Unknown errors - be conservative and don't retry
            Error::Other(_) => false,
        }
    }
}

/// Marker returned when a backoff wait is interrupted by cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl From<Cancelled> for DownloadError {
    fn from(_: Cancelled) -> Self {
        DownloadError::Cancelled
    }
}

impl From<Cancelled> for Error {
    fn from(_: Cancelled) -> Self {
        Error::Cancelled
    }
}

/// Abstraction over waiting, so backoff can be observed without real delays
#[async_trait]
pub trait Sleeper: Send + Sync {
    /// Wait for `duration`
    async fn sleep(&self, duration: Duration);
}

/// [`Sleeper`] backed by the tokio timer
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Retry policy: attempt ceiling, backoff schedule and the sleeper that waits it out
#[derive(Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    /// Policy that waits on the tokio timer
    pub fn new(config: RetryConfig) -> Self {
        Self::with_sleeper(config, Arc::new(TokioSleeper))
    }

    /// Policy with an injected sleeper
    pub fn with_sleeper(config: RetryConfig, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { config, sleeper }
    }

    /// Attempt ceiling (first attempt included)
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Whether another attempt may follow a failure of `attempt` with `error`
    pub fn should_retry<E: IsRetryable>(&self, attempt: u32, error: &E) -> bool {
        error.is_retryable() && attempt < self.config.max_attempts
    }

    /// Delay to wait before `attempt`, jitter applied when enabled
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = backoff_delay(&self.config, attempt);
        if self.config.jitter {
            add_jitter(base)
        } else {
            base
        }
    }

    /// Wait out `delay`, returning early with [`Cancelled`] if `cancel` fires
    pub async fn wait(
        &self,
        delay: Duration,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), Cancelled> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Cancelled),
            _ = self.sleeper.sleep(delay) => Ok(()),
        }
    }
}

/// Information handed to the retry callback before each backoff wait
#[derive(Debug)]
pub struct RetryNotice<'a, E> {
    /// Attempt that just failed (1-based)
    pub failed_attempt: u32,
    /// Attempt about to start after the delay
    pub next_attempt: u32,
    /// Delay before the next attempt
    pub delay: Duration,
    /// Error of the failed attempt
    pub error: &'a E,
}

/// Execute an async operation with exponential backoff retry logic
///
/// `operation` receives the 1-based attempt number. `on_retry` runs after a
/// retryable failure and before the backoff wait. Cancellation is checked
/// before each attempt and during each wait.
///
/// # Returns
///
/// Returns the successful result, the first non-retryable error, or the last
/// error after all attempts are exhausted.
pub async fn retry_with_backoff<F, Fut, T, E, R>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut on_retry: R,
    mut operation: F,
) -> std::result::Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: IsRetryable + std::fmt::Display + From<Cancelled>,
    R: FnMut(&RetryNotice<'_, E>),
{
    let mut attempt = 1;

    loop {
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }

        match operation(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(attempts = attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if policy.should_retry(attempt, &e) => {
                let delay = policy.delay_for_attempt(attempt + 1);

                tracing::warn!(
                    error = %e,
                    attempt = attempt,
                    max_attempts = policy.max_attempts(),
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                on_retry(&RetryNotice {
                    failed_attempt: attempt,
                    next_attempt: attempt + 1,
                    delay,
                    error: &e,
                });

                policy.wait(delay, cancel).await?;
                attempt += 1;
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(
                        error = %e,
                        attempts = attempt,
                        "Operation failed after all retry attempts exhausted"
                    );
                } else {
                    tracing::error!(
                        error = %e,
                        "Operation failed with non-retryable error"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Un-jittered delay before `attempt`
///
/// Attempt 1 starts immediately; attempt `n >= 2` waits
/// `initial_delay * backoff_multiplier^(n-2)`, capped at `max_delay`.
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    if attempt <= 1 {
        return Duration::ZERO;
    }
    let exponent = (attempt - 2).min(i32::MAX as u32) as i32;
    let secs = config.initial_delay.as_secs_f64() * config.backoff_multiplier.powi(exponent);
    if !secs.is_finite() || secs >= config.max_delay.as_secs_f64() {
        return config.max_delay;
    }
    Duration::from_secs_f64(secs)
}

/// Add random jitter to a delay
///
/// Jitter is uniformly distributed between 0% and [`MAX_JITTER_RATIO`] of the delay.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=MAX_JITTER_RATIO);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}
