//! Pipeline orchestration split into focused submodules.
//!
//! The `Pipeline` struct and its methods are organized by stage:
//! - [`orchestrator`] - Batch admission, worker pool and the run lifecycle
//! - [`download_stage`] - Raw artifact acquisition with cache lookup and retry
//! - [`normalize_stage`] - Trim/rescale/transcode with GPU to CPU fallback
//! - [`merge_stage`] - Final concatenation, crossfade and music overlay
//! - [`control`] - Cancellation, subscriptions and cache maintenance
//! - [`events`] - Per-job event sequencing and aggregate progress

mod control;
mod download_stage;
mod events;
mod merge_stage;
mod normalize_stage;
mod orchestrator;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

pub use events::SequenceFilter;
pub use merge_stage::MergeOutcome;

use crate::cache::{CacheStore, NormalizeTarget};
use crate::config::Config;
use crate::error::Result;
use crate::retry::{RetryPolicy, Sleeper};
use crate::types::Event;
use crate::workers::{EncoderProfile, Workers};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Capacity of the event broadcast channel
///
/// Subscribers that fall further behind than this observe a lag and skip ahead.
const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Run lifecycle shared by every clone of a pipeline
#[derive(Debug, Default)]
pub(crate) struct RunState {
    /// Set while a batch is executing (one run per pipeline at a time)
    pub(crate) running: AtomicBool,
    /// Cancellation token of the current (or most recent) run
    pub(crate) cancel: std::sync::Mutex<CancellationToken>,
}

/// Pipeline instance (cloneable - all fields are Arc-wrapped)
///
/// Owns the configuration, the external workers, the shared cache store and
/// the event channel. A batch is executed with [`Pipeline::run`]; observers
/// attach with [`Pipeline::subscribe`] before starting it.
#[derive(Clone)]
pub struct Pipeline {
    /// Configuration (wrapped in Arc for sharing across tasks)
    pub(crate) config: Arc<Config>,
    /// External download / processing / capability workers
    pub(crate) workers: Workers,
    /// Content-addressed artifact cache shared by every stage
    pub(crate) cache: Arc<CacheStore>,
    /// Encoder chosen once at construction
    pub(crate) encoder: EncoderProfile,
    /// Normalize target derived from the configuration
    pub(crate) target: Arc<NormalizeTarget>,
    /// Retry policy for transient download failures
    pub(crate) retry: RetryPolicy,
    /// Event broadcast channel sender (multiple subscribers supported)
    pub(crate) event_tx: broadcast::Sender<Event>,
    /// Running flag and cancellation token
    pub(crate) run_state: Arc<RunState>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("workers", &self.workers)
            .field("cache", &self.cache)
            .field("encoder", &self.encoder.label())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Create a pipeline from a configuration and a set of workers
    ///
    /// Validates the configuration, opens (or recovers) the cache and queries
    /// the encoder capability provider exactly once.
    ///
    /// # Errors
    ///
    /// [`crate::Error::Config`] for unrecoverable settings, or an I/O / index
    /// error when the cache directory cannot be created.
    pub async fn new(config: Config, workers: Workers) -> Result<Self> {
        config.validate()?;

        let cache = CacheStore::open(&config.cache).await?;

        let encoder = if config.normalize.prefer_gpu {
            workers.encoder.detect_encoder().await
        } else {
            EncoderProfile::cpu()
        };
        tracing::info!(
            encoder = %encoder.label(),
            provider = workers.encoder.name(),
            max_concurrent_jobs = config.download.max_concurrent_jobs,
            "pipeline ready"
        );

        let (event_tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            target: Arc::new(NormalizeTarget::from_config(&config)),
            retry: RetryPolicy::new(config.download.retry.clone()),
            config: Arc::new(config),
            workers,
            cache: Arc::new(cache),
            encoder,
            event_tx,
            run_state: Arc::new(RunState::default()),
        })
    }

    /// Discover the CLI workers from the configuration and create a pipeline
    pub async fn from_config(config: Config) -> Result<Self> {
        let workers = Workers::discover(&config)?;
        Self::new(config, workers).await
    }

    /// Replace the backoff sleeper (tests observe delays without waiting them out)
    #[must_use]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.retry = RetryPolicy::with_sleeper(self.config.download.retry.clone(), sleeper);
        self
    }

    /// Emit an event to all subscribers
    ///
    /// Events are broadcast to all active subscribers. If there are no subscribers,
    /// the event is silently dropped (this is expected behavior).
    pub(crate) fn emit_event(&self, event: Event) {
        // Ignore send errors - they just mean no one is listening
        self.event_tx.send(event).ok();
    }
}
