//! Run control: cancellation, event subscriptions, cache maintenance, playlist expansion.

use crate::cache::CacheStore;
use crate::config::Config;
use crate::error::Result;
use crate::retry::retry_with_backoff;
use crate::types::{Event, SourceDescriptor};
use crate::workers::EncoderProfile;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::broadcast;
use tokio_stream::{Stream, StreamExt, wrappers::BroadcastStream};
use tokio_util::sync::CancellationToken;

use super::Pipeline;

impl Pipeline {
    /// Cancel the running batch
    ///
    /// In-flight worker subprocesses are terminated, in-flight jobs move to
    /// `Cancelled` and queued jobs are never started. Artifacts that were
    /// completely stored before the cancel stay in the cache, so re-running the
    /// same batch resumes from them. Has no effect when no batch is running.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use yt_merge::*;
    /// # async fn example(pipeline: Pipeline) -> Result<()> {
    /// let runner = pipeline.clone();
    /// let handle = tokio::spawn(async move {
    ///     runner.run(vec![SourceDescriptor::new("https://youtu.be/abc")], "out.mp4").await
    /// });
    ///
    /// // later, e.g. from a Stop button
    /// pipeline.cancel();
    /// let report = handle.await.map_err(|e| Error::Other(e.to_string()))??;
    /// println!("cancelled: {}", report.cancelled);
    /// # Ok(())
    /// # }
    /// ```
    pub fn cancel(&self) {
        if !self.is_running() {
            tracing::debug!("cancel requested with no batch running");
            return;
        }
        tracing::info!("cancelling running batch");
        self.current_cancel_token().cancel();
    }

    /// Whether a batch is currently executing
    pub fn is_running(&self) -> bool {
        self.run_state.running.load(Ordering::SeqCst)
    }

    /// Token of the current run
    pub(crate) fn current_cancel_token(&self) -> CancellationToken {
        self.run_state
            .cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Subscribe to pipeline events
    ///
    /// Every subscriber receives every event emitted after it subscribed; a
    /// subscriber that falls more than the channel capacity behind gets a
    /// `Lagged` error and skips ahead. Per-job status and progress events carry
    /// a shared sequence number; see [`super::SequenceFilter`].
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Subscribe as a [`Stream`], silently skipping over lag gaps
    pub fn event_stream(&self) -> impl Stream<Item = Event> + Send + 'static {
        BroadcastStream::new(self.event_tx.subscribe()).filter_map(|item| match item {
            Ok(event) => Some(event),
            Err(tokio_stream::wrappers::errors::BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "event stream lagged, skipping ahead");
                None
            }
        })
    }

    /// Get the current configuration
    ///
    /// The configuration is wrapped in an Arc, so this is a cheap clone operation.
    pub fn get_config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// Encoder selected at construction
    pub fn encoder(&self) -> &EncoderProfile {
        &self.encoder
    }

    /// Shared cache store
    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Forget every cached artifact, returning how many index entries were removed
    ///
    /// The next run re-downloads and re-normalizes everything. Artifact files
    /// are not deleted.
    pub async fn evict_cache(&self) -> Result<u64> {
        self.cache.evict_all().await
    }

    /// Expand a playlist URL into one full-length source per entry
    ///
    /// Listing failures are retried with the download retry policy. A URL that
    /// lists no entries expands to itself.
    pub async fn expand_playlist(&self, url: &str) -> Result<Vec<SourceDescriptor>> {
        let cancel = CancellationToken::new();
        let downloader = Arc::clone(&self.workers.downloader);
        let urls = retry_with_backoff(
            &self.retry,
            &cancel,
            |notice| {
                tracing::debug!(
                    url,
                    next_attempt = notice.next_attempt,
                    error = %notice.error,
                    "retrying playlist listing"
                );
            },
            |_attempt| {
                let downloader = Arc::clone(&downloader);
                async move { downloader.expand_playlist(url).await }
            },
        )
        .await?;

        if urls.is_empty() {
            return Ok(vec![SourceDescriptor::new(url)]);
        }
        Ok(urls.into_iter().map(SourceDescriptor::new).collect())
    }
}
