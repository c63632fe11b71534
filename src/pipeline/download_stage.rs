//! Download stage: cache lookup, producer claim, worker attempts with backoff.

use crate::cache::{ArtifactKind, Fingerprint};
use crate::error::{DownloadError, Result};
use crate::types::{Stage, Status, VideoJob};
use crate::workers::{DownloadRequest, DownloadedMedia, TransferProgress};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use super::Pipeline;
use super::events::JobReporter;

impl Pipeline {
    /// Height limit handed to the download worker, if capping is enabled
    pub(crate) fn download_height_cap(&self) -> Option<u32> {
        self.config
            .download
            .cap_height
            .then(|| self.config.output.resolution.height())
    }

    /// Bring `job` from `Pending` to `Downloaded`, `Failed` or `Cancelled`
    ///
    /// The returned error is reserved for rejected status transitions; worker
    /// failures are recorded on the job.
    pub(crate) async fn download_stage(
        &self,
        job: &mut VideoJob,
        reporter: &JobReporter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let height_cap = self.download_height_cap();
        let fingerprint = Fingerprint::raw(&job.source_id, &job.source.trim, height_cap);

        if let Some(path) = self.cache.lookup(&fingerprint).await {
            return self.raw_cache_hit(job, reporter, path);
        }

        // Another job with the same source may be producing this artifact right now
        let _claim = tokio::select! {
            biased;
            _ = cancel.cancelled() => return reporter.transition(job, Status::Cancelled),
            claim = self.cache.claim(&fingerprint) => claim,
        };
        if let Some(path) = self.cache.lookup(&fingerprint).await {
            return self.raw_cache_hit(job, reporter, path);
        }

        reporter.transition(job, Status::Downloading)?;
        tracing::info!(
            job_id = %job.id,
            url = %job.source.url,
            fingerprint = %fingerprint.short(),
            "downloading"
        );

        let request = DownloadRequest {
            url: job.source.url.clone(),
            output_stem: self
                .cache
                .artifact_dir()
                .join(format!("{}.part", fingerprint.as_str())),
            height_cap,
            cookies_file: self.config.download.cookies_file.clone(),
            timeout: self.config.download.attempt_timeout,
        };
        let on_progress = |progress: TransferProgress| reporter.progress(Stage::Download, progress);

        let mut attempt = 1;
        loop {
            let result = if cancel.is_cancelled() {
                Err(DownloadError::Cancelled)
            } else {
                match self
                    .workers
                    .downloader
                    .download(&request, &on_progress, cancel)
                    .await
                {
                    Ok(media) => self.store_raw(&fingerprint, media).await,
                    Err(e) => Err(e),
                }
            };

            match result {
                Ok((path, media)) => {
                    job.raw_path = Some(path);
                    job.title = media.title;
                    job.duration_secs = media.duration_secs;
                    reporter.transition(job, Status::Downloaded)?;
                    tracing::info!(job_id = %job.id, attempts = attempt, "download complete");
                    return Ok(());
                }
                Err(DownloadError::Cancelled) => {
                    tracing::info!(job_id = %job.id, "download cancelled");
                    return reporter.transition(job, Status::Cancelled);
                }
                Err(e) if self.retry.should_retry(attempt, &e) => {
                    let delay = self.retry.delay_for_attempt(attempt + 1);
                    let message = e.to_string();
                    tracing::warn!(
                        job_id = %job.id,
                        error = %message,
                        attempt,
                        max_attempts = self.retry.max_attempts(),
                        delay_ms = delay.as_millis(),
                        "download failed, retrying"
                    );

                    job.retry_count += 1;
                    job.last_error = Some(message.clone());
                    reporter.transition(job, Status::Failed)?;
                    reporter.retry_scheduled(attempt + 1, delay, &message);

                    if self.retry.wait(delay, cancel).await.is_err() {
                        tracing::info!(job_id = %job.id, "cancelled during retry backoff");
                        return reporter.transition(job, Status::Cancelled);
                    }
                    reporter.transition(job, Status::Downloading)?;
                    attempt += 1;
                }
                Err(e) => {
                    let message = e.to_string();
                    if matches!(e, DownloadError::Permanent { .. }) {
                        tracing::error!(job_id = %job.id, error = %message, "download failed permanently");
                    } else {
                        tracing::error!(job_id = %job.id, error = %message, attempts = attempt, "download failed after all retry attempts");
                    }
                    job.last_error = Some(message.clone());
                    reporter.transition(job, Status::Failed)?;
                    reporter.failed(Stage::Download, &message);
                    return Ok(());
                }
            }
        }
    }

    fn raw_cache_hit(&self, job: &mut VideoJob, reporter: &JobReporter, path: PathBuf) -> Result<()> {
        reporter.cache_hit(Stage::Download, &path);
        job.raw_path = Some(path);
        job.download_cached = true;
        reporter.transition(job, Status::Downloaded)
    }

    /// Move the worker output into the cache
    ///
    /// A failure here is transient: the next attempt downloads again.
    async fn store_raw(
        &self,
        fingerprint: &Fingerprint,
        media: DownloadedMedia,
    ) -> std::result::Result<(PathBuf, DownloadedMedia), DownloadError> {
        match self
            .cache
            .store(fingerprint, &media.path, ArtifactKind::Raw)
            .await
        {
            Ok(path) => Ok((path, media)),
            Err(e) => {
                tokio::fs::remove_file(&media.path).await.ok();
                Err(DownloadError::Transient {
                    message: format!("could not cache download: {}", e),
                })
            }
        }
    }
}
