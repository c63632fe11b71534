//! Normalize stage: cache lookup, probe, transcode, per-job GPU to CPU fallback.

use crate::cache::{ArtifactKind, Fingerprint};
use crate::error::{Error, ProcessingError, Result};
use crate::types::{EncoderClass, Stage, Status, TrimRange, VideoJob};
use crate::workers::{EncoderProfile, MediaInfo, NormalizeRequest, TransferProgress};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use super::Pipeline;
use super::events::JobReporter;

/// Length of the trimmed output, when the source duration or trim end is known
///
/// Errors when the trim starts at or beyond the end of the media.
pub(crate) fn expected_duration(
    trim: &TrimRange,
    media_secs: Option<f64>,
) -> std::result::Result<Option<f64>, ProcessingError> {
    let start = trim.start_secs();
    match media_secs {
        Some(total) if start >= total => Err(ProcessingError::InvalidTrim(format!(
            "start {:.3}s is beyond the end of the {:.3}s source",
            start, total
        ))),
        Some(total) => Ok(Some(trim.end.map_or(total, |end| end.min(total)) - start)),
        None => Ok(trim.duration()),
    }
}

impl Pipeline {
    /// Bring a `Downloaded` job to `Normalized`, `Failed` or `Cancelled`
    ///
    /// The returned error is reserved for rejected status transitions.
    pub(crate) async fn normalize_stage(
        &self,
        job: &mut VideoJob,
        reporter: &JobReporter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        // An artifact from an earlier CPU fallback is as good as a fresh GPU encode
        let mut classes = vec![self.encoder.class];
        if self.encoder.class == EncoderClass::Gpu {
            classes.push(EncoderClass::Cpu);
        }
        for class in classes {
            let fingerprint = self.normalized_fingerprint(job, class);
            if let Some(path) = self.cache.lookup(&fingerprint).await {
                reporter.cache_hit(Stage::Normalize, &path);
                job.normalized_path = Some(path);
                job.normalize_cached = true;
                job.encoder_used = Some(class);
                return reporter.transition(job, Status::Normalized);
            }
        }

        let Some(raw) = job.raw_path.clone() else {
            reporter.transition(job, Status::Normalizing)?;
            let error = ProcessingError::SourceMissing(PathBuf::from(&job.source.url));
            return self.fail_normalize(job, reporter, &error.into());
        };

        reporter.transition(job, Status::Normalizing)?;
        tracing::info!(job_id = %job.id, encoder = %self.encoder.label(), "normalizing");

        let outcome = match self.probe_source(job, &raw).await {
            Ok((info, expected)) => {
                let first = self
                    .normalize_with(job, &raw, &info, expected, &self.encoder, reporter, cancel)
                    .await;
                match first {
                    Err(Error::Processing(ref e)) if e.is_gpu_failure() => {
                        let message = e.to_string();
                        tracing::warn!(
                            job_id = %job.id,
                            error = %message,
                            "GPU encode failed, retrying this job with the CPU encoder"
                        );
                        reporter.encoder_fallback(&message);
                        let cpu = EncoderProfile::cpu();
                        self.normalize_with(job, &raw, &info, expected, &cpu, reporter, cancel)
                            .await
                            .map(|path| (path, EncoderClass::Cpu))
                    }
                    other => other.map(|path| (path, self.encoder.class)),
                }
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok((path, class)) => {
                job.normalized_path = Some(path);
                job.encoder_used = Some(class);
                reporter.transition(job, Status::Normalized)?;
                tracing::info!(job_id = %job.id, encoder = %class, "normalize complete");
                Ok(())
            }
            Err(Error::Processing(ProcessingError::Cancelled)) => {
                tracing::info!(job_id = %job.id, "normalize cancelled");
                reporter.transition(job, Status::Cancelled)
            }
            Err(e) => self.fail_normalize(job, reporter, &e),
        }
    }

    fn normalized_fingerprint(&self, job: &VideoJob, class: EncoderClass) -> Fingerprint {
        Fingerprint::normalized(&job.source_id, &job.source.trim, &self.target, class)
    }

    fn fail_normalize(&self, job: &mut VideoJob, reporter: &JobReporter, error: &Error) -> Result<()> {
        let message = match error {
            Error::Processing(e) => e.to_string(),
            other => other.to_string(),
        };
        tracing::error!(job_id = %job.id, error = %message, "normalize failed");
        job.last_error = Some(message.clone());
        reporter.transition(job, Status::Failed)?;
        reporter.failed(Stage::Normalize, &message);
        Ok(())
    }

    /// Probe the raw artifact and check the trim range against its duration
    async fn probe_source(&self, job: &mut VideoJob, raw: &Path) -> Result<(MediaInfo, Option<f64>)> {
        let info = self.workers.processor.probe(raw).await?;
        if info.video.is_none() {
            return Err(ProcessingError::ProbeFailed {
                path: raw.to_path_buf(),
                reason: "no video stream".to_string(),
            }
            .into());
        }
        if job.duration_secs.is_none() {
            job.duration_secs = info.duration_secs;
        }
        let expected = expected_duration(&job.source.trim, info.duration_secs)?;
        tracing::debug!(
            job_id = %job.id,
            duration_secs = ?info.duration_secs,
            expected_secs = ?expected,
            has_audio = info.has_audio(),
            "probed source"
        );
        Ok((info, expected))
    }

    /// Run one normalize attempt with `encoder` and cache its output
    #[allow(clippy::too_many_arguments)]
    async fn normalize_with(
        &self,
        job: &VideoJob,
        raw: &Path,
        info: &MediaInfo,
        expected_secs: Option<f64>,
        encoder: &EncoderProfile,
        reporter: &JobReporter,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let fingerprint = self.normalized_fingerprint(job, encoder.class);
        let _claim = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProcessingError::Cancelled.into()),
            claim = self.cache.claim(&fingerprint) => claim,
        };
        if let Some(path) = self.cache.lookup(&fingerprint).await {
            tracing::debug!(job_id = %job.id, "normalized artifact produced by a sibling job");
            return Ok(path);
        }

        let staging = self
            .cache
            .staging_path(&fingerprint, self.target.format.extension());
        let request = NormalizeRequest {
            input: raw,
            output: &staging,
            trim: job.source.trim,
            target: &self.target,
            encoder,
            input_has_audio: info.has_audio(),
            expected_duration_secs: expected_secs,
            timeout: Some(self.config.normalize.timeout),
        };
        let on_progress = |progress: TransferProgress| reporter.progress(Stage::Normalize, progress);

        let produced = self
            .workers
            .processor
            .normalize(&request, &on_progress, cancel)
            .await;
        if let Err(e) = produced {
            tokio::fs::remove_file(&staging).await.ok();
            return Err(e.into());
        }

        match self
            .cache
            .store(&fingerprint, &staging, ArtifactKind::Normalized)
            .await
        {
            Ok(path) => Ok(path),
            Err(e) => {
                tokio::fs::remove_file(&staging).await.ok();
                Err(e)
            }
        }
    }
}
