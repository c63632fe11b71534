//! Batch execution: job creation, FIFO admission into the bounded pool, merge.

use crate::batch;
use crate::error::{Error, MergeError, Result};
use crate::types::{BatchReport, Event, JobId, SourceDescriptor, Status, VideoJob};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::Pipeline;
use super::RunState;
use super::events::{JobReporter, ProgressAggregator, UNITS_PER_JOB};

/// Clears the running flag when a run ends, however it ends
struct RunGuard {
    state: Arc<RunState>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.state.running.store(false, Ordering::SeqCst);
    }
}

/// Jobs of one run with the reporters that own their event sequences
struct RunJobs {
    jobs: Vec<VideoJob>,
    reporters: Vec<Arc<JobReporter>>,
}

impl Pipeline {
    /// Run a batch to completion and write the merged output to `output`
    ///
    /// Jobs move through Download and Normalize with at most
    /// `download.max_concurrent_jobs` in flight, admitted in submission order.
    /// Once every job has finished its stages, the normalized clips are merged
    /// exactly once, in submission order. Failed jobs are excluded from the
    /// merge and listed in the report.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyRunning`] if this pipeline is already executing a batch
    /// - [`Error::InvalidTimestamp`] for an invalid trim range
    /// - [`Error::Merge`] when nothing could be normalized or the merge fails;
    ///   it lists the jobs that were normalized (and remain cached)
    ///
    /// A cancelled run is not an error: the report has `cancelled` set and no output.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use yt_merge::{Config, Pipeline, SourceDescriptor};
    ///
    /// # async fn example() -> yt_merge::Result<()> {
    /// let pipeline = Pipeline::from_config(Config::default()).await?;
    /// let report = pipeline
    ///     .run(
    ///         vec![
    ///             SourceDescriptor::new("https://youtu.be/dQw4w9WgXcQ"),
    ///             SourceDescriptor::trimmed("https://youtu.be/9bZkp7q19f0", Some(30.0), Some(105.0)),
    ///         ],
    ///         "merged.mp4",
    ///     )
    ///     .await?;
    /// println!("{} merged, {} failed", report.succeeded().count(), report.failed().count());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn run(
        &self,
        sources: Vec<SourceDescriptor>,
        output: impl AsRef<Path>,
    ) -> Result<BatchReport> {
        let output = output.as_ref().to_path_buf();
        let started = Instant::now();

        let _guard = self.begin_run()?;
        let cancel = self.fresh_cancel_token();

        let aggregate = Arc::new(ProgressAggregator::new(
            sources.len(),
            self.event_tx.clone(),
        ));
        let RunJobs { jobs, reporters } = self.create_jobs(sources, &aggregate)?;
        tracing::info!(
            jobs = jobs.len(),
            max_concurrent_jobs = self.config.download.max_concurrent_jobs,
            output = %output.display(),
            "batch started"
        );

        let mut jobs = self.execute_jobs(jobs, &reporters, &cancel).await;
        jobs.sort_by_key(|job| job.index);

        if cancel.is_cancelled() {
            return Ok(self.cancelled_report(&jobs, started));
        }

        let (clips, succeeded): (Vec<PathBuf>, Vec<JobId>) = jobs
            .iter()
            .filter(|job| job.status() == Status::Normalized)
            .filter_map(|job| Some((job.normalized_path.clone()?, job.id.clone())))
            .unzip();
        let failed = jobs
            .iter()
            .filter(|job| job.status() == Status::Failed)
            .count();

        if clips.is_empty() {
            tracing::error!(failed, "no job reached the normalized state, nothing to merge");
            return Err(Error::Merge {
                source: MergeError::NoInputs,
                succeeded,
            });
        }

        let outcome = match self.merge_stage(&clips, &output, &aggregate, &cancel).await {
            Ok(outcome) => outcome,
            Err(MergeError::Cancelled) => return Ok(self.cancelled_report(&jobs, started)),
            Err(source) => {
                tracing::error!(error = %source, normalized = succeeded.len(), "merge failed");
                return Err(Error::Merge { source, succeeded });
            }
        };
        aggregate.complete(1);

        for job in jobs.iter_mut() {
            if job.status() == Status::Normalized {
                reporters[job.index].transition(job, Status::Merged)?;
            }
        }

        self.emit_event(Event::MergeComplete {
            path: outcome.path.clone(),
        });
        self.emit_event(Event::BatchComplete {
            output: outcome.path.clone(),
            succeeded: clips.len(),
            failed,
        });

        let report = BatchReport {
            jobs: jobs.iter().map(VideoJob::summary).collect(),
            output: Some(outcome.path),
            music_applied: outcome.music_applied,
            cancelled: false,
            elapsed: started.elapsed(),
        };
        tracing::info!(
            merged = clips.len(),
            failed,
            cached = report.cached().count(),
            elapsed_ms = report.elapsed.as_millis(),
            "batch complete"
        );
        Ok(report)
    }

    /// Read a batch file and run it
    pub async fn run_batch_file(
        &self,
        batch_file: impl AsRef<Path>,
        output: impl AsRef<Path>,
    ) -> Result<BatchReport> {
        let sources = batch::read_batch_file(batch_file).await?;
        self.run(sources, output).await
    }

    fn begin_run(&self) -> Result<RunGuard> {
        if self
            .run_state
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::AlreadyRunning);
        }
        Ok(RunGuard {
            state: Arc::clone(&self.run_state),
        })
    }

    fn fresh_cancel_token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self
            .run_state
            .cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = token.clone();
        token
    }

    /// Validate sources and create one pending job per entry
    ///
    /// Repeated entries (same source and trim) get `-2`, `-3`, ... suffixed ids
    /// but share fingerprints, so they are produced once.
    fn create_jobs(
        &self,
        sources: Vec<SourceDescriptor>,
        aggregate: &Arc<ProgressAggregator>,
    ) -> Result<RunJobs> {
        let mut occurrences: HashMap<JobId, usize> = HashMap::new();
        let mut jobs = Vec::with_capacity(sources.len());
        let mut reporters = Vec::with_capacity(sources.len());

        for (index, source) in sources.into_iter().enumerate() {
            source.trim.validate()?;
            let source_id = batch::normalize_source_id(&source.url);
            let base = JobId::derive(&source_id, &source.trim);
            let seen = occurrences.entry(base.clone()).or_insert(0);
            *seen += 1;
            let id = base.occurrence(*seen);

            reporters.push(Arc::new(JobReporter::new(
                id.clone(),
                self.event_tx.clone(),
                Arc::clone(aggregate),
            )));
            jobs.push(VideoJob::new(index, id, source, source_id));
        }

        for job in &jobs {
            self.emit_event(Event::JobQueued {
                id: job.id.clone(),
                index: job.index,
                url: job.source.url.clone(),
            });
        }
        Ok(RunJobs { jobs, reporters })
    }

    /// Drive every job through Download and Normalize inside the bounded pool
    ///
    /// Returns the jobs in completion order. After a cancel, jobs that were
    /// never admitted are marked `Cancelled`.
    async fn execute_jobs(
        &self,
        jobs: Vec<VideoJob>,
        reporters: &[Arc<JobReporter>],
        cancel: &CancellationToken,
    ) -> Vec<VideoJob> {
        let pool = Arc::new(Semaphore::new(self.config.download.max_concurrent_jobs));
        let mut pending: VecDeque<VideoJob> = jobs.into();
        let mut finished = Vec::with_capacity(pending.len());
        let mut tasks = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, VideoJob> = HashMap::new();

        while let Some(job) = pending.pop_front() {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    pending.push_front(job);
                    break;
                }
                permit = Arc::clone(&pool).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        pending.push_front(job);
                        break;
                    }
                },
            };

            tracing::debug!(job_id = %job.id, index = job.index, "job admitted");
            let snapshot = job.clone();
            let reporter = Arc::clone(&reporters[job.index]);
            let pipeline = self.clone();
            let token = cancel.clone();
            let handle = tasks.spawn(async move {
                // Holding the permit for the task's lifetime bounds the pool
                let _permit = permit;
                pipeline.process_job(job, &reporter, &token).await
            });
            in_flight.insert(handle.id(), snapshot);
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((id, job)) => {
                    in_flight.remove(&id);
                    finished.push(job);
                }
                Err(e) => {
                    let Some(mut job) = in_flight.remove(&e.id()) else {
                        tracing::error!(error = %e, "job task failed and could not be matched to a job");
                        continue;
                    };
                    tracing::error!(job_id = %job.id, error = %e, "job task panicked");
                    reporters[job.index].abandon(&mut job, &format!("internal error: {}", e));
                    finished.push(job);
                }
            }
        }

        for mut job in pending {
            let reporter = &reporters[job.index];
            if let Err(e) = reporter.transition(&mut job, Status::Cancelled) {
                tracing::warn!(job_id = %job.id, error = %e, "could not cancel queued job");
            }
            reporter.complete_units(UNITS_PER_JOB);
            finished.push(job);
        }

        finished
    }

    /// One job's Download and Normalize stages
    async fn process_job(
        &self,
        mut job: VideoJob,
        reporter: &JobReporter,
        cancel: &CancellationToken,
    ) -> VideoJob {
        if let Err(e) = self.download_stage(&mut job, reporter, cancel).await {
            tracing::error!(job_id = %job.id, error = %e, "download stage rejected a transition");
            job.last_error = Some(e.to_string());
        }

        if job.status() != Status::Downloaded {
            reporter.complete_units(UNITS_PER_JOB);
            return job;
        }
        reporter.complete_units(1);

        if let Err(e) = self.normalize_stage(&mut job, reporter, cancel).await {
            tracing::error!(job_id = %job.id, error = %e, "normalize stage rejected a transition");
            job.last_error = Some(e.to_string());
        }
        reporter.complete_units(1);
        job
    }

    fn cancelled_report(&self, jobs: &[VideoJob], started: Instant) -> BatchReport {
        tracing::info!(
            cancelled = jobs.iter().filter(|j| j.status() == Status::Cancelled).count(),
            "batch cancelled"
        );
        self.emit_event(Event::BatchCancelled);
        BatchReport {
            jobs: jobs.iter().map(VideoJob::summary).collect(),
            output: None,
            music_applied: false,
            cancelled: true,
            elapsed: started.elapsed(),
        }
    }
}
