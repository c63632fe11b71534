//! Event emission: per-job reporters, aggregate progress, consumer-side ordering

use crate::error::Result;
use crate::types::{Event, JobId, ProgressEvent, Stage, Status, VideoJob};
use crate::workers::TransferProgress;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// Aggregate progress over job-stage units
///
/// Each job contributes two units (download, normalize) and the merge one
/// more. A job that stops early completes its remaining units at once so the
/// aggregate still reaches 100%.
#[derive(Debug)]
pub(crate) struct ProgressAggregator {
    total: u32,
    done: AtomicU32,
    tx: broadcast::Sender<Event>,
}

/// Units contributed by each job
pub(crate) const UNITS_PER_JOB: u32 = 2;

impl ProgressAggregator {
    pub(crate) fn new(jobs: usize, tx: broadcast::Sender<Event>) -> Self {
        let jobs = u32::try_from(jobs).unwrap_or(u32::MAX / UNITS_PER_JOB);
        Self {
            total: jobs.saturating_mul(UNITS_PER_JOB).saturating_add(1),
            done: AtomicU32::new(0),
            tx,
        }
    }

    /// Mark `units` as finished and emit the new aggregate
    pub(crate) fn complete(&self, units: u32) {
        let done = self.done.fetch_add(units, Ordering::SeqCst) + units;
        self.emit(done as f32);
    }

    /// Report progress inside the merge unit without completing it
    pub(crate) fn merge_progress(&self, percent: f32) {
        let done = self.done.load(Ordering::SeqCst) as f32;
        self.emit(done + (percent / 100.0).clamp(0.0, 1.0));
    }

    /// Current aggregate percent
    pub(crate) fn percent(&self) -> f32 {
        self.to_percent(self.done.load(Ordering::SeqCst) as f32)
    }

    fn to_percent(&self, done: f32) -> f32 {
        ((done / self.total as f32) * 100.0).clamp(0.0, 100.0)
    }

    fn emit(&self, done: f32) {
        self.tx
            .send(Event::PipelineProgress {
                percent: self.to_percent(done),
            })
            .ok();
    }
}

/// Emits one job's events with a shared, strictly increasing sequence
///
/// Status changes and progress snapshots draw from the same counter, and the
/// counter is advanced under the same lock as the send, so a subscriber
/// receives each job's events in sequence order.
#[derive(Debug)]
pub(crate) struct JobReporter {
    id: JobId,
    tx: broadcast::Sender<Event>,
    state: Mutex<ReportedState>,
    units_done: AtomicU32,
    aggregate: Arc<ProgressAggregator>,
}

/// What subscribers have been told so far
#[derive(Debug)]
struct ReportedState {
    sequence: u64,
    status: Status,
}

impl JobReporter {
    pub(crate) fn new(
        id: JobId,
        tx: broadcast::Sender<Event>,
        aggregate: Arc<ProgressAggregator>,
    ) -> Self {
        Self {
            id,
            tx,
            state: Mutex::new(ReportedState {
                sequence: 0,
                status: Status::Pending,
            }),
            units_done: AtomicU32::new(0),
            aggregate,
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ReportedState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn send_sequenced(&self, build: impl FnOnce(u64) -> Event) {
        let mut state = self.lock_state();
        state.sequence += 1;
        // send() only fails without subscribers, which is fine
        self.tx.send(build(state.sequence)).ok();
    }

    fn send(&self, event: Event) {
        self.tx.send(event).ok();
    }

    /// Apply a status transition to `job` and announce it
    pub(crate) fn transition(&self, job: &mut VideoJob, next: Status) -> Result<()> {
        let from = job.transition(next)?;
        tracing::debug!(job_id = %self.id, from = ?from, to = ?next, "status changed");
        let mut state = self.lock_state();
        state.sequence += 1;
        state.status = next;
        self.tx
            .send(Event::StatusChanged {
                id: self.id.clone(),
                from,
                to: next,
                sequence: state.sequence,
            })
            .ok();
        Ok(())
    }

    /// Last status announced for this job
    pub(crate) fn reported_status(&self) -> Status {
        self.lock_state().status
    }

    /// Fail a job whose task died, starting from its last announced status
    ///
    /// `job` is a pre-admission snapshot, so its status is resynced first.
    /// Whatever units the task had not completed are completed here.
    pub(crate) fn abandon(&self, job: &mut VideoJob, message: &str) {
        let reported = self.reported_status();
        job.resync_status(reported);
        job.last_error = Some(message.to_string());

        let (walk, stage): (&[Status], Stage) = match reported {
            Status::Pending => (&[Status::Downloading, Status::Failed], Stage::Download),
            Status::Downloading => (&[Status::Failed], Stage::Download),
            Status::Downloaded => (&[Status::Normalizing, Status::Failed], Stage::Normalize),
            Status::Normalizing => (&[Status::Failed], Stage::Normalize),
            Status::Failed => (&[], Stage::Download),
            Status::Normalized | Status::Merged | Status::Cancelled => (&[], Stage::Normalize),
        };
        for &next in walk {
            if let Err(e) = self.transition(job, next) {
                tracing::warn!(job_id = %self.id, error = %e, "could not fail abandoned job");
                break;
            }
        }
        self.failed(stage, message);

        let remaining = UNITS_PER_JOB.saturating_sub(self.units_done.load(Ordering::SeqCst));
        self.complete_units(remaining);
    }

    /// Forward a worker progress snapshot
    pub(crate) fn progress(&self, stage: Stage, progress: TransferProgress) {
        self.send_sequenced(|sequence| {
            Event::Progress(ProgressEvent {
                job_id: self.id.clone(),
                stage,
                percent: progress.percent,
                speed_bps: progress.speed_bps,
                sequence,
            })
        });
    }

    pub(crate) fn cache_hit(&self, stage: Stage, path: &Path) {
        tracing::info!(job_id = %self.id, stage = %stage, path = %path.display(), "cache hit, skipping worker");
        self.send(Event::CacheHit {
            id: self.id.clone(),
            stage,
            path: path.to_path_buf(),
        });
    }

    pub(crate) fn retry_scheduled(&self, next_attempt: u32, delay: Duration, error: &str) {
        self.send(Event::RetryScheduled {
            id: self.id.clone(),
            next_attempt,
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error: error.to_string(),
        });
    }

    pub(crate) fn encoder_fallback(&self, error: &str) {
        self.send(Event::EncoderFallback {
            id: self.id.clone(),
            error: error.to_string(),
        });
    }

    pub(crate) fn failed(&self, stage: Stage, error: &str) {
        tracing::warn!(job_id = %self.id, stage = %stage, error, "job failed");
        self.send(Event::JobFailed {
            id: self.id.clone(),
            stage,
            error: error.to_string(),
        });
    }

    /// Mark job-stage units finished in the aggregate
    pub(crate) fn complete_units(&self, units: u32) {
        self.units_done.fetch_add(units, Ordering::SeqCst);
        self.aggregate.complete(units);
    }
}

/// Consumer-side filter dropping stale per-job events
///
/// Broadcast receivers see each job's events in order, but a consumer that
/// merges several sources (or replays a log) can use this to discard any
/// status or progress event whose sequence is not newer than the last one
/// seen for that job.
///
/// ```
/// use yt_merge::pipeline::SequenceFilter;
/// use yt_merge::{Event, JobId, Status};
///
/// let mut filter = SequenceFilter::new();
/// let event = |sequence| Event::StatusChanged {
///     id: JobId::from_raw("abc"),
///     from: Status::Pending,
///     to: Status::Downloading,
///     sequence,
/// };
/// assert!(filter.accept(&event(2)));
/// assert!(!filter.accept(&event(1)));
/// ```
#[derive(Debug, Default, Clone)]
pub struct SequenceFilter {
    last_seen: HashMap<JobId, u64>,
}

impl SequenceFilter {
    /// Empty filter
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `event` should be processed; events without a sequence always pass
    pub fn accept(&mut self, event: &Event) -> bool {
        let (id, sequence) = match event {
            Event::StatusChanged { id, sequence, .. } => (id, *sequence),
            Event::Progress(p) => (&p.job_id, p.sequence),
            _ => return true,
        };
        match self.last_seen.get(id) {
            Some(last) if sequence <= *last => false,
            _ => {
                self.last_seen.insert(id.clone(), sequence);
                true
            }
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SourceDescriptor;

    fn job() -> VideoJob {
        let source = SourceDescriptor::new("https://youtu.be/abc");
        VideoJob::new(0, JobId::from_raw("abc"), source, "abc".to_string())
    }

    fn sequence_of(event: &Event) -> Option<u64> {
        match event {
            Event::StatusChanged { sequence, .. } => Some(*sequence),
            Event::Progress(p) => Some(p.sequence),
            _ => None,
        }
    }

    #[tokio::test]
    async fn status_and_progress_share_one_sequence() {
        let (tx, mut rx) = broadcast::channel(16);
        let aggregate = Arc::new(ProgressAggregator::new(1, tx.clone()));
        let reporter = JobReporter::new(JobId::from_raw("abc"), tx, aggregate);
        let mut job = job();

        reporter.transition(&mut job, Status::Downloading).unwrap();
        reporter.progress(
            Stage::Download,
            TransferProgress {
                percent: Some(10.0),
                speed_bps: None,
            },
        );
        reporter.transition(&mut job, Status::Downloaded).unwrap();

        let mut sequences = Vec::new();
        while let Ok(event) = rx.try_recv() {
            sequences.extend(sequence_of(&event));
        }
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn rejected_transition_emits_nothing() {
        let (tx, mut rx) = broadcast::channel(16);
        let aggregate = Arc::new(ProgressAggregator::new(1, tx.clone()));
        let reporter = JobReporter::new(JobId::from_raw("abc"), tx, aggregate);
        let mut job = job();

        assert!(reporter.transition(&mut job, Status::Merged).is_err());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn abandon_resyncs_a_stale_snapshot() {
        let (tx, mut rx) = broadcast::channel(16);
        let aggregate = Arc::new(ProgressAggregator::new(1, tx.clone()));
        let reporter = JobReporter::new(JobId::from_raw("abc"), tx, Arc::clone(&aggregate));

        let mut live = job();
        reporter.transition(&mut live, Status::Downloading).unwrap();
        reporter.transition(&mut live, Status::Downloaded).unwrap();
        reporter.complete_units(1);
        while rx.try_recv().is_ok() {}

        let mut snapshot = job();
        reporter.abandon(&mut snapshot, "internal error: boom");
        assert_eq!(snapshot.status(), Status::Failed);
        assert_eq!(snapshot.last_error.as_deref(), Some("internal error: boom"));

        let mut transitions = Vec::new();
        let mut failed_stage = None;
        while let Ok(event) = rx.try_recv() {
            match event {
                Event::StatusChanged { from, to, sequence, .. } => {
                    transitions.push((from, to, sequence))
                }
                Event::JobFailed { stage, .. } => failed_stage = Some(stage),
                _ => {}
            }
        }
        assert_eq!(
            transitions,
            vec![
                (Status::Downloaded, Status::Normalizing, 3),
                (Status::Normalizing, Status::Failed, 4),
            ]
        );
        assert_eq!(failed_stage, Some(Stage::Normalize));

        // Two job units of three; the merge unit is still outstanding
        assert!((aggregate.percent() - 200.0 / 3.0).abs() < 0.01);
    }

    #[test]
    fn aggregate_counts_units() {
        let (tx, mut rx) = broadcast::channel(16);
        let aggregate = ProgressAggregator::new(2, tx);
        aggregate.complete(1);
        assert!((aggregate.percent() - 20.0).abs() < 0.01);
        aggregate.complete(3);
        aggregate.merge_progress(50.0);
        aggregate.complete(1);
        assert!((aggregate.percent() - 100.0).abs() < 0.01);

        let mut last = 0.0;
        while let Ok(Event::PipelineProgress { percent }) = rx.try_recv() {
            assert!(percent >= last, "aggregate must not go backwards");
            last = percent;
        }
        assert!((last - 100.0).abs() < 0.01);
    }

    #[test]
    fn sequence_filter_is_per_job() {
        let mut filter = SequenceFilter::new();
        let progress = |id: &str, sequence| {
            Event::Progress(ProgressEvent {
                job_id: JobId::from_raw(id),
                stage: Stage::Download,
                percent: None,
                speed_bps: None,
                sequence,
            })
        };
        assert!(filter.accept(&progress("a", 5)));
        assert!(filter.accept(&progress("b", 1)));
        assert!(!filter.accept(&progress("a", 5)));
        assert!(filter.accept(&progress("a", 6)));
        assert!(filter.accept(&Event::BatchCancelled));
    }
}
