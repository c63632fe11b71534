//! Core types for yt-merge

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::MergeMode;
use crate::error::{Error, Result};

/// Stable identifier for a job, derived from its source and trim range
///
/// Two batch entries with the same source and trim range derive the same base
/// identifier; the orchestrator suffixes later occurrences (`-2`, `-3`, ...)
/// so identifiers stay unique within a run.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Derive the identifier from a normalized source identifier and trim range
    pub fn derive(source_id: &str, trim: &TrimRange) -> Self {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(source_id.as_bytes());
        hasher.update(b"|");
        hasher.update(trim.canonical().as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        Self(digest[..JOB_ID_LEN].to_string())
    }

    /// Wrap an already-formed identifier
    pub fn from_raw(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier for the n-th (1-based) occurrence of the same source in a batch
    pub(crate) fn occurrence(&self, n: usize) -> Self {
        if n <= 1 {
            self.clone()
        } else {
            Self(format!("{}-{}", self.0, n))
        }
    }

    /// Borrow the identifier as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Number of hex characters kept from the identifier digest
const JOB_ID_LEN: usize = 12;

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Optional trim bounds in seconds; `None` means start / end of stream
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrimRange {
    /// Start offset in seconds
    pub start: Option<f64>,
    /// End offset in seconds (exclusive)
    pub end: Option<f64>,
}

impl TrimRange {
    /// Full video, no trimming
    pub fn full() -> Self {
        Self::default()
    }

    /// Trim to `[start, end)`
    pub fn new(start: Option<f64>, end: Option<f64>) -> Self {
        Self { start, end }
    }

    /// Whether the range covers the whole video
    pub fn is_full(&self) -> bool {
        self.start.unwrap_or(0.0) <= 0.0 && self.end.is_none()
    }

    /// Start offset, defaulting to zero
    pub fn start_secs(&self) -> f64 {
        self.start.unwrap_or(0.0).max(0.0)
    }

    /// Length of the range if the end is known
    pub fn duration(&self) -> Option<f64> {
        self.end.map(|end| end - self.start_secs())
    }

    /// Reject ranges that end before (or where) they start
    pub fn validate(&self) -> Result<()> {
        if let Some(start) = self.start
            && start < 0.0
        {
            return Err(Error::InvalidTimestamp(format!(
                "start offset {start} is negative"
            )));
        }
        match self.duration() {
            Some(d) if d <= 0.0 => Err(Error::InvalidTimestamp(format!(
                "end {} is not after start {}",
                self.end.unwrap_or_default(),
                self.start_secs()
            ))),
            _ => Ok(()),
        }
    }

    /// Stable textual form used in identifiers and fingerprints (millisecond precision)
    pub fn canonical(&self) -> String {
        let fmt = |v: Option<f64>| match v {
            Some(secs) => format!("{:.3}", secs),
            None => "-".to_string(),
        };
        format!("{}..{}", fmt(self.start.filter(|s| *s > 0.0)), fmt(self.end))
    }
}

/// One entry of a batch as supplied by the user, a batch file or a playlist
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    /// Source locator (video URL)
    pub url: String,
    /// Trim bounds
    #[serde(default)]
    pub trim: TrimRange,
}

impl SourceDescriptor {
    /// Full-length source
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            trim: TrimRange::full(),
        }
    }

    /// Source trimmed to `[start, end)` seconds
    pub fn trimmed(url: impl Into<String>, start: Option<f64>, end: Option<f64>) -> Self {
        Self {
            url: url.into(),
            trim: TrimRange::new(start, end),
        }
    }
}

/// Job status
///
/// Only the transitions enumerated in [`Status::can_transition_to`] are allowed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Waiting for pool admission
    Pending,
    /// Download worker running
    Downloading,
    /// Raw artifact available
    Downloaded,
    /// Processing worker running
    Normalizing,
    /// Concatenation-ready artifact available
    Normalized,
    /// Included in the final output
    Merged,
    /// Failed (retryable from the download stage until the ceiling is reached)
    Failed,
    /// Stopped by a user cancel
    Cancelled,
}

impl Status {
    /// Whether moving from `self` to `next` is a permitted transition
    pub fn can_transition_to(self, next: Status) -> bool {
        use Status::*;
        matches!(
            (self, next),
            (Pending, Downloading)
                | (Pending, Downloaded)
                | (Pending, Cancelled)
                | (Downloading, Downloaded)
                | (Downloading, Failed)
                | (Downloading, Cancelled)
                | (Failed, Downloading)
                // cancelled while waiting out a retry backoff
                | (Failed, Cancelled)
                | (Downloaded, Normalizing)
                | (Downloaded, Normalized)
                | (Downloaded, Cancelled)
                | (Normalizing, Normalized)
                | (Normalizing, Failed)
                | (Normalizing, Cancelled)
                | (Normalized, Merged)
        )
    }

    /// Whether the job has finished its Download+Normalize work
    ///
    /// `Normalized` counts as terminal for the pool; `Merged` is the terminal
    /// success state for the batch.
    pub fn is_stage_terminal(self) -> bool {
        matches!(
            self,
            Status::Normalized | Status::Merged | Status::Failed | Status::Cancelled
        )
    }

    /// Human-readable label for presentation layers
    pub fn label(self) -> &'static str {
        match self {
            Status::Pending => "Pending",
            Status::Downloading => "Downloading...",
            Status::Downloaded => "Downloaded",
            Status::Normalizing => "Processing...",
            Status::Normalized => "Processed",
            Status::Merged => "Done",
            Status::Failed => "Failed",
            Status::Cancelled => "Cancelled",
        }
    }
}

/// Pipeline stage
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Fetch the source
    Download,
    /// Trim, rescale and transcode
    Normalize,
    /// Concatenate into the final output
    Merge,
}

impl Stage {
    /// Stable lowercase name
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Download => "download",
            Stage::Normalize => "normalize",
            Stage::Merge => "merge",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encoder family; part of the normalize fingerprint
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderClass {
    /// Hardware encoder (NVENC)
    Gpu,
    /// Software encoder (libx264)
    Cpu,
}

impl EncoderClass {
    /// Stable lowercase name
    pub fn as_str(self) -> &'static str {
        match self {
            EncoderClass::Gpu => "gpu",
            EncoderClass::Cpu => "cpu",
        }
    }
}

impl std::fmt::Display for EncoderClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One video's journey through the pipeline
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VideoJob {
    /// Stable identifier
    pub id: JobId,
    /// Position in the batch (merge order)
    pub index: usize,
    /// Source as submitted
    pub source: SourceDescriptor,
    /// Normalized source identifier (video id or canonical URL)
    pub source_id: String,
    /// Current status
    status: Status,
    /// Last error recorded by a stage
    pub last_error: Option<String>,
    /// Download retries consumed (attempts beyond the first)
    pub retry_count: u32,
    /// Raw artifact produced by the download stage
    pub raw_path: Option<PathBuf>,
    /// Normalized artifact produced by the normalize stage
    pub normalized_path: Option<PathBuf>,
    /// Title reported by the download worker
    pub title: Option<String>,
    /// Duration of the raw media in seconds, if known
    pub duration_secs: Option<f64>,
    /// Whether the raw artifact came from the cache
    pub download_cached: bool,
    /// Whether the normalized artifact came from the cache
    pub normalize_cached: bool,
    /// Encoder that produced the normalized artifact
    pub encoder_used: Option<EncoderClass>,
}

impl VideoJob {
    /// Create a pending job for a batch entry
    pub fn new(index: usize, id: JobId, source: SourceDescriptor, source_id: String) -> Self {
        Self {
            id,
            index,
            source,
            source_id,
            status: Status::Pending,
            last_error: None,
            retry_count: 0,
            raw_path: None,
            normalized_path: None,
            title: None,
            duration_secs: None,
            download_cached: false,
            normalize_cached: false,
            encoder_used: None,
        }
    }

    /// Current status
    pub fn status(&self) -> Status {
        self.status
    }

    /// Move to `next`, rejecting transitions the state machine does not allow
    pub fn transition(&mut self, next: Status) -> Result<Status> {
        let from = self.status;
        if !from.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                id: self.id.clone(),
                from,
                to: next,
            });
        }
        self.status = next;
        Ok(from)
    }

    /// Overwrite the status of a stale snapshot with the one last announced
    pub(crate) fn resync_status(&mut self, status: Status) {
        self.status = status;
    }

    /// Display name: the worker-reported title, falling back to the URL
    pub fn display_name(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.source.url)
    }

    /// Snapshot for batch reports
    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id.clone(),
            index: self.index,
            url: self.source.url.clone(),
            title: self.title.clone(),
            status: self.status,
            error: self.last_error.clone(),
            retries: self.retry_count,
            download_cached: self.download_cached,
            normalize_cached: self.normalize_cached,
            encoder_used: self.encoder_used,
        }
    }
}

/// Immutable progress snapshot emitted by a stage
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Job the progress belongs to
    pub job_id: JobId,
    /// Stage reporting progress
    pub stage: Stage,
    /// Percent complete (0.0 to 100.0); `None` when indeterminate
    pub percent: Option<f32>,
    /// Instantaneous throughput in bytes per second, if known
    pub speed_bps: Option<u64>,
    /// Per-job monotonically increasing sequence number
    pub sequence: u64,
}

/// Event emitted during a pipeline run
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Job added to the batch
    JobQueued {
        /// Job ID
        id: JobId,
        /// Batch position
        index: usize,
        /// Source URL
        url: String,
    },

    /// Job changed status
    StatusChanged {
        /// Job ID
        id: JobId,
        /// Previous status
        from: Status,
        /// New status
        to: Status,
        /// Per-job sequence number (shared with progress events)
        sequence: u64,
    },

    /// Stage progress
    Progress(ProgressEvent),

    /// Stage served from the cache, no worker invoked
    CacheHit {
        /// Job ID
        id: JobId,
        /// Stage that was skipped
        stage: Stage,
        /// Cached artifact
        path: PathBuf,
    },

    /// Download attempt failed with a transient error and will be retried
    RetryScheduled {
        /// Job ID
        id: JobId,
        /// Attempt number about to start (2-based)
        next_attempt: u32,
        /// Backoff delay before that attempt, in milliseconds
        delay_ms: u64,
        /// Error of the failed attempt
        error: String,
    },

    /// Normalization retried with the CPU encoder after a GPU-path failure
    EncoderFallback {
        /// Job ID
        id: JobId,
        /// Error from the GPU attempt
        error: String,
    },

    /// Job failed terminally
    JobFailed {
        /// Job ID
        id: JobId,
        /// Stage where failure occurred
        stage: Stage,
        /// Human-readable cause
        error: String,
    },

    /// Aggregate progress over all job-stage units
    PipelineProgress {
        /// Percent complete (0.0 to 100.0)
        percent: f32,
    },

    /// Merge stage started
    MergeStarted {
        /// Merge mode
        mode: MergeMode,
        /// Number of clips being merged
        clips: usize,
    },

    /// Merge stage produced the final output
    MergeComplete {
        /// Output path
        path: PathBuf,
    },

    /// Background music could not be mixed; the un-mixed output was kept
    MusicOverlayFailed {
        /// Human-readable cause
        error: String,
    },

    /// Batch finished with an output file
    BatchComplete {
        /// Output path
        output: PathBuf,
        /// Jobs merged into the output
        succeeded: usize,
        /// Jobs excluded because they failed
        failed: usize,
    },

    /// Batch stopped by a user cancel
    BatchCancelled,
}

/// Per-job line of a batch report
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobSummary {
    /// Job ID
    pub id: JobId,
    /// Batch position
    pub index: usize,
    /// Source URL
    pub url: String,
    /// Worker-reported title
    pub title: Option<String>,
    /// Final status
    pub status: Status,
    /// Cause of failure, if any
    pub error: Option<String>,
    /// Download retries consumed
    pub retries: u32,
    /// Raw artifact came from the cache
    pub download_cached: bool,
    /// Normalized artifact came from the cache
    pub normalize_cached: bool,
    /// Encoder that produced the normalized artifact
    pub encoder_used: Option<EncoderClass>,
}

impl JobSummary {
    /// Whether both stages were served from the cache
    pub fn fully_cached(&self) -> bool {
        self.download_cached && self.normalize_cached
    }
}

/// Outcome of a pipeline run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchReport {
    /// Jobs in batch order
    pub jobs: Vec<JobSummary>,
    /// Final output, absent when the run was cancelled
    pub output: Option<PathBuf>,
    /// Whether background music was mixed into the output
    pub music_applied: bool,
    /// Whether the run was cancelled
    pub cancelled: bool,
    /// Wall-clock duration of the run
    pub elapsed: Duration,
}

impl BatchReport {
    /// Jobs included in the output
    pub fn succeeded(&self) -> impl Iterator<Item = &JobSummary> {
        self.jobs
            .iter()
            .filter(|j| matches!(j.status, Status::Merged | Status::Normalized))
    }

    /// Jobs that failed
    pub fn failed(&self) -> impl Iterator<Item = &JobSummary> {
        self.jobs.iter().filter(|j| j.status == Status::Failed)
    }

    /// Jobs stopped by the cancel
    pub fn cancelled_jobs(&self) -> impl Iterator<Item = &JobSummary> {
        self.jobs.iter().filter(|j| j.status == Status::Cancelled)
    }

    /// Jobs whose work was entirely skipped via the cache
    pub fn cached(&self) -> impl Iterator<Item = &JobSummary> {
        self.jobs.iter().filter(|j| j.fully_cached())
    }
}
