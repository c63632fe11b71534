//! Error types for yt-merge
//!
//! This module provides the error taxonomy of the pipeline:
//! - Download errors, classified as transient (retryable) or permanent
//! - Processing errors from the normalize worker, with GPU attribution for fallback
//! - Merge errors, which are the only batch-fatal stage failures
//! - Cache index errors (a corrupted index is recovered, never surfaced)
//! - Machine-readable error codes for presentation layers

use std::path::PathBuf;
use thiserror::Error;

use crate::types::{EncoderClass, JobId, Status};

/// Result type alias for yt-merge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for yt-merge
///
/// Stage-local failures are recovered inside the pipeline and recorded on the
/// job; only the variants reaching the caller of [`crate::Pipeline::run`] abort
/// a batch (configuration problems and merge failures).
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "download.max_concurrent_jobs")
        key: Option<String>,
    },

    /// Cache index operation failed
    #[error("cache index error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx error from the cache index
    #[error("cache index error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Download stage error
    #[error("download error: {0}")]
    Download(#[from] DownloadError),

    /// Normalize stage error
    #[error("processing error: {0}")]
    Processing(#[from] ProcessingError),

    /// Merge stage failed; upstream artifacts stay cached for a retry
    #[error("merge failed: {source} ({} job(s) normalized and cached)", succeeded.len())]
    Merge {
        /// The underlying merge failure
        #[source]
        source: MergeError,
        /// Jobs that reached the normalized state before the merge failed
        succeeded: Vec<JobId>,
    },

    /// Rejected job status transition
    #[error("job {id}: invalid transition {from:?} -> {to:?}")]
    InvalidTransition {
        /// Job whose transition was rejected
        id: JobId,
        /// Current status
        from: Status,
        /// Requested status
        to: Status,
    },

    /// Invalid line in a batch file
    #[error("invalid batch line {line}: {reason}")]
    InvalidBatchLine {
        /// 1-based line number
        line: usize,
        /// Why the line was rejected
        reason: String,
    },

    /// Timestamp could not be parsed
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// A run is already in progress on this pipeline
    #[error("a batch is already running")]
    AlreadyRunning,

    /// Operation cancelled by the user
    #[error("operation cancelled")]
    Cancelled,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// External tool could not be started or produced unusable output
    #[error("external tool error: {0}")]
    ExternalTool(String),

    /// Operation not supported (missing binary, unsupported platform)
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Cache index errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to open the index
    #[error("failed to open cache index: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to migrate cache index: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),
}

/// Download stage errors
#[derive(Debug, Clone, Error)]
pub enum DownloadError {
    /// Network, rate-limit or other recoverable failure
    #[error("transient download failure: {message}")]
    Transient {
        /// Human-readable cause
        message: String,
    },

    /// Unavailable, private, region-locked or otherwise unrecoverable source
    #[error("permanent download failure: {message}")]
    Permanent {
        /// Human-readable cause
        message: String,
    },

    /// Worker exited successfully but the artifact could not be found
    #[error("download worker produced no file at {path}")]
    MissingOutput {
        /// Where the artifact was expected
        path: PathBuf,
    },

    /// Attempt exceeded the configured timeout
    #[error("download timed out after {0} seconds")]
    Timeout(u64),

    /// Cancelled while downloading
    #[error("download cancelled")]
    Cancelled,
}

/// Processing worker errors (normalize stage and probing)
#[derive(Debug, Clone, Error)]
pub enum ProcessingError {
    /// Worker exited with a failure status
    #[error("{encoder} encode failed (exit code {exit_code:?}): {message}")]
    WorkerFailed {
        /// Human-readable cause
        message: String,
        /// Tail of the worker's stderr
        stderr: String,
        /// Exit code, if the process exited normally
        exit_code: Option<i32>,
        /// Encoder class used by the failed invocation
        encoder: EncoderClass,
    },

    /// Raw artifact is missing
    #[error("source file missing: {0}")]
    SourceMissing(PathBuf),

    /// Media probe failed
    #[error("probe failed for {path}: {reason}")]
    ProbeFailed {
        /// Probed file
        path: PathBuf,
        /// Why probing failed
        reason: String,
    },

    /// Trim range is empty or lies beyond the end of the media
    #[error("invalid trim range: {0}")]
    InvalidTrim(String),

    /// Attempt exceeded the configured timeout
    #[error("processing timed out after {0} seconds")]
    Timeout(u64),

    /// Cancelled while processing
    #[error("processing cancelled")]
    Cancelled,
}

/// Merge stage errors
#[derive(Debug, Clone, Error)]
pub enum MergeError {
    /// Normalized artifacts differ in stream parameters
    #[error("clips are not stream-copy compatible: {reason} (hint: enable crossfade mode to re-encode)")]
    Incompatible {
        /// Which parameter differs and between which clips
        reason: String,
    },

    /// Nothing reached the normalized state
    #[error("no normalized clips to merge")]
    NoInputs,

    /// Merge worker failed
    #[error("merge worker failed: {0}")]
    WorkerFailed(String),

    /// Output path could not be prepared or written
    #[error("cannot write output {path}: {reason}")]
    Output {
        /// Destination path
        path: PathBuf,
        /// Why writing failed
        reason: String,
    },

    /// Cancelled while merging
    #[error("merge cancelled")]
    Cancelled,
}

impl ProcessingError {
    /// Whether this failure is specifically attributable to the GPU encode path
    ///
    /// Only such failures trigger the per-job fallback to the CPU encoder.
    pub fn is_gpu_failure(&self) -> bool {
        match self {
            ProcessingError::WorkerFailed {
                encoder: EncoderClass::Gpu,
                stderr,
                message,
                ..
            } => mentions_gpu_path(message) || mentions_gpu_path(stderr),
            _ => false,
        }
    }
}

/// Whether worker output points at the hardware encode/decode path
pub(crate) fn mentions_gpu_path(output: &str) -> bool {
    let haystack = output.to_ascii_lowercase();
    GPU_FAILURE_MARKERS
        .iter()
        .any(|marker| haystack.contains(marker))
}

/// Substrings in ffmpeg output that point at the hardware encode/decode path
const GPU_FAILURE_MARKERS: &[&str] = &[
    "nvenc",
    "cuda",
    "cuvid",
    "nvcuvid",
    "hwaccel",
    "openencodesessionex",
    "libnvidia",
    "no capable devices found",
    "out of memory",
];

impl Error {
    /// Machine-readable error code for presentation layers
    pub fn error_code(&self) -> &str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Database(_) | Error::Sqlx(_) => "cache_index_error",
            Error::Download(e) => match e {
                DownloadError::Transient { .. } => "transient_download_error",
                DownloadError::Permanent { .. } => "permanent_download_error",
                DownloadError::MissingOutput { .. } => "download_missing_output",
                DownloadError::Timeout(_) => "download_timeout",
                DownloadError::Cancelled => "cancelled",
            },
            Error::Processing(e) => match e {
                ProcessingError::Cancelled => "cancelled",
                ProcessingError::Timeout(_) => "processing_timeout",
                _ => "processing_error",
            },
            Error::Merge { source, .. } => match source {
                MergeError::Incompatible { .. } => "merge_incompatible",
                MergeError::NoInputs => "merge_no_inputs",
                MergeError::Cancelled => "cancelled",
                _ => "merge_failed",
            },
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::InvalidBatchLine { .. } => "invalid_batch_line",
            Error::InvalidTimestamp(_) => "invalid_timestamp",
            Error::AlreadyRunning => "already_running",
            Error::Cancelled => "cancelled",
            Error::Io(_) => "io_error",
            Error::Serialization(_) => "serialization_error",
            Error::ExternalTool(_) => "external_tool_error",
            Error::NotSupported(_) => "not_supported",
            Error::Other(_) => "internal_error",
        }
    }

    /// Shorthand for a configuration error naming the offending key
    pub fn config(message: impl Into<String>, key: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.into()),
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn worker_failure(encoder: EncoderClass, stderr: &str) -> ProcessingError {
        ProcessingError::WorkerFailed {
            message: "ffmpeg exited with non-zero status".to_string(),
            stderr: stderr.to_string(),
            exit_code: Some(1),
            encoder,
        }
    }

    #[test]
    fn gpu_failure_requires_gpu_encoder_and_marker() {
        let nvenc = worker_failure(
            EncoderClass::Gpu,
            "[h264_nvenc @ 0x55] OpenEncodeSessionEx failed: out of memory (10)",
        );
        assert!(nvenc.is_gpu_failure());

        let cpu = worker_failure(EncoderClass::Cpu, "[h264_nvenc] cuda error");
        assert!(
            !cpu.is_gpu_failure(),
            "a CPU encode can never be a GPU-path failure"
        );

        let unrelated = worker_failure(EncoderClass::Gpu, "Invalid data found when processing input");
        assert!(
            !unrelated.is_gpu_failure(),
            "a corrupt input is not attributable to the GPU"
        );
    }

    #[test]
    fn non_worker_errors_are_never_gpu_failures() {
        assert!(!ProcessingError::Timeout(600).is_gpu_failure());
        assert!(!ProcessingError::Cancelled.is_gpu_failure());
        assert!(!ProcessingError::SourceMissing(PathBuf::from("/tmp/x.mp4")).is_gpu_failure());
    }

    #[test]
    fn merge_incompatible_carries_crossfade_hint() {
        let err = MergeError::Incompatible {
            reason: "clip 2 is 1280x720, clip 1 is 1920x1080".to_string(),
        };
        assert!(err.to_string().contains("crossfade"));
    }

    #[test]
    fn error_codes_distinguish_download_classes() {
        let transient = Error::Download(DownloadError::Transient {
            message: "HTTP Error 429".to_string(),
        });
        let permanent = Error::Download(DownloadError::Permanent {
            message: "Private video".to_string(),
        });
        assert_eq!(transient.error_code(), "transient_download_error");
        assert_eq!(permanent.error_code(), "permanent_download_error");
    }

    #[test]
    fn merge_error_reports_succeeded_count() {
        let err = Error::Merge {
            source: MergeError::NoInputs,
            succeeded: vec![JobId::from_raw("aaa"), JobId::from_raw("bbb")],
        };
        assert_eq!(err.error_code(), "merge_no_inputs");
        assert!(err.to_string().contains("2 job(s)"));
    }
}
