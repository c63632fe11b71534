//! Traits and types for the external workers
//!
//! The pipeline drives three collaborators through these seams: a download
//! worker, a media processing worker, and an encoder capability provider.
//! The CLI implementations wrap yt-dlp, ffmpeg/ffprobe and nvidia-smi; tests
//! substitute in-process fakes.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::progress::TransferProgress;
use crate::cache::NormalizeTarget;
use crate::config::ContainerFormat;
use crate::error::{DownloadError, MergeError, ProcessingError};
use crate::types::{EncoderClass, TrimRange};

/// Progress callback handed to workers
pub type ProgressFn<'a> = &'a (dyn Fn(TransferProgress) + Send + Sync);

/// Download worker input
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    /// Source locator
    pub url: String,
    /// Output path without extension; the worker appends the container's
    pub output_stem: PathBuf,
    /// Upper bound on the video height selected by the worker
    pub height_cap: Option<u32>,
    /// Netscape cookie file for authenticated sources
    pub cookies_file: Option<PathBuf>,
    /// Per-attempt timeout
    pub timeout: Option<Duration>,
}

/// Download worker output
#[must_use]
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadedMedia {
    /// Where the media file was written
    pub path: PathBuf,
    /// Title reported by the worker
    pub title: Option<String>,
    /// Duration in seconds reported by the worker
    pub duration_secs: Option<f64>,
}

/// Trait for the download worker
#[async_trait]
pub trait MediaDownloader: Send + Sync {
    /// Fetch `request.url` to `request.output_stem.<ext>`
    ///
    /// # Errors
    ///
    /// Failures are classified as [`DownloadError::Transient`] (retryable) or
    /// [`DownloadError::Permanent`] (unavailable, private, region-locked).
    async fn download(
        &self,
        request: &DownloadRequest,
        progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<DownloadedMedia, DownloadError>;

    /// Resolve a playlist URL into its entries' URLs, in playlist order
    async fn expand_playlist(&self, url: &str) -> crate::Result<Vec<String>>;

    /// Human-readable name for logging
    fn name(&self) -> &'static str;
}

/// Stream parameters of a video stream
#[derive(Debug, Clone, PartialEq)]
pub struct VideoStreamInfo {
    /// Codec name ("h264")
    pub codec: String,
    /// Frame width
    pub width: u32,
    /// Frame height
    pub height: u32,
    /// Frame rate, if determinable
    pub fps: Option<f64>,
    /// Pixel format ("yuv420p")
    pub pix_fmt: Option<String>,
}

/// Stream parameters of an audio stream
#[derive(Debug, Clone, PartialEq)]
pub struct AudioStreamInfo {
    /// Codec name ("aac")
    pub codec: String,
    /// Sample rate in Hz
    pub sample_rate: Option<u32>,
    /// Channel count
    pub channels: Option<u32>,
}

/// Result of probing a media file
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MediaInfo {
    /// Container duration in seconds
    pub duration_secs: Option<f64>,
    /// First video stream
    pub video: Option<VideoStreamInfo>,
    /// First audio stream
    pub audio: Option<AudioStreamInfo>,
}

impl MediaInfo {
    /// Whether the file carries an audio stream
    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }
}

/// Encoder settings chosen by the capability provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderProfile {
    /// GPU or CPU
    pub class: EncoderClass,
    /// ffmpeg video encoder ("h264_nvenc", "libx264")
    pub codec: String,
    /// Encoder preset
    pub preset: String,
    /// Input options enabling hardware decoding
    pub hwaccel_args: Vec<String>,
    /// Rate-control options
    pub quality_args: Vec<String>,
}

impl EncoderProfile {
    /// Software H.264 profile
    pub fn cpu() -> Self {
        Self {
            class: EncoderClass::Cpu,
            codec: "libx264".to_string(),
            preset: "ultrafast".to_string(),
            hwaccel_args: Vec::new(),
            quality_args: vec!["-crf".into(), "23".into()],
        }
    }

    /// NVIDIA NVENC H.264 profile
    pub fn nvenc() -> Self {
        Self {
            class: EncoderClass::Gpu,
            codec: "h264_nvenc".to_string(),
            preset: "p4".to_string(),
            hwaccel_args: vec!["-hwaccel".into(), "cuda".into()],
            quality_args: vec![
                "-cq".into(),
                "23".into(),
                "-spatial_aq".into(),
                "1".into(),
            ],
        }
    }

    /// Whether this profile uses the GPU
    pub fn is_gpu(&self) -> bool {
        self.class == EncoderClass::Gpu
    }

    /// Label for logs ("h264_nvenc (GPU)")
    pub fn label(&self) -> String {
        format!(
            "{} ({})",
            self.codec,
            if self.is_gpu() { "GPU" } else { "CPU" }
        )
    }
}

/// Normalize stage worker input
#[derive(Debug, Clone)]
pub struct NormalizeRequest<'a> {
    /// Raw artifact
    pub input: &'a Path,
    /// Output file (its extension selects the container)
    pub output: &'a Path,
    /// Trim bounds
    pub trim: TrimRange,
    /// Canonical intermediate format
    pub target: &'a NormalizeTarget,
    /// Encoder to use for this attempt
    pub encoder: &'a EncoderProfile,
    /// Whether the input has an audio stream (silence is synthesized otherwise)
    pub input_has_audio: bool,
    /// Expected output duration, used to compute progress
    pub expected_duration_secs: Option<f64>,
    /// Per-attempt timeout
    pub timeout: Option<Duration>,
}

/// Crossfade merge input clip
#[derive(Debug, Clone, PartialEq)]
pub struct CrossfadeClip {
    /// Normalized artifact
    pub path: PathBuf,
    /// Clip duration in seconds, if known
    pub duration_secs: Option<f64>,
}

/// Crossfade merge input
#[derive(Debug, Clone)]
pub struct CrossfadeRequest<'a> {
    /// Clips in merge order
    pub clips: &'a [CrossfadeClip],
    /// Output file
    pub output: &'a Path,
    /// Transition length in seconds
    pub fade_secs: f64,
    /// Encoder for the re-encode
    pub encoder: &'a EncoderProfile,
    /// AAC bitrate
    pub audio_bitrate: &'a str,
    /// Output container
    pub format: ContainerFormat,
}

/// Background music overlay input
#[derive(Debug, Clone)]
pub struct OverlayRequest<'a> {
    /// Merged video
    pub video: &'a Path,
    /// Music track (looped to cover the video)
    pub music: &'a Path,
    /// Music volume scalar
    pub volume: f32,
    /// Output file
    pub output: &'a Path,
    /// AAC bitrate of the mixed track
    pub audio_bitrate: &'a str,
    /// Output container
    pub format: ContainerFormat,
}

/// Trait for the media processing worker
#[async_trait]
pub trait MediaProcessor: Send + Sync {
    /// Read container and stream parameters
    async fn probe(&self, path: &Path) -> Result<MediaInfo, ProcessingError>;

    /// Trim, rescale and transcode into the canonical intermediate format
    ///
    /// # Errors
    ///
    /// [`ProcessingError::WorkerFailed`] carries the encoder class and stderr
    /// tail so callers can tell GPU-path failures apart.
    async fn normalize(
        &self,
        request: &NormalizeRequest<'_>,
        progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), ProcessingError>;

    /// Stream-copy concatenation of compatible clips, no re-encode
    async fn concat(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        format: ContainerFormat,
        cancel: &CancellationToken,
    ) -> Result<(), MergeError>;

    /// Re-encoded merge with blended transitions between consecutive clips
    async fn crossfade(
        &self,
        request: &CrossfadeRequest<'_>,
        progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), MergeError>;

    /// Mix a looped music track into the video's audio, copying the video stream
    async fn overlay_audio(
        &self,
        request: &OverlayRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), MergeError>;

    /// Human-readable name for logging
    fn name(&self) -> &'static str;
}

/// Trait for the encoder capability provider
///
/// Queried once per pipeline.
#[async_trait]
pub trait EncoderProvider: Send + Sync {
    /// Best available encoder
    async fn detect_encoder(&self) -> EncoderProfile;

    /// Human-readable name for logging
    fn name(&self) -> &'static str;
}
