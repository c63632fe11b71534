//! Worker fixtures implemented against the public worker traits
//!
//! The stub workers move small text files around so scenarios run without
//! yt-dlp or ffmpeg. `SyntheticClipDownloader` renders real clips with the
//! ffmpeg lavfi test sources for the tool-backed tests.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;
use yt_merge::config::ContainerFormat;
use yt_merge::workers::{
    AudioStreamInfo, CrossfadeRequest, DownloadRequest, DownloadedMedia, MediaDownloader,
    MediaInfo, MediaProcessor, NormalizeRequest, OverlayRequest, ProgressFn, TransferProgress,
    VideoStreamInfo,
};
use yt_merge::{DownloadError, MergeError, ProcessingError};

/// Sample YouTube URLs with distinct video ids
pub const SAMPLE_URLS: [&str; 3] = [
    "https://www.youtube.com/watch?v=AAAAAAAAAAA",
    "https://youtu.be/BBBBBBBBBBB",
    "https://www.youtube.com/shorts/CCCCCCCCCCC",
];

/// Downloader writing the source URL into the artifact
pub struct StubDownloader;

#[async_trait]
impl MediaDownloader for StubDownloader {
    async fn download(
        &self,
        request: &DownloadRequest,
        progress: ProgressFn<'_>,
        _cancel: &CancellationToken,
    ) -> Result<DownloadedMedia, DownloadError> {
        let path = PathBuf::from(format!("{}.mp4", request.output_stem.display()));
        tokio::fs::write(&path, &request.url)
            .await
            .map_err(|e| DownloadError::Transient {
                message: e.to_string(),
            })?;
        progress(TransferProgress {
            percent: Some(100.0),
            speed_bps: None,
        });
        Ok(DownloadedMedia {
            path,
            title: None,
            duration_secs: Some(60.0),
        })
    }

    async fn expand_playlist(&self, _url: &str) -> yt_merge::Result<Vec<String>> {
        Ok(SAMPLE_URLS.iter().map(|u| u.to_string()).collect())
    }

    fn name(&self) -> &'static str {
        "stub-downloader"
    }
}

fn worker_failed(e: std::io::Error) -> MergeError {
    MergeError::WorkerFailed(e.to_string())
}

/// Processor that tags and concatenates text artifacts
#[derive(Default)]
pub struct StubProcessor {
    normalize_calls: AtomicUsize,
}

impl StubProcessor {
    /// How many clips were normalized (cache misses)
    pub fn normalize_calls(&self) -> usize {
        self.normalize_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaProcessor for StubProcessor {
    async fn probe(&self, path: &Path) -> Result<MediaInfo, ProcessingError> {
        if !path.exists() {
            return Err(ProcessingError::SourceMissing(path.to_path_buf()));
        }
        Ok(MediaInfo {
            duration_secs: Some(60.0),
            video: Some(VideoStreamInfo {
                codec: "h264".to_string(),
                width: 1920,
                height: 1080,
                fps: Some(30.0),
                pix_fmt: Some("yuv420p".to_string()),
            }),
            audio: Some(AudioStreamInfo {
                codec: "aac".to_string(),
                sample_rate: Some(44_100),
                channels: Some(2),
            }),
        })
    }

    async fn normalize(
        &self,
        request: &NormalizeRequest<'_>,
        progress: ProgressFn<'_>,
        _cancel: &CancellationToken,
    ) -> Result<(), ProcessingError> {
        self.normalize_calls.fetch_add(1, Ordering::SeqCst);
        let raw = tokio::fs::read_to_string(request.input)
            .await
            .map_err(|_| ProcessingError::SourceMissing(request.input.to_path_buf()))?;
        progress(TransferProgress {
            percent: Some(100.0),
            speed_bps: None,
        });
        tokio::fs::write(request.output, format!("clip:{}", raw))
            .await
            .map_err(|_| ProcessingError::SourceMissing(request.output.to_path_buf()))
    }

    async fn concat(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        _format: ContainerFormat,
        _cancel: &CancellationToken,
    ) -> Result<(), MergeError> {
        let mut merged = Vec::new();
        for input in inputs {
            merged.push(tokio::fs::read_to_string(input).await.map_err(worker_failed)?);
        }
        tokio::fs::write(output, merged.join("\n"))
            .await
            .map_err(worker_failed)
    }

    async fn crossfade(
        &self,
        request: &CrossfadeRequest<'_>,
        _progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), MergeError> {
        let inputs: Vec<PathBuf> = request.clips.iter().map(|c| c.path.clone()).collect();
        self.concat(&inputs, request.output, request.format, cancel)
            .await
    }

    async fn overlay_audio(
        &self,
        request: &OverlayRequest<'_>,
        _cancel: &CancellationToken,
    ) -> Result<(), MergeError> {
        let video = tokio::fs::read_to_string(request.video)
            .await
            .map_err(worker_failed)?;
        tokio::fs::write(request.output, format!("music\n{}", video))
            .await
            .map_err(worker_failed)
    }

    fn name(&self) -> &'static str {
        "stub-processor"
    }
}

/// Downloader rendering a short synthetic clip with ffmpeg for every URL
///
/// Clips alternate between 640x360 and 1280x720, and every other clip has
/// no audio, so normalization has real work to do.
pub struct SyntheticClipDownloader {
    pub seconds: u32,
    rendered: AtomicUsize,
}

impl SyntheticClipDownloader {
    pub fn new(seconds: u32) -> Self {
        Self {
            seconds,
            rendered: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl MediaDownloader for SyntheticClipDownloader {
    async fn download(
        &self,
        request: &DownloadRequest,
        _progress: ProgressFn<'_>,
        _cancel: &CancellationToken,
    ) -> Result<DownloadedMedia, DownloadError> {
        let n = self.rendered.fetch_add(1, Ordering::SeqCst);
        let size = if n % 2 == 0 { "640x360" } else { "1280x720" };
        let path = PathBuf::from(format!("{}.mp4", request.output_stem.display()));

        let mut cmd = tokio::process::Command::new("ffmpeg");
        cmd.args(["-y", "-hide_banner", "-loglevel", "error", "-f", "lavfi", "-i"])
            .arg(format!(
                "testsrc=size={}:rate=25:duration={}",
                size, self.seconds
            ));
        if n % 2 == 0 {
            cmd.args(["-f", "lavfi", "-i"])
                .arg(format!("sine=frequency=440:duration={}", self.seconds));
        }
        let status = cmd
            .arg(&path)
            .status()
            .await
            .map_err(|e| DownloadError::Permanent {
                message: e.to_string(),
            })?;
        if !status.success() {
            return Err(DownloadError::Permanent {
                message: format!("ffmpeg exited with {}", status),
            });
        }

        Ok(DownloadedMedia {
            path,
            title: Some(format!("synthetic clip {}", n)),
            duration_secs: Some(f64::from(self.seconds)),
        })
    }

    async fn expand_playlist(&self, _url: &str) -> yt_merge::Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn name(&self) -> &'static str {
        "synthetic-clip-downloader"
    }
}
