//! Shared test helpers: scripted in-process workers and pipeline construction.

use crate::config::Config;
use crate::error::{DownloadError, MergeError, ProcessingError};
use crate::pipeline::Pipeline;
use crate::retry::Sleeper;
use crate::types::{EncoderClass, Event, TrimRange};
use crate::workers::{
    AudioStreamInfo, CrossfadeRequest, DownloadRequest, DownloadedMedia, EncoderProfile,
    EncoderProvider, MediaDownloader, MediaInfo, MediaProcessor, NormalizeRequest, OverlayRequest,
    ProgressFn, TransferProgress, VideoStreamInfo, Workers,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Scripted outcome of one download attempt
#[derive(Debug, Clone)]
pub(crate) enum DownloadScript {
    Succeed,
    Transient(&'static str),
    Permanent(&'static str),
    /// Block until cancelled
    Hang,
    /// Panic inside the worker
    Panic,
}

/// Download worker writing the URL into the artifact
#[derive(Default)]
pub(crate) struct MockDownloader {
    scripts: Mutex<HashMap<String, VecDeque<DownloadScript>>>,
    calls: Mutex<Vec<String>>,
    active: AtomicUsize,
    peak: AtomicUsize,
    delay: Mutex<Option<Duration>>,
    playlists: Mutex<HashMap<String, Vec<String>>>,
}

impl MockDownloader {
    /// Queue scripted outcomes for `url`; once exhausted, attempts succeed
    pub(crate) fn script(&self, url: &str, outcomes: impl IntoIterator<Item = DownloadScript>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .extend(outcomes);
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub(crate) fn set_playlist(&self, url: &str, entries: &[&str]) {
        self.playlists.lock().unwrap().insert(
            url.to_string(),
            entries.iter().map(|e| e.to_string()).collect(),
        );
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub(crate) fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_script(&self, url: &str) -> DownloadScript {
        self.scripts
            .lock()
            .unwrap()
            .get_mut(url)
            .and_then(VecDeque::pop_front)
            .unwrap_or(DownloadScript::Succeed)
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaDownloader for MockDownloader {
    async fn download(
        &self,
        request: &DownloadRequest,
        progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<DownloadedMedia, DownloadError> {
        self.calls.lock().unwrap().push(request.url.clone());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _active = ActiveGuard(&self.active);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        match self.next_script(&request.url) {
            DownloadScript::Succeed => {}
            DownloadScript::Transient(message) => {
                return Err(DownloadError::Transient {
                    message: message.to_string(),
                });
            }
            DownloadScript::Permanent(message) => {
                return Err(DownloadError::Permanent {
                    message: message.to_string(),
                });
            }
            DownloadScript::Hang => {
                cancel.cancelled().await;
                return Err(DownloadError::Cancelled);
            }
            DownloadScript::Panic => panic!("scripted worker panic"),
        }

        progress(TransferProgress {
            percent: Some(50.0),
            speed_bps: Some(1_000_000),
        });
        let path = PathBuf::from(format!("{}.mp4", request.output_stem.display()));
        tokio::fs::write(&path, request.url.as_bytes())
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
            title: Some(format!("Title of {}", request.url)),
            duration_secs: Some(120.0),
        })
    }

    async fn expand_playlist(&self, url: &str) -> crate::Result<Vec<String>> {
        Ok(self
            .playlists
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or_default())
    }

    fn name(&self) -> &'static str {
        "mock-downloader"
    }
}

/// One recorded normalize invocation
#[derive(Debug, Clone)]
pub(crate) struct NormalizeCall {
    pub(crate) input: PathBuf,
    pub(crate) trim: TrimRange,
    pub(crate) encoder: EncoderClass,
    pub(crate) input_has_audio: bool,
}

/// Processing worker operating on small text files
///
/// Normalized artifacts contain `normalized:<encoder>:<raw contents>`, merged
/// outputs the clip contents joined by newlines, so tests can read back what
/// was merged and in which order.
#[derive(Default)]
pub(crate) struct MockProcessor {
    normalize_calls: Mutex<Vec<NormalizeCall>>,
    concat_calls: Mutex<Vec<Vec<PathBuf>>>,
    crossfade_calls: AtomicUsize,
    overlay_calls: AtomicUsize,
    /// GPU encodes fail with an NVENC error
    pub(crate) gpu_broken: AtomicBool,
    /// Overlay fails with a worker error
    pub(crate) overlay_broken: AtomicBool,
    /// Normalize blocks until cancelled
    pub(crate) hang_normalize: AtomicBool,
    /// Sources whose normalized clip probes as 1280x720
    low_res_sources: Mutex<Vec<String>>,
    /// Sources whose normalize fails with a non-GPU error
    corrupt_sources: Mutex<Vec<String>>,
    /// Raw sources probed without an audio stream
    silent_sources: Mutex<Vec<String>>,
}

impl MockProcessor {
    pub(crate) fn mark_low_res(&self, url: &str) {
        self.low_res_sources.lock().unwrap().push(url.to_string());
    }

    pub(crate) fn mark_corrupt(&self, url: &str) {
        self.corrupt_sources.lock().unwrap().push(url.to_string());
    }

    pub(crate) fn mark_silent(&self, url: &str) {
        self.silent_sources.lock().unwrap().push(url.to_string());
    }

    pub(crate) fn normalize_calls(&self) -> Vec<NormalizeCall> {
        self.normalize_calls.lock().unwrap().clone()
    }

    pub(crate) fn concat_calls(&self) -> Vec<Vec<PathBuf>> {
        self.concat_calls.lock().unwrap().clone()
    }

    pub(crate) fn crossfade_count(&self) -> usize {
        self.crossfade_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn overlay_count(&self) -> usize {
        self.overlay_calls.load(Ordering::SeqCst)
    }

    fn matches(list: &Mutex<Vec<String>>, contents: &str) -> bool {
        list.lock().unwrap().iter().any(|url| contents.contains(url.as_str()))
    }
}

async fn read_all(paths: &[PathBuf]) -> Result<Vec<String>, MergeError> {
    let mut contents = Vec::with_capacity(paths.len());
    for path in paths {
        contents.push(
            tokio::fs::read_to_string(path)
                .await
                .map_err(|e| MergeError::WorkerFailed(e.to_string()))?,
        );
    }
    Ok(contents)
}

#[async_trait]
impl MediaProcessor for MockProcessor {
    async fn probe(&self, path: &Path) -> Result<MediaInfo, ProcessingError> {
        let contents =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|e| ProcessingError::ProbeFailed {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })?;
        let (width, height) = if Self::matches(&self.low_res_sources, &contents) {
            (1280, 720)
        } else {
            (1920, 1080)
        };
        // Normalized clips always carry an audio track
        let silent =
            !contents.starts_with("normalized:") && Self::matches(&self.silent_sources, &contents);
        let audio = (!silent).then(|| AudioStreamInfo {
            codec: "aac".to_string(),
            sample_rate: Some(44_100),
            channels: Some(2),
        });
        Ok(MediaInfo {
            duration_secs: Some(120.0),
            video: Some(VideoStreamInfo {
                codec: "h264".to_string(),
                width,
                height,
                fps: Some(30.0),
                pix_fmt: Some("yuv420p".to_string()),
            }),
            audio,
        })
    }

    async fn normalize(
        &self,
        request: &NormalizeRequest<'_>,
        progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), ProcessingError> {
        self.normalize_calls.lock().unwrap().push(NormalizeCall {
            input: request.input.to_path_buf(),
            trim: request.trim,
            encoder: request.encoder.class,
            input_has_audio: request.input_has_audio,
        });

        if self.hang_normalize.load(Ordering::SeqCst) {
            // Leave a partial file behind, as a killed encoder would
            tokio::fs::write(request.output, b"partial").await.ok();
            cancel.cancelled().await;
            return Err(ProcessingError::Cancelled);
        }

        let raw = tokio::fs::read_to_string(request.input)
            .await
            .map_err(|_| ProcessingError::SourceMissing(request.input.to_path_buf()))?;

        if request.encoder.is_gpu() && self.gpu_broken.load(Ordering::SeqCst) {
            return Err(ProcessingError::WorkerFailed {
                message: "ffmpeg exited with non-zero status".to_string(),
                stderr: "[h264_nvenc @ 0x5581] OpenEncodeSessionEx failed: no capable devices found".to_string(),
                exit_code: Some(1),
                encoder: EncoderClass::Gpu,
            });
        }
        if Self::matches(&self.corrupt_sources, &raw) {
            return Err(ProcessingError::WorkerFailed {
                message: "ffmpeg exited with non-zero status".to_string(),
                stderr: "Invalid data found when processing input".to_string(),
                exit_code: Some(1),
                encoder: request.encoder.class,
            });
        }

        progress(TransferProgress {
            percent: Some(100.0),
            speed_bps: None,
        });
        let contents = format!("normalized:{}:{}", request.encoder.class, raw);
        tokio::fs::write(request.output, contents)
            .await
            .map_err(|_| ProcessingError::SourceMissing(request.output.to_path_buf()))
    }

    async fn concat(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        _format: crate::config::ContainerFormat,
        _cancel: &CancellationToken,
    ) -> Result<(), MergeError> {
        self.concat_calls.lock().unwrap().push(inputs.to_vec());
        let contents = read_all(inputs).await?;
        tokio::fs::write(output, contents.join("\n"))
            .await
            .map_err(|e| MergeError::WorkerFailed(e.to_string()))
    }

    async fn crossfade(
        &self,
        request: &CrossfadeRequest<'_>,
        progress: ProgressFn<'_>,
        _cancel: &CancellationToken,
    ) -> Result<(), MergeError> {
        self.crossfade_calls.fetch_add(1, Ordering::SeqCst);
        if request.encoder.is_gpu() && self.gpu_broken.load(Ordering::SeqCst) {
            return Err(MergeError::WorkerFailed(
                "[h264_nvenc @ 0x5581] OpenEncodeSessionEx failed: out of memory".to_string(),
            ));
        }
        let paths: Vec<PathBuf> = request.clips.iter().map(|c| c.path.clone()).collect();
        let contents = read_all(&paths).await?;
        progress(TransferProgress {
            percent: Some(100.0),
            speed_bps: None,
        });
        tokio::fs::write(
            request.output,
            format!("crossfade:{}\n{}", request.encoder.class, contents.join("\n")),
        )
        .await
        .map_err(|e| MergeError::WorkerFailed(e.to_string()))
    }

    async fn overlay_audio(
        &self,
        request: &OverlayRequest<'_>,
        _cancel: &CancellationToken,
    ) -> Result<(), MergeError> {
        self.overlay_calls.fetch_add(1, Ordering::SeqCst);
        if self.overlay_broken.load(Ordering::SeqCst) {
            return Err(MergeError::WorkerFailed(
                "music.mp3: Invalid data found when processing input".to_string(),
            ));
        }
        let video = tokio::fs::read_to_string(request.video)
            .await
            .map_err(|e| MergeError::WorkerFailed(e.to_string()))?;
        tokio::fs::write(request.output, format!("music:{}\n{}", request.volume, video))
            .await
            .map_err(|e| MergeError::WorkerFailed(e.to_string()))
    }

    fn name(&self) -> &'static str {
        "mock-processor"
    }
}

/// Capability provider returning a fixed profile and counting queries
pub(crate) struct MockEncoder {
    profile: EncoderProfile,
    pub(crate) queries: AtomicUsize,
}

impl MockEncoder {
    pub(crate) fn new(profile: EncoderProfile) -> Self {
        Self {
            profile,
            queries: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl EncoderProvider for MockEncoder {
    async fn detect_encoder(&self) -> EncoderProfile {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.profile.clone()
    }

    fn name(&self) -> &'static str {
        "mock-encoder"
    }
}

/// Sleeper that records requested delays and returns immediately
#[derive(Default)]
pub(crate) struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub(crate) fn delays(&self) -> Vec<Duration> {
        self.delays.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.delays.lock().unwrap().push(duration);
        tokio::task::yield_now().await;
    }
}

/// Handles onto the mocks behind a test pipeline
pub(crate) struct TestWorkers {
    pub(crate) downloader: Arc<MockDownloader>,
    pub(crate) processor: Arc<MockProcessor>,
    pub(crate) encoder: Arc<MockEncoder>,
    pub(crate) sleeper: Arc<RecordingSleeper>,
}

/// Base configuration for tests: CPU encoder, cache inside `dir`
pub(crate) fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.cache.cache_dir = dir.join("cache");
    config.normalize.prefer_gpu = false;
    config
}

/// Build a pipeline over fresh mocks
pub(crate) async fn create_test_pipeline_with(
    config: Config,
    encoder: EncoderProfile,
) -> (Pipeline, TestWorkers) {
    let workers = TestWorkers {
        downloader: Arc::new(MockDownloader::default()),
        processor: Arc::new(MockProcessor::default()),
        encoder: Arc::new(MockEncoder::new(encoder)),
        sleeper: Arc::new(RecordingSleeper::default()),
    };
    let pipeline = Pipeline::new(
        config,
        Workers::new(
            workers.downloader.clone(),
            workers.processor.clone(),
            workers.encoder.clone(),
        ),
    )
    .await
    .unwrap()
    .with_sleeper(workers.sleeper.clone());
    (pipeline, workers)
}

/// Helper to create a test pipeline with default settings and a CPU encoder.
/// Returns the pipeline, its mocks and the tempdir (which must be kept alive).
pub(crate) async fn create_test_pipeline() -> (Pipeline, TestWorkers, tempfile::TempDir) {
    let temp_dir = tempdir().unwrap();
    let config = test_config(temp_dir.path());
    let (pipeline, workers) = create_test_pipeline_with(config, EncoderProfile::cpu()).await;
    (pipeline, workers, temp_dir)
}

/// Drain every event currently buffered in `rx`
pub(crate) fn drain(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
