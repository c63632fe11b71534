//! Configuration types for yt-merge

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Target output resolution preset
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    /// 854x480
    #[serde(rename = "480p")]
    P480,
    /// 1280x720
    #[serde(rename = "720p")]
    P720,
    /// 1920x1080
    #[serde(rename = "1080p")]
    #[default]
    P1080,
    /// 2560x1440
    #[serde(rename = "1440p")]
    P1440,
}

impl Resolution {
    /// Frame width in pixels
    pub fn width(self) -> u32 {
        match self {
            Resolution::P480 => 854,
            Resolution::P720 => 1280,
            Resolution::P1080 => 1920,
            Resolution::P1440 => 2560,
        }
    }

    /// Frame height in pixels
    pub fn height(self) -> u32 {
        match self {
            Resolution::P480 => 480,
            Resolution::P720 => 720,
            Resolution::P1080 => 1080,
            Resolution::P1440 => 1440,
        }
    }

    /// Preset label ("1080p")
    pub fn label(self) -> &'static str {
        match self {
            Resolution::P480 => "480p",
            Resolution::P720 => "720p",
            Resolution::P1080 => "1080p",
            Resolution::P1440 => "1440p",
        }
    }
}

/// Output container
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    /// MPEG-4 (faststart)
    #[default]
    Mp4,
    /// Matroska
    Mkv,
}

impl ContainerFormat {
    /// File extension without the dot
    pub fn extension(self) -> &'static str {
        match self {
            ContainerFormat::Mp4 => "mp4",
            ContainerFormat::Mkv => "mkv",
        }
    }
}

/// How normalized clips are joined
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// Stream-copy concatenation, no re-encode
    #[default]
    FastConcat,
    /// Re-encoded merge with blended transitions between consecutive clips
    Crossfade,
}

/// How sources with a different aspect ratio are fitted to the target frame
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalePolicy {
    /// Scale down to fit and pad with black bars
    #[default]
    Letterbox,
    /// Scale up to cover and crop the overflow
    Crop,
}

/// Output settings shared by the normalize and merge stages
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Target resolution (default: 1080p)
    #[serde(default)]
    pub resolution: Resolution,

    /// Container of intermediate and final files (default: mp4)
    #[serde(default)]
    pub format: ContainerFormat,

    /// Target frame rate (default: 30)
    #[serde(default = "default_fps")]
    pub fps: u32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            resolution: Resolution::default(),
            format: ContainerFormat::default(),
            fps: default_fps(),
        }
    }
}

/// Normalize stage settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NormalizeConfig {
    /// Aspect ratio policy (default: letterbox)
    #[serde(default)]
    pub scale_policy: ScalePolicy,

    /// Try the GPU encoder when the capability provider reports one (default: true)
    #[serde(default = "default_true")]
    pub prefer_gpu: bool,

    /// Audio bitrate passed to the AAC encoder (default: "192k")
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: String,

    /// Audio sample rate in Hz (default: 44100)
    #[serde(default = "default_audio_sample_rate")]
    pub audio_sample_rate: u32,

    /// Audio channel count (default: 2)
    #[serde(default = "default_audio_channels")]
    pub audio_channels: u32,

    /// Per-attempt timeout for the processing worker (default: 600 seconds)
    #[serde(default = "default_processing_timeout", with = "duration_serde")]
    pub timeout: Duration,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            scale_policy: ScalePolicy::default(),
            prefer_gpu: true,
            audio_bitrate: default_audio_bitrate(),
            audio_sample_rate: default_audio_sample_rate(),
            audio_channels: default_audio_channels(),
            timeout: default_processing_timeout(),
        }
    }
}

/// Retry configuration for transient download failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts in total, first attempt included (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt (default: 2 seconds)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between attempts (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Download stage and worker pool settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Jobs allowed in Download+Normalize at once (default: 3)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_jobs: usize,

    /// Retry policy for transient failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Per-attempt timeout for the download worker (None = unbounded)
    #[serde(default, with = "optional_duration_serde")]
    pub attempt_timeout: Option<Duration>,

    /// Netscape cookie file handed to the download worker
    #[serde(default)]
    pub cookies_file: Option<PathBuf>,

    /// Ask the worker for streams no taller than the target resolution (default: true)
    #[serde(default = "default_true")]
    pub cap_height: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent(),
            retry: RetryConfig::default(),
            attempt_timeout: None,
            cookies_file: None,
            cap_height: true,
        }
    }
}

/// Merge stage settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Merge mode (default: fast concat)
    #[serde(default)]
    pub mode: MergeMode,

    /// Crossfade transition length in seconds (default: 0.5)
    #[serde(default = "default_fade_duration")]
    pub fade_duration_secs: f64,

    /// Background music track mixed into the final output
    #[serde(default)]
    pub music_path: Option<PathBuf>,

    /// Background music volume scalar (default: 0.15)
    #[serde(default = "default_music_volume")]
    pub music_volume: f32,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            mode: MergeMode::default(),
            fade_duration_secs: default_fade_duration(),
            music_path: None,
            music_volume: default_music_volume(),
        }
    }
}

/// External tool paths (ffmpeg, ffprobe, yt-dlp, nvidia-smi)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Path to ffmpeg (auto-detected if None)
    #[serde(default)]
    pub ffmpeg_path: Option<PathBuf>,

    /// Path to ffprobe (auto-detected if None)
    #[serde(default)]
    pub ffprobe_path: Option<PathBuf>,

    /// Path to yt-dlp (auto-detected if None)
    #[serde(default)]
    pub ytdlp_path: Option<PathBuf>,

    /// Path to nvidia-smi (auto-detected if None)
    #[serde(default)]
    pub nvidia_smi_path: Option<PathBuf>,

    /// Whether to search PATH for external binaries if explicit paths not set (default: true)
    #[serde(default = "default_true")]
    pub search_path: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            ffprobe_path: None,
            ytdlp_path: None,
            nvidia_smi_path: None,
            search_path: true,
        }
    }
}

/// Cache Store location
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Root of the index file and artifact directory
    /// (default: per-user application data directory)
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
        }
    }
}

impl CacheConfig {
    /// Path of the persisted index
    pub fn index_path(&self) -> PathBuf {
        self.cache_dir.join("index.db")
    }

    /// Directory holding content-addressed artifacts
    pub fn artifact_dir(&self) -> PathBuf {
        self.cache_dir.join("artifacts")
    }
}

/// Main configuration for a [`crate::Pipeline`]
///
/// Fields are organized into logical sub-configs:
/// - [`output`](OutputConfig): resolution, container, frame rate
/// - [`normalize`](NormalizeConfig): aspect policy, encoder preference, audio format
/// - [`download`](DownloadConfig): concurrency, retry policy, worker timeout
/// - [`merge`](MergeConfig): merge mode, crossfade, background music
/// - [`tools`](ToolsConfig): external binary paths
/// - [`cache`](CacheConfig): cache location
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Output format settings
    #[serde(default)]
    pub output: OutputConfig,

    /// Normalize stage settings
    #[serde(default)]
    pub normalize: NormalizeConfig,

    /// Download stage settings
    #[serde(default)]
    pub download: DownloadConfig,

    /// Merge stage settings
    #[serde(default)]
    pub merge: MergeConfig,

    /// External tool paths
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Cache location
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Config {
    /// Reject settings a run cannot recover from
    pub fn validate(&self) -> Result<()> {
        if self.download.max_concurrent_jobs == 0 {
            return Err(Error::config(
                "at least one concurrent job is required",
                "download.max_concurrent_jobs",
            ));
        }
        if self.download.retry.max_attempts == 0 {
            return Err(Error::config(
                "at least one download attempt is required",
                "download.retry.max_attempts",
            ));
        }
        let multiplier = self.download.retry.backoff_multiplier;
        if !(multiplier.is_finite() && multiplier > 1.0) {
            return Err(Error::config(
                "backoff multiplier must be greater than 1.0 so delays grow",
                "download.retry.backoff_multiplier",
            ));
        }
        if self.output.fps == 0 {
            return Err(Error::config("frame rate must be positive", "output.fps"));
        }
        if self.normalize.audio_sample_rate == 0 || self.normalize.audio_channels == 0 {
            return Err(Error::config(
                "audio sample rate and channel count must be positive",
                "normalize.audio_sample_rate",
            ));
        }
        if self.merge.mode == MergeMode::Crossfade
            && !(self.merge.fade_duration_secs.is_finite() && self.merge.fade_duration_secs > 0.0)
        {
            return Err(Error::config(
                format!(
                    "crossfade duration must be positive, got {}",
                    self.merge.fade_duration_secs
                ),
                "merge.fade_duration_secs",
            ));
        }
        if let Some(music) = &self.merge.music_path {
            if !music.is_file() {
                return Err(Error::config(
                    format!("background music file not found: {}", music.display()),
                    "merge.music_path",
                ));
            }
            if !(0.0..=1.0).contains(&self.merge.music_volume) {
                return Err(Error::config(
                    format!(
                        "music volume must be between 0.0 and 1.0, got {}",
                        self.merge.music_volume
                    ),
                    "merge.music_volume",
                ));
            }
        }
        Ok(())
    }

    /// Load settings from a JSON file; missing fields take their defaults
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await?;
        let config: Config = serde_json::from_str(&raw)?;
        tracing::debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Persist settings as pretty-printed JSON, creating parent directories
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json).await?;
        tracing::debug!(path = %path.display(), "saved configuration");
        Ok(())
    }
}

fn default_fps() -> u32 {
    30
}

fn default_true() -> bool {
    true
}

fn default_audio_bitrate() -> String {
    "192k".to_string()
}

fn default_audio_sample_rate() -> u32 {
    44_100
}

fn default_audio_channels() -> u32 {
    2
}

fn default_processing_timeout() -> Duration {
    Duration::from_secs(600) // 10 minutes
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_concurrent() -> usize {
    3
}

fn default_fade_duration() -> f64 {
    0.5
}

fn default_music_volume() -> f32 {
    0.15
}

fn default_cache_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "yt-merge")
        .map(|dirs| dirs.data_local_dir().join("cache"))
        .unwrap_or_else(|| PathBuf::from("./cache"))
}

// Duration serialization helper
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Optional Duration serialization helper
mod optional_duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}
