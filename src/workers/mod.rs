//! External workers
//!
//! The pipeline never shells out directly: every external tool sits behind a
//! trait defined in [`traits`], so the stages can be driven by in-process
//! fakes in tests.
//!
//! - [`MediaDownloader`]: fetches a source to a local file ([`YtDlp`])
//! - [`MediaProcessor`]: probe, normalize, concat, crossfade, music overlay ([`Ffmpeg`])
//! - [`EncoderProvider`]: reports whether a hardware encoder is usable
//!   ([`NvidiaSmiProbe`], [`FixedEncoder`])
//!
//! ## Usage
//!
//! ```no_run
//! use yt_merge::Config;
//! use yt_merge::workers::Workers;
//!
//! # fn main() -> yt_merge::Result<()> {
//! // Resolves yt-dlp, ffmpeg, ffprobe and nvidia-smi from the config or PATH
//! let workers = Workers::discover(&Config::default())?;
//! println!("downloader: {}", workers.downloader.name());
//! # Ok(())
//! # }
//! ```

mod encoder;
mod ffmpeg;
pub(crate) mod process;
pub mod progress;
mod traits;
mod ytdlp;

pub use encoder::{FixedEncoder, NvidiaSmiProbe};
pub use ffmpeg::{
    Ffmpeg, FfmpegCommand, concat_command, crossfade_command, crossfade_filter, normalize_command,
    overlay_command, scale_filter,
};
pub use progress::TransferProgress;
pub use traits::{
    AudioStreamInfo, CrossfadeClip, CrossfadeRequest, DownloadRequest, DownloadedMedia,
    EncoderProfile, EncoderProvider, MediaDownloader, MediaInfo, MediaProcessor, NormalizeRequest,
    OverlayRequest, ProgressFn, VideoStreamInfo,
};
pub use ytdlp::{YtDlp, classify_failure, format_selector};

use crate::config::{Config, ToolsConfig};
use crate::error::{Error, Result};
use std::path::PathBuf;
use std::sync::Arc;

/// The three collaborators a pipeline drives
#[derive(Clone)]
pub struct Workers {
    /// Download worker
    pub downloader: Arc<dyn MediaDownloader>,
    /// Media processing worker
    pub processor: Arc<dyn MediaProcessor>,
    /// Encoder capability provider
    pub encoder: Arc<dyn EncoderProvider>,
}

impl std::fmt::Debug for Workers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workers")
            .field("downloader", &self.downloader.name())
            .field("processor", &self.processor.name())
            .field("encoder", &self.encoder.name())
            .finish()
    }
}

impl Workers {
    /// Assemble workers from explicit implementations
    pub fn new(
        downloader: Arc<dyn MediaDownloader>,
        processor: Arc<dyn MediaProcessor>,
        encoder: Arc<dyn EncoderProvider>,
    ) -> Self {
        Self {
            downloader,
            processor,
            encoder,
        }
    }

    /// Resolve the CLI workers from configured paths, falling back to PATH
    ///
    /// # Errors
    ///
    /// [`Error::Config`] naming the setting when yt-dlp, ffmpeg or ffprobe
    /// cannot be found. A missing `nvidia-smi` only disables GPU encoding.
    pub fn discover(config: &Config) -> Result<Self> {
        let tools = &config.tools;
        let ytdlp = resolve(tools, tools.ytdlp_path.as_ref(), "yt-dlp", "tools.ytdlp_path")?;
        let ffmpeg = resolve(tools, tools.ffmpeg_path.as_ref(), "ffmpeg", "tools.ffmpeg_path")?;
        let ffprobe = resolve(
            tools,
            tools.ffprobe_path.as_ref(),
            "ffprobe",
            "tools.ffprobe_path",
        )?;

        let encoder: Arc<dyn EncoderProvider> = if !config.normalize.prefer_gpu {
            Arc::new(FixedEncoder::cpu())
        } else if let Some(path) = &tools.nvidia_smi_path {
            Arc::new(NvidiaSmiProbe::new(path.clone()))
        } else if tools.search_path {
            Arc::new(NvidiaSmiProbe::from_path())
        } else {
            Arc::new(FixedEncoder::cpu())
        };

        tracing::info!(
            ytdlp = %ytdlp.display(),
            ffmpeg = %ffmpeg.display(),
            ffprobe = %ffprobe.display(),
            encoder_provider = encoder.name(),
            "external workers resolved"
        );

        Ok(Self {
            downloader: Arc::new(YtDlp::new(ytdlp)),
            processor: Arc::new(Ffmpeg::new(ffmpeg, ffprobe)),
            encoder,
        })
    }
}

fn resolve(
    tools: &ToolsConfig,
    configured: Option<&PathBuf>,
    binary: &str,
    key: &str,
) -> Result<PathBuf> {
    if let Some(path) = configured {
        if !path.is_file() {
            return Err(Error::config(
                format!("{} not found at {}", binary, path.display()),
                key,
            ));
        }
        return Ok(path.clone());
    }
    if tools.search_path
        && let Ok(path) = which::which(binary)
    {
        return Ok(path);
    }
    Err(Error::config(
        format!("{} not found; install it or set its path", binary),
        key,
    ))
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_configured_binary_names_the_setting() {
        let mut config = Config::default();
        config.tools.ytdlp_path = Some(PathBuf::from("/nonexistent/yt-dlp-xyz"));

        let err = Workers::discover(&config).unwrap_err();
        match err {
            Error::Config { key, message } => {
                assert_eq!(key.as_deref(), Some("tools.ytdlp_path"));
                assert!(message.contains("yt-dlp"));
            }
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn path_search_disabled_without_paths_fails() {
        let mut config = Config::default();
        config.tools.search_path = false;
        assert!(matches!(
            Workers::discover(&config),
            Err(Error::Config { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn explicit_paths_are_used_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let touch = |name: &str| {
            let p = dir.path().join(name);
            std::fs::write(&p, b"").unwrap();
            p
        };
        let mut config = Config::default();
        config.tools.ytdlp_path = Some(touch("yt-dlp"));
        config.tools.ffmpeg_path = Some(touch("ffmpeg"));
        config.tools.ffprobe_path = Some(touch("ffprobe"));
        config.normalize.prefer_gpu = false;

        let workers = Workers::discover(&config).unwrap();
        assert_eq!(workers.downloader.name(), "yt-dlp");
        assert_eq!(workers.processor.name(), "ffmpeg");
        assert_eq!(workers.encoder.name(), "fixed");
    }
}
