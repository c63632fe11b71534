//! Download worker backed by the external `yt-dlp` binary

use super::process::{RunError, StreamKind, run_monitored};
use super::progress::{
    YTDLP_OUTPUT_PREFIX, parse_ytdlp_meta, parse_ytdlp_progress, ytdlp_meta_template,
    ytdlp_progress_template,
};
use super::traits::{DownloadRequest, DownloadedMedia, MediaDownloader, ProgressFn};
use crate::error::DownloadError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Extensions yt-dlp may leave behind when the merge container cannot be honored
const CANDIDATE_EXTENSIONS: &[&str] = &["mp4", "mkv", "webm", "m4a"];

/// Parallel fragment downloads for DASH/HLS sources
const CONCURRENT_FRAGMENTS: u32 = 8;

/// stderr fragments identifying failures that retrying cannot fix
const PERMANENT_MARKERS: &[&str] = &[
    "video unavailable",
    "private video",
    "not available in your country",
    "sign in to confirm your age",
    "members-only",
    "join this channel",
    "has been removed",
    "account associated with this video has been terminated",
    "unsupported url",
    "is not a valid url",
    "http error 404",
    "http error 410",
];

/// yt-dlp CLI wrapper
///
/// # Examples
///
/// ```no_run
/// use yt_merge::workers::{DownloadRequest, MediaDownloader, YtDlp};
/// use std::path::PathBuf;
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let ytdlp = YtDlp::from_path().expect("yt-dlp not found in PATH");
/// let request = DownloadRequest {
///     url: "https://youtu.be/dQw4w9WgXcQ".to_string(),
///     output_stem: PathBuf::from("/tmp/clip"),
///     height_cap: Some(1080),
///     cookies_file: None,
///     timeout: None,
/// };
/// let media = ytdlp
///     .download(&request, &|_| {}, &CancellationToken::new())
///     .await?;
/// println!("saved to {}", media.path.display());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct YtDlp {
    binary_path: PathBuf,
}

impl YtDlp {
    /// Wrap an explicit `yt-dlp` binary
    pub fn new(binary_path: PathBuf) -> Self {
        Self { binary_path }
    }

    /// Find `yt-dlp` in PATH
    pub fn from_path() -> Option<Self> {
        which::which("yt-dlp").ok().map(Self::new)
    }

    /// Binary this wrapper invokes
    pub fn binary_path(&self) -> &Path {
        &self.binary_path
    }

    fn build_args(request: &DownloadRequest) -> Vec<String> {
        let output_template = format!("{}.%(ext)s", request.output_stem.display());
        let mut args = vec![
            "--no-playlist".to_string(),
            "--newline".to_string(),
            "--no-colors".to_string(),
            "--no-part".to_string(),
            "--force-overwrites".to_string(),
            "--progress".to_string(),
            "--progress-template".to_string(),
            ytdlp_progress_template(),
            "--print".to_string(),
            format!("after_move:{}%(filepath)s", YTDLP_OUTPUT_PREFIX),
            "--print".to_string(),
            ytdlp_meta_template(),
            "-f".to_string(),
            format_selector(request.height_cap),
            "--merge-output-format".to_string(),
            "mp4".to_string(),
            "--concurrent-fragments".to_string(),
            CONCURRENT_FRAGMENTS.to_string(),
            "-o".to_string(),
            output_template,
        ];
        if let Some(cookies) = &request.cookies_file {
            args.push("--cookies".to_string());
            args.push(cookies.display().to_string());
        }
        args.push("--".to_string());
        args.push(request.url.clone());
        args
    }
}

/// yt-dlp format selector preferring mp4/m4a streams no taller than `height_cap`
pub fn format_selector(height_cap: Option<u32>) -> String {
    match height_cap {
        Some(h) => format!(
            "bestvideo[height<={h}][ext=mp4]+bestaudio[ext=m4a]/bestvideo[height<={h}]+bestaudio/best[height<={h}]/best"
        ),
        None => "bestvideo[ext=mp4]+bestaudio[ext=m4a]/bestvideo+bestaudio/best".to_string(),
    }
}

/// Classify a failed yt-dlp invocation from its stderr
pub fn classify_failure(stderr: &str, exit_code: Option<i32>) -> DownloadError {
    let message = last_error_line(stderr)
        .unwrap_or_else(|| format!("yt-dlp exited with code {:?}", exit_code));
    let haystack = stderr.to_ascii_lowercase();
    if PERMANENT_MARKERS.iter().any(|m| haystack.contains(m)) {
        DownloadError::Permanent { message }
    } else {
        DownloadError::Transient { message }
    }
}

fn last_error_line(stderr: &str) -> Option<String> {
    stderr
        .lines()
        .rev()
        .find(|l| l.starts_with("ERROR:"))
        .or_else(|| stderr.lines().rev().find(|l| !l.trim().is_empty()))
        .map(|l| l.trim().to_string())
}

async fn locate_output(stem: &Path, reported: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = reported
        && crate::utils::nonempty_file_size(&path).await.is_some()
    {
        return Some(path);
    }
    for ext in CANDIDATE_EXTENSIONS {
        let candidate = PathBuf::from(format!("{}.{}", stem.display(), ext));
        if crate::utils::nonempty_file_size(&candidate).await.is_some() {
            return Some(candidate);
        }
    }
    None
}

fn watch_url(entry: &str) -> String {
    if entry.starts_with("http://") || entry.starts_with("https://") {
        entry.to_string()
    } else {
        format!("https://www.youtube.com/watch?v={}", entry)
    }
}

#[async_trait]
impl MediaDownloader for YtDlp {
    async fn download(
        &self,
        request: &DownloadRequest,
        progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<DownloadedMedia, DownloadError> {
        let mut command = Command::new(&self.binary_path);
        command.args(Self::build_args(request));

        tracing::debug!(url = %request.url, stem = %request.output_stem.display(), "starting yt-dlp");

        let mut reported_path = None;
        let mut meta = None;
        let finished = run_monitored(command, request.timeout, cancel, |kind, line| {
            if kind != StreamKind::Stdout {
                return;
            }
            if let Some(p) = parse_ytdlp_progress(line) {
                progress(p);
            } else if let Some(path) = line.trim().strip_prefix(YTDLP_OUTPUT_PREFIX) {
                reported_path = Some(PathBuf::from(path));
            } else if let Some(m) = parse_ytdlp_meta(line) {
                meta = Some(m);
            }
        })
        .await
        .map_err(|e| match e {
            RunError::Timeout(secs) => DownloadError::Timeout(secs),
            RunError::Cancelled => DownloadError::Cancelled,
            // A missing binary does not come back by retrying
            RunError::Spawn(e) => DownloadError::Permanent {
                message: format!("failed to execute yt-dlp: {}", e),
            },
            RunError::Wait(e) => DownloadError::Transient {
                message: format!("failed to wait for yt-dlp: {}", e),
            },
        })?;

        if !finished.success() {
            return Err(classify_failure(&finished.stderr_tail, finished.code()));
        }

        let path = locate_output(&request.output_stem, reported_path)
            .await
            .ok_or_else(|| DownloadError::MissingOutput {
                path: PathBuf::from(format!("{}.mp4", request.output_stem.display())),
            })?;
        let meta = meta.unwrap_or_default();

        Ok(DownloadedMedia {
            path,
            title: meta.title,
            duration_secs: meta.duration_secs,
        })
    }

    async fn expand_playlist(&self, url: &str) -> crate::Result<Vec<String>> {
        let output = Command::new(&self.binary_path)
            .args(["--flat-playlist", "--print", "url", "--no-warnings", "--", url])
            .output()
            .await
            .map_err(|e| crate::Error::ExternalTool(format!("Failed to execute yt-dlp: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(crate::Error::ExternalTool(format!(
                "yt-dlp could not expand playlist {}: {}",
                url,
                last_error_line(&stderr).unwrap_or_default()
            )));
        }

        let urls: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && *l != "NA")
            .map(watch_url)
            .collect();

        tracing::info!(playlist = %url, entries = urls.len(), "expanded playlist");
        Ok(urls)
    }

    fn name(&self) -> &'static str {
        "yt-dlp"
    }
}
