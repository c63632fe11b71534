//! Utility functions for file operations and path manipulation

use crate::error::Result;
use std::path::{Path, PathBuf};

/// Size of `path` if it is a regular, non-empty file
///
/// Returns `None` for missing files, directories and zero-byte files.
pub async fn nonempty_file_size(path: &Path) -> Option<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Some(meta.len()),
        _ => None,
    }
}

/// Move a file, falling back to copy + delete across filesystems
///
/// The destination is written under a `.part` name first and renamed into
/// place, so `dest` is never observed half-written.
pub async fn move_file(src: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    if tokio::fs::rename(src, dest).await.is_ok() {
        return Ok(());
    }

    let staging = part_path(dest);
    tokio::fs::copy(src, &staging).await?;
    if let Err(e) = tokio::fs::rename(&staging, dest).await {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(e.into());
    }
    tokio::fs::remove_file(src).await?;
    Ok(())
}

/// Sibling of `path` with `.part` inserted before the extension
///
/// # Examples
///
/// ```
/// use std::path::{Path, PathBuf};
/// use yt_merge::utils::part_path;
///
/// assert_eq!(part_path(Path::new("/c/abc.mp4")), PathBuf::from("/c/abc.part.mp4"));
/// assert_eq!(part_path(Path::new("/c/abc")), PathBuf::from("/c/abc.part"));
/// ```
#[must_use]
pub fn part_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{}.part.{}", stem, ext.to_string_lossy()),
        None => format!("{}.part", stem),
    };
    path.with_file_name(name)
}

/// Quote a path for an ffmpeg concat-demuxer `file` directive
///
/// Backslashes become forward slashes and single quotes are escaped the way
/// the demuxer expects (`'\''`).
#[must_use]
pub fn concat_file_directive(path: &Path) -> String {
    let normalized = path.to_string_lossy().replace('\\', "/");
    format!("file '{}'", normalized.replace('\'', "'\\''"))
}

/// Format seconds as `HH:MM:SS.mmm`
///
/// # Examples
///
/// ```
/// use yt_merge::utils::seconds_to_timestamp;
///
/// assert_eq!(seconds_to_timestamp(105.5), "00:01:45.500");
/// assert_eq!(seconds_to_timestamp(-3.0), "00:00:00.000");
/// ```
#[must_use]
pub fn seconds_to_timestamp(secs: f64) -> String {
    if secs.is_nan() || secs <= 0.0 {
        return "00:00:00.000".to_string();
    }
    let total_ms = (secs * 1000.0).round() as u64;
    let h = total_ms / 3_600_000;
    let m = (total_ms % 3_600_000) / 60_000;
    let s = (total_ms % 60_000) / 1000;
    let ms = total_ms % 1000;
    format!("{:02}:{:02}:{:02}.{:03}", h, m, s, ms)
}
