//! Progress line parsers for the external workers

use serde::{Deserialize, Serialize};

/// Progress of a worker invocation
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferProgress {
    /// Percent complete (0.0 to 100.0); `None` when indeterminate
    pub percent: Option<f32>,
    /// Throughput in bytes per second, if the worker reports it
    pub speed_bps: Option<u64>,
}

/// Prefix of the progress lines requested from yt-dlp via `--progress-template`
pub const YTDLP_PROGRESS_PREFIX: &str = "YTM_PROGRESS|";

/// Prefix of the final file path line requested via `--print after_move:`
pub const YTDLP_OUTPUT_PREFIX: &str = "YTM_OUTPUT|";

/// Prefix of the metadata line requested via `--print after_move:`
pub const YTDLP_META_PREFIX: &str = "YTM_META|";

/// `--progress-template` value matching [`parse_ytdlp_progress`]
pub fn ytdlp_progress_template() -> String {
    format!(
        "download:{}%(progress.downloaded_bytes)s|%(progress.total_bytes)s|%(progress.total_bytes_estimate)s|%(progress.speed)s",
        YTDLP_PROGRESS_PREFIX
    )
}

/// Parse a `YTM_PROGRESS|downloaded|total|estimate|speed` line
///
/// yt-dlp prints `NA` for unknown fields; the percent is indeterminate when
/// neither total is known.
pub fn parse_ytdlp_progress(line: &str) -> Option<TransferProgress> {
    let rest = line.trim().strip_prefix(YTDLP_PROGRESS_PREFIX)?;
    let fields: Vec<&str> = rest.split('|').collect();
    if fields.len() < 4 {
        return None;
    }
    let downloaded = parse_number(fields[0]);
    let total = parse_number(fields[1])
        .or_else(|| parse_number(fields[2]))
        .filter(|t| *t > 0.0);
    let speed = parse_number(fields[3]);

    let percent = match (downloaded, total) {
        (Some(done), Some(total)) => Some(((done / total) * 100.0).clamp(0.0, 100.0) as f32),
        _ => None,
    };

    Some(TransferProgress {
        percent,
        speed_bps: speed.filter(|s| *s >= 0.0).map(|s| s as u64),
    })
}

/// Metadata reported by yt-dlp after the file was moved into place
#[derive(Debug, Clone, Default, PartialEq)]
pub struct YtDlpMeta {
    /// Duration in seconds
    pub duration_secs: Option<f64>,
    /// Video title
    pub title: Option<String>,
}

/// `--print` template matching [`parse_ytdlp_meta`]; the title goes last since it may contain `|`
pub fn ytdlp_meta_template() -> String {
    format!("after_move:{}%(duration)s|%(title)s", YTDLP_META_PREFIX)
}

/// Parse a `YTM_META|duration|title` line
pub fn parse_ytdlp_meta(line: &str) -> Option<YtDlpMeta> {
    let rest = line.trim().strip_prefix(YTDLP_META_PREFIX)?;
    let (duration, title) = rest.split_once('|').unwrap_or((rest, ""));
    let title = title.trim();
    Some(YtDlpMeta {
        duration_secs: parse_number(duration),
        title: (!title.is_empty() && title != "NA").then(|| title.to_string()),
    })
}

fn parse_number(field: &str) -> Option<f64> {
    let field = field.trim();
    if field.is_empty() || field.eq_ignore_ascii_case("na") || field == "None" {
        return None;
    }
    field.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Progress information from ffmpeg's `-progress` output
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FfmpegProgress {
    /// Output time in milliseconds
    pub out_time_ms: i64,
    /// Encoding speed (1.5 = 1.5x realtime)
    pub speed: f64,
    /// Output size so far
    pub total_size: u64,
    /// Whether encoding is complete
    pub is_complete: bool,
}

impl FfmpegProgress {
    /// Percent of `total_secs` encoded so far
    pub fn percent_of(&self, total_secs: Option<f64>) -> Option<f32> {
        if self.is_complete {
            return Some(100.0);
        }
        let total_ms = total_secs.filter(|t| *t > 0.0)? * 1000.0;
        Some(((self.out_time_ms as f64 / total_ms) * 100.0).clamp(0.0, 100.0) as f32)
    }
}

/// Feed one `key=value` line of ffmpeg `-progress` output into `current`
///
/// Returns a snapshot at each `progress=` line, which terminates a block.
pub fn parse_ffmpeg_progress_line(line: &str, current: &mut FfmpegProgress) -> Option<FfmpegProgress> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        "out_time_us" | "out_time_ms" => {
            // ffmpeg reports microseconds under both keys
            if let Ok(us) = value.parse::<i64>() {
                current.out_time_ms = us / 1000;
            }
        }
        "total_size" => {
            if let Ok(size) = value.parse() {
                current.total_size = size;
            }
        }
        "speed" => {
            if let Some(speed) = value.strip_suffix('x').and_then(|s| s.trim().parse().ok()) {
                current.speed = speed;
            }
        }
        "progress" => {
            if value == "end" {
                current.is_complete = true;
            }
            return Some(current.clone());
        }
        _ => {}
    }
    None
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ytdlp_progress_with_known_total() {
        let p = parse_ytdlp_progress("YTM_PROGRESS|5242880|10485760|NA|1048576.5").unwrap();
        assert_eq!(p.percent, Some(50.0));
        assert_eq!(p.speed_bps, Some(1_048_576));
    }

    #[test]
    fn ytdlp_progress_falls_back_to_estimate() {
        let p = parse_ytdlp_progress("YTM_PROGRESS|250|NA|1000|NA").unwrap();
        assert_eq!(p.percent, Some(25.0));
        assert_eq!(p.speed_bps, None);
    }

    #[test]
    fn ytdlp_progress_indeterminate_without_totals() {
        let p = parse_ytdlp_progress("YTM_PROGRESS|250|NA|NA|100").unwrap();
        assert_eq!(p.percent, None);
        assert_eq!(p.speed_bps, Some(100));
    }

    #[test]
    fn unrelated_lines_are_ignored() {
        assert!(parse_ytdlp_progress("[youtube] abc: Downloading webpage").is_none());
        assert!(parse_ytdlp_meta("YTM_OUTPUT|/tmp/x.mp4").is_none());
    }

    #[test]
    fn ytdlp_meta_keeps_pipes_in_title() {
        let meta = parse_ytdlp_meta("YTM_META|212.0|Artist | Song (Live)").unwrap();
        assert_eq!(meta.duration_secs, Some(212.0));
        assert_eq!(meta.title.as_deref(), Some("Artist | Song (Live)"));

        let meta = parse_ytdlp_meta("YTM_META|NA|NA").unwrap();
        assert_eq!(meta, YtDlpMeta::default());
    }

    #[test]
    fn ffmpeg_progress_block() {
        let mut current = FfmpegProgress::default();
        assert!(parse_ffmpeg_progress_line("out_time_us=5000000", &mut current).is_none());
        assert!(parse_ffmpeg_progress_line("speed=1.5x", &mut current).is_none());
        let snapshot = parse_ffmpeg_progress_line("progress=continue", &mut current).unwrap();
        assert_eq!(snapshot.out_time_ms, 5000);
        assert!((snapshot.speed - 1.5).abs() < 0.01);
        assert_eq!(snapshot.percent_of(Some(10.0)), Some(50.0));
        assert_eq!(snapshot.percent_of(None), None);

        let end = parse_ffmpeg_progress_line("progress=end", &mut current).unwrap();
        assert!(end.is_complete);
        assert_eq!(end.percent_of(None), Some(100.0));
    }

    #[test]
    fn ffmpeg_speed_na_is_ignored() {
        let mut current = FfmpegProgress::default();
        parse_ffmpeg_progress_line("speed=N/A", &mut current);
        assert_eq!(current.speed, 0.0);
    }
}
