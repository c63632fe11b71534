//! Batch file parsing and source identification
//!
//! A batch file lists one source per line:
//!
//! ```text
//! # comments and blank lines are ignored
//! https://youtu.be/dQw4w9WgXcQ
//! https://www.youtube.com/watch?v=9bZkp7q19f0  0:30  1:45
//! https://youtu.be/kJQP7kiw5Fk, 1:02:03.5
//! ```
//!
//! Fields are separated by whitespace or commas. Timestamps are `SS`, `MM:SS`
//! or `H:MM:SS`, with optional fractional seconds.

use crate::error::{Error, Result};
use crate::types::{SourceDescriptor, TrimRange};
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

// Literal patterns; compilation cannot fail
#[allow(clippy::expect_used)]
static YOUTUBE_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(https?://)?(www\.|m\.)?(youtube\.com/(watch\?v=|shorts/|embed/)|youtu\.be/)[\w-]+")
        .expect("valid YouTube URL pattern")
});

#[allow(clippy::expect_used)]
static YOUTUBE_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:youtube\.com/(?:watch\?(?:[^#]*&)?v=|shorts/|embed/|live/)|youtu\.be/)([\w-]+)")
        .expect("valid YouTube id pattern")
});

/// Whether `url` looks like a YouTube video URL
pub fn is_youtube_url(url: &str) -> bool {
    YOUTUBE_URL.is_match(url)
}

/// Stable identifier of a source, independent of URL spelling
///
/// The YouTube video id when one can be extracted, otherwise the URL with
/// scheme and host lowercased and the fragment removed.
pub fn normalize_source_id(url: &str) -> String {
    if let Some(id) = YOUTUBE_ID.captures(url).and_then(|c| c.get(1)) {
        return id.as_str().to_string();
    }
    match url::Url::parse(url.trim()) {
        Ok(mut parsed) => {
            parsed.set_fragment(None);
            parsed.to_string()
        }
        Err(_) => url.trim().to_string(),
    }
}

/// Parse a timestamp (`90`, `1:30`, `0:01:30`, `01:30.500`) into seconds
pub fn parse_timestamp(ts: &str) -> Result<f64> {
    let ts = ts.trim();
    let invalid = || Error::InvalidTimestamp(ts.to_string());
    if ts.is_empty() {
        return Err(invalid());
    }

    let parts: Vec<&str> = ts.split(':').collect();
    let (hours, minutes, seconds) = match parts.as_slice() {
        [s] => ("0", "0", *s),
        [m, s] => ("0", *m, *s),
        [h, m, s] => (*h, *m, *s),
        _ => return Err(invalid()),
    };

    let hours: u64 = hours.parse().map_err(|_| invalid())?;
    let minutes: u64 = minutes.parse().map_err(|_| invalid())?;
    let seconds: f64 = seconds.parse().map_err(|_| invalid())?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(invalid());
    }
    if (parts.len() > 1 && seconds >= 60.0) || (parts.len() == 3 && minutes >= 60) {
        return Err(invalid());
    }

    let whole = hours
        .checked_mul(3600)
        .and_then(|h| minutes.checked_mul(60).and_then(|m| h.checked_add(m)))
        .ok_or_else(invalid)?;
    Ok(whole as f64 + seconds)
}

/// Parse one batch line; `None` for blank and comment lines
pub fn parse_batch_line(line: &str) -> Result<Option<SourceDescriptor>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let fields: Vec<&str> = line
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|f| !f.is_empty())
        .collect();

    let (url, start, end) = match fields.as_slice() {
        [url] => (*url, None, None),
        [url, start] => (*url, Some(*start), None),
        [url, start, end] => (*url, Some(*start), Some(*end)),
        _ => {
            return Err(Error::Other(format!(
                "expected URL [START [END]], found {} fields",
                fields.len()
            )));
        }
    };

    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(Error::Other(format!("not a URL: {}", url)));
    }

    let trim = TrimRange::new(
        start.map(parse_timestamp).transpose()?,
        end.map(parse_timestamp).transpose()?,
    );
    trim.validate()?;

    Ok(Some(SourceDescriptor {
        url: url.to_string(),
        trim,
    }))
}

/// Parse a whole batch; errors name the offending 1-based line
pub fn parse_batch(text: &str) -> Result<Vec<SourceDescriptor>> {
    let mut sources = Vec::new();
    for (i, line) in text.lines().enumerate() {
        match parse_batch_line(line) {
            Ok(Some(source)) => {
                if !is_youtube_url(&source.url) {
                    tracing::debug!(line = i + 1, url = %source.url, "non-YouTube source, passing through to the download worker");
                }
                sources.push(source);
            }
            Ok(None) => {}
            Err(e) => {
                return Err(Error::InvalidBatchLine {
                    line: i + 1,
                    reason: match e {
                        Error::Other(reason) => reason,
                        other => other.to_string(),
                    },
                });
            }
        }
    }
    Ok(sources)
}

/// Read and parse a batch file
pub async fn read_batch_file(path: impl AsRef<Path>) -> Result<Vec<SourceDescriptor>> {
    let path = path.as_ref();
    let text = tokio::fs::read_to_string(path).await?;
    let sources = parse_batch(&text)?;
    tracing::info!(path = %path.display(), sources = sources.len(), "loaded batch file");
    Ok(sources)
}
