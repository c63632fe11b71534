//! Content-addressed cache keys
//!
//! A fingerprint is the SHA-256 of every parameter that changes the bytes a
//! stage produces. Fields are hashed as tagged `key=value` lines so that
//! adjacent values can never run together into the same digest input.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{ContainerFormat, Resolution, ScalePolicy};
use crate::types::{EncoderClass, TrimRange};

/// Deterministic cache key (lowercase hex SHA-256)
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Key of the raw download of `source_id`
    ///
    /// `height_cap` is the worker's format-selector limit; a capped and an
    /// uncapped download of the same source are different artifacts.
    pub fn raw(source_id: &str, trim: &TrimRange, height_cap: Option<u32>) -> Self {
        let mut builder = Builder::new("raw");
        builder
            .field("source", source_id)
            .field("trim", &trim.canonical())
            .field(
                "height_cap",
                &height_cap.map_or_else(|| "none".to_string(), |h| h.to_string()),
            );
        builder.finish()
    }

    /// Key of the normalized artifact for `source_id` under `target`
    pub fn normalized(
        source_id: &str,
        trim: &TrimRange,
        target: &NormalizeTarget,
        encoder: EncoderClass,
    ) -> Self {
        let mut builder = Builder::new("normalized");
        builder
            .field("source", source_id)
            .field("trim", &trim.canonical())
            .field("width", &target.resolution.width().to_string())
            .field("height", &target.resolution.height().to_string())
            .field("format", target.format.extension())
            .field("fps", &target.fps.to_string())
            .field(
                "scale",
                match target.scale_policy {
                    ScalePolicy::Letterbox => "letterbox",
                    ScalePolicy::Crop => "crop",
                },
            )
            .field("audio_bitrate", &target.audio_bitrate)
            .field("audio_rate", &target.audio_sample_rate.to_string())
            .field("audio_channels", &target.audio_channels.to_string())
            .field("encoder", encoder.as_str());
        builder.finish()
    }

    /// Wrap a stored hex digest
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// Hex digest
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parameters of the canonical intermediate format
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NormalizeTarget {
    /// Frame size
    pub resolution: Resolution,
    /// Container
    pub format: ContainerFormat,
    /// Frame rate
    pub fps: u32,
    /// Aspect ratio policy
    pub scale_policy: ScalePolicy,
    /// AAC bitrate
    pub audio_bitrate: String,
    /// Audio sample rate in Hz
    pub audio_sample_rate: u32,
    /// Audio channel count
    pub audio_channels: u32,
}

impl NormalizeTarget {
    /// Target derived from the run configuration
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            resolution: config.output.resolution,
            format: config.output.format,
            fps: config.output.fps,
            scale_policy: config.normalize.scale_policy,
            audio_bitrate: config.normalize.audio_bitrate.clone(),
            audio_sample_rate: config.normalize.audio_sample_rate,
            audio_channels: config.normalize.audio_channels,
        }
    }
}

struct Builder {
    hasher: Sha256,
}

impl Builder {
    fn new(kind: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"v1\n");
        hasher.update(kind.as_bytes());
        hasher.update(b"\n");
        Self { hasher }
    }

    fn field(&mut self, key: &str, value: &str) -> &mut Self {
        self.hasher.update(key.as_bytes());
        self.hasher.update(b"=");
        self.hasher.update(value.as_bytes());
        self.hasher.update(b"\n");
        self
    }

    fn finish(self) -> Fingerprint {
        Fingerprint(format!("{:x}", self.hasher.finalize()))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn target() -> NormalizeTarget {
        NormalizeTarget::from_config(&Config::default())
    }

    #[test]
    fn fingerprints_are_deterministic_hex() {
        let trim = TrimRange::new(Some(30.0), Some(105.0));
        let a = Fingerprint::raw("dQw4w9WgXcQ", &trim, Some(1080));
        let b = Fingerprint::raw("dQw4w9WgXcQ", &trim, Some(1080));
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn raw_fingerprint_depends_on_trim_and_cap() {
        let full = TrimRange::full();
        let trimmed = TrimRange::new(Some(30.0), Some(105.0));
        let base = Fingerprint::raw("abc", &full, Some(1080));
        assert_ne!(base, Fingerprint::raw("abc", &trimmed, Some(1080)));
        assert_ne!(base, Fingerprint::raw("abc", &full, Some(720)));
        assert_ne!(base, Fingerprint::raw("abc", &full, None));
    }

    #[test]
    fn normalized_fingerprint_includes_encoder_class() {
        let trim = TrimRange::full();
        let gpu = Fingerprint::normalized("abc", &trim, &target(), EncoderClass::Gpu);
        let cpu = Fingerprint::normalized("abc", &trim, &target(), EncoderClass::Cpu);
        assert_ne!(gpu, cpu);
    }

    #[test]
    fn normalized_fingerprint_depends_on_target() {
        let trim = TrimRange::full();
        let base = Fingerprint::normalized("abc", &trim, &target(), EncoderClass::Cpu);

        let mut other = target();
        other.resolution = Resolution::P720;
        assert_ne!(
            base,
            Fingerprint::normalized("abc", &trim, &other, EncoderClass::Cpu)
        );

        let mut other = target();
        other.format = ContainerFormat::Mkv;
        assert_ne!(
            base,
            Fingerprint::normalized("abc", &trim, &other, EncoderClass::Cpu)
        );
    }

    #[test]
    fn raw_and_normalized_never_collide() {
        let trim = TrimRange::full();
        assert_ne!(
            Fingerprint::raw("abc", &trim, None).as_str(),
            Fingerprint::normalized("abc", &trim, &target(), EncoderClass::Cpu).as_str()
        );
    }
}
