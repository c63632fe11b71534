//! Encoder capability providers
//!
//! [`NvidiaSmiProbe`] reports NVENC when `nvidia-smi` lists at least one GPU;
//! [`FixedEncoder`] always answers with the same profile.

use super::process::{StreamKind, run_monitored};
use super::traits::{EncoderProfile, EncoderProvider};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// How long `nvidia-smi` may take before the GPU is considered unavailable
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// GPU detection through the external `nvidia-smi` binary
#[derive(Debug, Clone)]
pub struct NvidiaSmiProbe {
    binary_path: Option<PathBuf>,
}

impl NvidiaSmiProbe {
    /// Probe using an explicit `nvidia-smi` path
    pub fn new(binary_path: PathBuf) -> Self {
        Self {
            binary_path: Some(binary_path),
        }
    }

    /// Probe using `nvidia-smi` from PATH; reports CPU when it is absent
    pub fn from_path() -> Self {
        Self {
            binary_path: which::which("nvidia-smi").ok(),
        }
    }

    async fn gpu_names(&self, binary: &Path) -> Option<Vec<String>> {
        let mut command = Command::new(binary);
        command.args(["--query-gpu=name", "--format=csv,noheader"]);

        let mut names = Vec::new();
        let finished = run_monitored(
            command,
            Some(PROBE_TIMEOUT),
            &CancellationToken::new(),
            |kind, line| {
                if kind == StreamKind::Stdout && !line.trim().is_empty() {
                    names.push(line.trim().to_string());
                }
            },
        )
        .await
        .map_err(|e| tracing::debug!(error = %e, "nvidia-smi did not run"))
        .ok()?;

        finished.success().then_some(names)
    }
}

#[async_trait]
impl EncoderProvider for NvidiaSmiProbe {
    async fn detect_encoder(&self) -> EncoderProfile {
        let Some(binary) = &self.binary_path else {
            tracing::info!("nvidia-smi not found, using CPU encoder");
            return EncoderProfile::cpu();
        };

        match self.gpu_names(binary).await {
            Some(names) if !names.is_empty() => {
                tracing::info!(gpu = %names.join(", "), "NVIDIA GPU detected, using NVENC");
                EncoderProfile::nvenc()
            }
            _ => {
                tracing::info!("no usable NVIDIA GPU, using CPU encoder");
                EncoderProfile::cpu()
            }
        }
    }

    fn name(&self) -> &'static str {
        "nvidia-smi"
    }
}

/// Provider that always returns the same profile
///
/// Used when GPU encoding is disabled in the configuration.
#[derive(Debug, Clone)]
pub struct FixedEncoder(pub EncoderProfile);

impl FixedEncoder {
    /// Always answer with the software encoder
    pub fn cpu() -> Self {
        Self(EncoderProfile::cpu())
    }
}

#[async_trait]
impl EncoderProvider for FixedEncoder {
    async fn detect_encoder(&self) -> EncoderProfile {
        self.0.clone()
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EncoderClass;

    #[tokio::test]
    async fn missing_nvidia_smi_reports_cpu() {
        let probe = NvidiaSmiProbe {
            binary_path: None,
        };
        assert_eq!(probe.detect_encoder().await.class, EncoderClass::Cpu);
    }

    #[tokio::test]
    async fn unrunnable_nvidia_smi_reports_cpu() {
        let probe = NvidiaSmiProbe::new(PathBuf::from("/nonexistent/nvidia-smi-xyz"));
        assert_eq!(probe.detect_encoder().await, EncoderProfile::cpu());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn listed_gpu_reports_nvenc() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("nvidia-smi");
        std::fs::write(&fake, "#!/bin/sh\necho 'NVIDIA GeForce RTX 3080'\n").unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let probe = NvidiaSmiProbe::new(fake);
        assert_eq!(probe.detect_encoder().await, EncoderProfile::nvenc());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_nvidia_smi_reports_cpu() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("nvidia-smi");
        std::fs::write(
            &fake,
            "#!/bin/sh\necho 'NVIDIA-SMI has failed because it could not communicate with the NVIDIA driver.'\nexit 9\n",
        )
        .unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let probe = NvidiaSmiProbe::new(fake);
        assert_eq!(probe.detect_encoder().await.class, EncoderClass::Cpu);
    }

    #[tokio::test]
    async fn fixed_encoder_returns_its_profile() {
        assert_eq!(FixedEncoder::cpu().detect_encoder().await, EncoderProfile::cpu());
        let gpu = FixedEncoder(EncoderProfile::nvenc());
        assert!(gpu.detect_encoder().await.is_gpu());
    }

    #[test]
    fn profile_labels() {
        assert_eq!(EncoderProfile::nvenc().label(), "h264_nvenc (GPU)");
        assert_eq!(EncoderProfile::cpu().label(), "libx264 (CPU)");
    }
}
