//! Merge stage: stream-copy concat or crossfade, then the optional music overlay.
//!
//! The output is assembled under a `.part` sibling of the destination and
//! renamed into place once complete, so a failed or cancelled merge never
//! leaves a truncated file at the user's path.

use crate::config::MergeMode;
use crate::error::{MergeError, mentions_gpu_path};
use crate::types::Event;
use crate::utils;
use crate::workers::{
    CrossfadeClip, CrossfadeRequest, EncoderProfile, MediaInfo, OverlayRequest, TransferProgress,
};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use super::Pipeline;
use super::events::ProgressAggregator;

/// Result of a successful merge
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// Final output file
    pub path: PathBuf,
    /// Whether background music was mixed in
    pub music_applied: bool,
}

/// Frame rates closer than this are considered identical
const FPS_TOLERANCE: f64 = 0.01;

/// Check that every clip can be joined by stream copy
///
/// Compares each clip against the first: video codec, frame size, pixel
/// format, frame rate, and the audio codec / sample rate / channel layout.
pub(crate) fn check_concat_compatible(infos: &[MediaInfo]) -> Result<(), MergeError> {
    let Some(first) = infos.first() else {
        return Err(MergeError::NoInputs);
    };
    let Some(reference) = &first.video else {
        return Err(MergeError::Incompatible {
            reason: "clip 1 has no video stream".to_string(),
        });
    };

    for (i, info) in infos.iter().enumerate().skip(1) {
        let n = i + 1;
        let incompatible = |reason: String| Err(MergeError::Incompatible { reason });

        let Some(video) = &info.video else {
            return incompatible(format!("clip {} has no video stream", n));
        };
        if video.codec != reference.codec {
            return incompatible(format!(
                "clip {} video codec is {}, clip 1 is {}",
                n, video.codec, reference.codec
            ));
        }
        if (video.width, video.height) != (reference.width, reference.height) {
            return incompatible(format!(
                "clip {} is {}x{}, clip 1 is {}x{}",
                n, video.width, video.height, reference.width, reference.height
            ));
        }
        if video.pix_fmt != reference.pix_fmt {
            return incompatible(format!(
                "clip {} pixel format is {}, clip 1 is {}",
                n,
                video.pix_fmt.as_deref().unwrap_or("unknown"),
                reference.pix_fmt.as_deref().unwrap_or("unknown")
            ));
        }
        match (video.fps, reference.fps) {
            (Some(a), Some(b)) if (a - b).abs() > FPS_TOLERANCE => {
                return incompatible(format!("clip {} runs at {:.3} fps, clip 1 at {:.3} fps", n, a, b));
            }
            _ => {}
        }

        match (&info.audio, &first.audio) {
            (None, None) => {}
            (Some(audio), Some(ref_audio)) => {
                if audio.codec != ref_audio.codec {
                    return incompatible(format!(
                        "clip {} audio codec is {}, clip 1 is {}",
                        n, audio.codec, ref_audio.codec
                    ));
                }
                if audio.sample_rate != ref_audio.sample_rate {
                    return incompatible(format!(
                        "clip {} audio is sampled at {:?} Hz, clip 1 at {:?} Hz",
                        n, audio.sample_rate, ref_audio.sample_rate
                    ));
                }
                if audio.channels != ref_audio.channels {
                    return incompatible(format!(
                        "clip {} has {:?} audio channels, clip 1 has {:?}",
                        n, audio.channels, ref_audio.channels
                    ));
                }
            }
            (Some(_), None) | (None, Some(_)) => {
                return incompatible(format!("clip {} and clip 1 differ in having an audio track", n));
            }
        }
    }
    Ok(())
}

impl Pipeline {
    /// Join `clips` (in order) into `output`
    ///
    /// Runs once per batch. Any error is batch-fatal; the normalized
    /// artifacts stay cached.
    pub(crate) async fn merge_stage(
        &self,
        clips: &[PathBuf],
        output: &Path,
        aggregate: &ProgressAggregator,
        cancel: &CancellationToken,
    ) -> Result<MergeOutcome, MergeError> {
        if clips.is_empty() {
            return Err(MergeError::NoInputs);
        }

        if let Some(parent) = output.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| output_error(output, e))?;
        }

        let temp = utils::part_path(output);
        let result = self.merge_into(clips, &temp, aggregate, cancel).await;
        let music_applied = match result {
            Ok(applied) => applied,
            Err(e) => {
                tokio::fs::remove_file(&temp).await.ok();
                return Err(e);
            }
        };

        if let Err(e) = utils::move_file(&temp, output).await {
            tokio::fs::remove_file(&temp).await.ok();
            return Err(MergeError::Output {
                path: output.to_path_buf(),
                reason: e.to_string(),
            });
        }

        tracing::info!(output = %output.display(), clips = clips.len(), music_applied, "merge complete");
        Ok(MergeOutcome {
            path: output.to_path_buf(),
            music_applied,
        })
    }

    /// Write the merged (and possibly music-mixed) result to `temp`
    async fn merge_into(
        &self,
        clips: &[PathBuf],
        temp: &Path,
        aggregate: &ProgressAggregator,
        cancel: &CancellationToken,
    ) -> Result<bool, MergeError> {
        let processor = &self.workers.processor;
        let infos = futures::future::try_join_all(clips.iter().map(|clip| async move {
            processor
                .probe(clip)
                .await
                .map_err(|e| MergeError::WorkerFailed(format!("cannot probe {}: {}", clip.display(), e)))
        }))
        .await?;

        let mode = self.config.merge.mode;
        let format = self.config.output.format;
        self.emit_event(Event::MergeStarted {
            mode,
            clips: clips.len(),
        });
        tracing::info!(mode = ?mode, clips = clips.len(), "merging");

        match mode {
            MergeMode::FastConcat => {
                check_concat_compatible(&infos)?;
                if let [single] = clips {
                    tokio::fs::copy(single, temp)
                        .await
                        .map_err(|e| output_error(temp, e))?;
                } else {
                    processor.concat(clips, temp, format, cancel).await?;
                }
            }
            MergeMode::Crossfade => {
                let clips: Vec<CrossfadeClip> = clips
                    .iter()
                    .zip(&infos)
                    .map(|(path, info)| CrossfadeClip {
                        path: path.clone(),
                        duration_secs: info.duration_secs,
                    })
                    .collect();
                self.crossfade(&clips, temp, aggregate, cancel).await?;
            }
        }

        match &self.config.merge.music_path {
            Some(music) => self.overlay_music(temp, music, cancel).await,
            None => Ok(false),
        }
    }

    /// Crossfade with the pipeline encoder, falling back to CPU on a GPU-path failure
    async fn crossfade(
        &self,
        clips: &[CrossfadeClip],
        temp: &Path,
        aggregate: &ProgressAggregator,
        cancel: &CancellationToken,
    ) -> Result<(), MergeError> {
        let on_progress = |progress: TransferProgress| {
            if let Some(percent) = progress.percent {
                aggregate.merge_progress(percent);
            }
        };
        let processor = &self.workers.processor;
        let first = self.crossfade_request(clips, temp, &self.encoder);
        match processor.crossfade(&first, &on_progress, cancel).await {
            Err(MergeError::WorkerFailed(message))
                if self.encoder.is_gpu() && mentions_gpu_path(&message) =>
            {
                tracing::warn!(error = %message, "GPU crossfade failed, retrying with the CPU encoder");
                let cpu = EncoderProfile::cpu();
                let fallback = self.crossfade_request(clips, temp, &cpu);
                processor.crossfade(&fallback, &on_progress, cancel).await
            }
            other => other,
        }
    }

    fn crossfade_request<'a>(
        &'a self,
        clips: &'a [CrossfadeClip],
        output: &'a Path,
        encoder: &'a EncoderProfile,
    ) -> CrossfadeRequest<'a> {
        CrossfadeRequest {
            clips,
            output,
            fade_secs: self.config.merge.fade_duration_secs,
            encoder,
            audio_bitrate: &self.config.normalize.audio_bitrate,
            format: self.config.output.format,
        }
    }

    /// Mix the background track into `temp` in place
    ///
    /// A failed overlay keeps the un-mixed output and is reported; only a
    /// cancel propagates.
    async fn overlay_music(
        &self,
        temp: &Path,
        music: &Path,
        cancel: &CancellationToken,
    ) -> Result<bool, MergeError> {
        let format = self.config.output.format;
        let mixed = temp.with_extension(format!("music.{}", format.extension()));
        let request = OverlayRequest {
            video: temp,
            music,
            volume: self.config.merge.music_volume,
            output: &mixed,
            audio_bitrate: &self.config.normalize.audio_bitrate,
            format,
        };

        let result = match self.workers.processor.overlay_audio(&request, cancel).await {
            Ok(()) => utils::move_file(&mixed, temp)
                .await
                .map_err(|e| MergeError::WorkerFailed(format!("cannot replace merged output: {}", e))),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                tracing::info!(music = %music.display(), "background music mixed in");
                Ok(true)
            }
            Err(MergeError::Cancelled) => {
                tokio::fs::remove_file(&mixed).await.ok();
                Err(MergeError::Cancelled)
            }
            Err(e) => {
                tokio::fs::remove_file(&mixed).await.ok();
                tracing::warn!(error = %e, "music overlay failed, keeping the output without music");
                self.emit_event(Event::MusicOverlayFailed {
                    error: e.to_string(),
                });
                Ok(false)
            }
        }
    }
}

fn output_error(path: &Path, e: std::io::Error) -> MergeError {
    MergeError::Output {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}
