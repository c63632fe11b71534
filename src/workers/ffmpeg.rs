//! Media processing worker backed by the external `ffmpeg` and `ffprobe` binaries

use super::process::{Finished, RunError, StreamKind, run_monitored};
use super::progress::{FfmpegProgress, TransferProgress, parse_ffmpeg_progress_line};
use super::traits::{
    AudioStreamInfo, CrossfadeClip, CrossfadeRequest, EncoderProfile, MediaInfo, MediaProcessor,
    NormalizeRequest, OverlayRequest, ProgressFn, VideoStreamInfo,
};
use crate::cache::NormalizeTarget;
use crate::config::{ContainerFormat, ScalePolicy};
use crate::error::{MergeError, ProcessingError};
use crate::utils;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Clip length assumed by the crossfade offsets when probing gave none
const DEFAULT_CLIP_SECS: f64 = 5.0;

/// Builder for ffmpeg invocations with any number of inputs
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    inputs: Vec<(Vec<String>, String)>,
    output_args: Vec<String>,
    output: PathBuf,
}

impl FfmpegCommand {
    /// Command writing to `output`
    pub fn new(output: impl AsRef<Path>) -> Self {
        Self {
            inputs: Vec::new(),
            output_args: Vec::new(),
            output: output.as_ref().to_path_buf(),
        }
    }

    /// Add an input file preceded by its input options
    pub fn input<I, S>(mut self, source: impl AsRef<Path>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs.push((
            args.into_iter().map(Into::into).collect(),
            source.as_ref().to_string_lossy().to_string(),
        ));
        self
    }

    /// Add a lavfi source (`anullsrc=...`)
    pub fn lavfi_input(mut self, graph: impl Into<String>) -> Self {
        self.inputs
            .push((vec!["-f".into(), "lavfi".into()], graph.into()));
        self
    }

    /// Add one output option
    pub fn output_arg(mut self, arg: impl Into<String>) -> Self {
        self.output_args.push(arg.into());
        self
    }

    /// Add several output options
    pub fn output_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Map an input stream or filter label into the output
    pub fn map(self, spec: impl Into<String>) -> Self {
        self.output_arg("-map").output_arg(spec)
    }

    /// Set the filter graph
    pub fn filter_complex(self, graph: impl Into<String>) -> Self {
        self.output_arg("-filter_complex").output_arg(graph)
    }

    /// Move the index to the front of mp4 outputs
    pub fn faststart_for(self, format: ContainerFormat) -> Self {
        match format {
            ContainerFormat::Mp4 => self.output_args(["-movflags", "+faststart"]),
            ContainerFormat::Mkv => self,
        }
    }

    /// Full argument list, progress reported as `key=value` lines on stdout
    pub fn build_args(&self) -> Vec<String> {
        let mut args: Vec<String> = [
            "-y",
            "-hide_banner",
            "-nostats",
            "-loglevel",
            "error",
            "-progress",
            "pipe:1",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        for (input_args, source) in &self.inputs {
            args.extend(input_args.iter().cloned());
            args.push("-i".to_string());
            args.push(source.clone());
        }
        args.extend(self.output_args.iter().cloned());
        args.push(self.output.to_string_lossy().to_string());
        args
    }
}

/// `-vf` chain fitting any source into the target frame
pub fn scale_filter(target: &NormalizeTarget) -> String {
    let (w, h, fps) = (
        target.resolution.width(),
        target.resolution.height(),
        target.fps,
    );
    match target.scale_policy {
        ScalePolicy::Letterbox => format!(
            "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2:black,setsar=1,fps={fps}"
        ),
        ScalePolicy::Crop => format!(
            "scale={w}:{h}:force_original_aspect_ratio=increase,crop={w}:{h},setsar=1,fps={fps}"
        ),
    }
}

fn encoder_args(encoder: &EncoderProfile) -> Vec<String> {
    let mut args = vec![
        "-c:v".to_string(),
        encoder.codec.clone(),
        "-preset".to_string(),
        encoder.preset.clone(),
    ];
    args.extend(encoder.quality_args.iter().cloned());
    args.extend(["-pix_fmt".to_string(), "yuv420p".to_string()]);
    args
}

/// Normalize invocation: trim, rescale, resample, synthesize silence if needed
pub fn normalize_command(request: &NormalizeRequest<'_>) -> FfmpegCommand {
    let target = request.target;
    let mut input_args = request.encoder.hwaccel_args.clone();
    let start = request.trim.start_secs();
    if start > 0.0 {
        input_args.extend(["-ss".to_string(), utils::seconds_to_timestamp(start)]);
    }

    let mut cmd = FfmpegCommand::new(request.output).input(request.input, input_args);
    if !request.input_has_audio {
        let layout = if target.audio_channels == 1 { "mono" } else { "stereo" };
        cmd = cmd.lavfi_input(format!(
            "anullsrc=channel_layout={}:sample_rate={}",
            layout, target.audio_sample_rate
        ));
    }

    if let Some(duration) = request.trim.duration() {
        cmd = cmd.output_args(["-t".to_string(), utils::seconds_to_timestamp(duration)]);
    }

    cmd = cmd
        .output_args(["-vf".to_string(), scale_filter(target)])
        .output_args(encoder_args(request.encoder))
        .output_args([
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            target.audio_bitrate.clone(),
            "-ar".to_string(),
            target.audio_sample_rate.to_string(),
            "-ac".to_string(),
            target.audio_channels.to_string(),
        ]);

    cmd = if request.input_has_audio {
        cmd.map("0:v:0").map("0:a:0")
    } else {
        cmd.map("0:v:0").map("1:a:0").output_arg("-shortest")
    };
    cmd.faststart_for(target.format)
}

/// Stream-copy concatenation through the concat demuxer
pub fn concat_command(list_file: &Path, output: &Path, format: ContainerFormat) -> FfmpegCommand {
    FfmpegCommand::new(output)
        .input(list_file, ["-f", "concat", "-safe", "0"])
        .output_args(["-c", "copy"])
        .faststart_for(format)
}

/// Filter graph chaining `xfade`/`acrossfade` between consecutive clips
///
/// Each transition starts `fade` seconds before the end of the running
/// output, so the merged length is the sum of the clips minus one fade per
/// transition. Unknown clip lengths count as [`DEFAULT_CLIP_SECS`].
pub fn crossfade_filter(clips: &[CrossfadeClip], fade: f64) -> String {
    let durations: Vec<f64> = clips
        .iter()
        .map(|c| c.duration_secs.filter(|d| *d > 0.0).unwrap_or(DEFAULT_CLIP_SECS))
        .collect();

    if durations.len() < 2 {
        return "[0:v]null[vout];[0:a]anull[aout]".to_string();
    }

    let last = durations.len() - 1;
    let mut video = Vec::with_capacity(last);
    let mut audio = Vec::with_capacity(last);
    let mut running = durations[0];

    for (i, duration) in durations.iter().enumerate().skip(1) {
        let offset = (running - fade).max(0.0);
        running = offset + duration;

        let (v_in, a_in) = if i == 1 {
            ("[0:v]".to_string(), "[0:a]".to_string())
        } else {
            (format!("[vf{}]", i - 1), format!("[af{}]", i - 1))
        };
        let (v_out, a_out) = if i == last {
            ("[vout]".to_string(), "[aout]".to_string())
        } else {
            (format!("[vf{}]", i), format!("[af{}]", i))
        };

        video.push(format!(
            "{v_in}[{i}:v]xfade=transition=fade:duration={fade}:offset={offset:.3}{v_out}"
        ));
        audio.push(format!(
            "{a_in}[{i}:a]acrossfade=d={fade}:c1=tri:c2=tri{a_out}"
        ));
    }

    video.extend(audio);
    video.join(";")
}

/// Expected length of a crossfaded merge, for progress reporting
pub fn crossfade_length(clips: &[CrossfadeClip], fade: f64) -> f64 {
    let total: f64 = clips
        .iter()
        .map(|c| c.duration_secs.filter(|d| *d > 0.0).unwrap_or(DEFAULT_CLIP_SECS))
        .sum();
    (total - fade * clips.len().saturating_sub(1) as f64).max(0.0)
}

/// Re-encoded merge with transitions
pub fn crossfade_command(request: &CrossfadeRequest<'_>) -> FfmpegCommand {
    let mut cmd = FfmpegCommand::new(request.output);
    for clip in request.clips {
        cmd = cmd.input(&clip.path, request.encoder.hwaccel_args.iter().cloned());
    }
    cmd.filter_complex(crossfade_filter(request.clips, request.fade_secs))
        .map("[vout]")
        .map("[aout]")
        .output_args(encoder_args(request.encoder))
        .output_args([
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            request.audio_bitrate.to_string(),
        ])
        .faststart_for(request.format)
}

/// Background music mix; the video stream is copied
pub fn overlay_command(request: &OverlayRequest<'_>) -> FfmpegCommand {
    let graph = format!(
        "[1:a]aloop=loop=-1:size=2e+09,volume={}[bg];[0:a][bg]amix=inputs=2:duration=first:dropout_transition=3[aout]",
        request.volume
    );
    FfmpegCommand::new(request.output)
        .input(request.video, Vec::<String>::new())
        .input(request.music, Vec::<String>::new())
        .filter_complex(graph)
        .map("0:v")
        .map("[aout]")
        .output_args([
            "-c:v".to_string(),
            "copy".to_string(),
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            request.audio_bitrate.to_string(),
            "-shortest".to_string(),
        ])
        .faststart_for(request.format)
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    format: Option<FfprobeFormat>,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    pix_fmt: Option<String>,
    sample_rate: Option<String>,
    channels: Option<u32>,
    duration: Option<String>,
}

/// Parse a frame rate string ("30000/1001" or "29.97")
fn parse_frame_rate(s: &str) -> Option<f64> {
    if let Some((num, den)) = s.split_once('/') {
        let num: f64 = num.parse().ok()?;
        let den: f64 = den.parse().ok()?;
        return (den > 0.0 && num > 0.0).then(|| num / den);
    }
    s.parse().ok().filter(|v: &f64| *v > 0.0)
}

fn parse_probe_output(json: &[u8]) -> Result<MediaInfo, String> {
    let probe: FfprobeOutput = serde_json::from_slice(json).map_err(|e| e.to_string())?;

    let video_stream = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));
    let audio_stream = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"));

    let duration_secs = probe
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .or_else(|| video_stream.and_then(|s| s.duration.as_deref()))
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0);

    let video = video_stream.map(|s| VideoStreamInfo {
        codec: s.codec_name.clone().unwrap_or_default(),
        width: s.width.unwrap_or(0),
        height: s.height.unwrap_or(0),
        fps: s
            .avg_frame_rate
            .as_deref()
            .and_then(parse_frame_rate)
            .or_else(|| s.r_frame_rate.as_deref().and_then(parse_frame_rate)),
        pix_fmt: s.pix_fmt.clone(),
    });
    let audio = audio_stream.map(|s| AudioStreamInfo {
        codec: s.codec_name.clone().unwrap_or_default(),
        sample_rate: s.sample_rate.as_deref().and_then(|r| r.parse().ok()),
        channels: s.channels,
    });

    if video.is_none() && audio.is_none() {
        return Err("no audio or video streams".to_string());
    }

    Ok(MediaInfo {
        duration_secs,
        video,
        audio,
    })
}

/// ffmpeg/ffprobe CLI wrapper
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl Ffmpeg {
    /// Wrap explicit binaries
    pub fn new(ffmpeg: PathBuf, ffprobe: PathBuf) -> Self {
        Self { ffmpeg, ffprobe }
    }

    /// Find both binaries in PATH
    pub fn from_path() -> Option<Self> {
        let ffmpeg = which::which("ffmpeg").ok()?;
        let ffprobe = which::which("ffprobe").ok()?;
        Some(Self::new(ffmpeg, ffprobe))
    }

    async fn run(
        &self,
        cmd: &FfmpegCommand,
        expected_secs: Option<f64>,
        timeout: Option<Duration>,
        progress: Option<ProgressFn<'_>>,
        cancel: &CancellationToken,
    ) -> Result<Finished, RunError> {
        let args = cmd.build_args();
        tracing::debug!(args = %args.join(" "), "running ffmpeg");

        let mut command = Command::new(&self.ffmpeg);
        command.args(&args);

        let mut current = FfmpegProgress::default();
        run_monitored(command, timeout, cancel, |kind, line| {
            if kind != StreamKind::Stdout {
                return;
            }
            if let (Some(snapshot), Some(report)) =
                (parse_ffmpeg_progress_line(line, &mut current), progress)
            {
                report(TransferProgress {
                    percent: snapshot.percent_of(expected_secs),
                    speed_bps: None,
                });
            }
        })
        .await
    }
}

fn failure_message(finished: &Finished) -> String {
    let last = finished
        .stderr_tail
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("no output");
    format!("ffmpeg exited with code {:?}: {}", finished.code(), last.trim())
}

fn merge_failure(result: Result<Finished, RunError>) -> Result<(), MergeError> {
    match result {
        Ok(finished) if finished.success() => Ok(()),
        Ok(finished) => Err(MergeError::WorkerFailed(format!(
            "{}\n{}",
            failure_message(&finished),
            finished.stderr_tail
        ))),
        Err(RunError::Cancelled) => Err(MergeError::Cancelled),
        Err(e) => Err(MergeError::WorkerFailed(format!("ffmpeg {}", e))),
    }
}

#[async_trait]
impl MediaProcessor for Ffmpeg {
    async fn probe(&self, path: &Path) -> Result<MediaInfo, ProcessingError> {
        if utils::nonempty_file_size(path).await.is_none() {
            return Err(ProcessingError::SourceMissing(path.to_path_buf()));
        }

        let output = Command::new(&self.ffprobe)
            .args(["-v", "error", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(path)
            .output()
            .await
            .map_err(|e| ProcessingError::ProbeFailed {
                path: path.to_path_buf(),
                reason: format!("failed to execute ffprobe: {}", e),
            })?;

        if !output.status.success() {
            return Err(ProcessingError::ProbeFailed {
                path: path.to_path_buf(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        parse_probe_output(&output.stdout).map_err(|reason| ProcessingError::ProbeFailed {
            path: path.to_path_buf(),
            reason,
        })
    }

    async fn normalize(
        &self,
        request: &NormalizeRequest<'_>,
        progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), ProcessingError> {
        let encoder = request.encoder.class;
        let cmd = normalize_command(request);
        let result = self
            .run(
                &cmd,
                request.expected_duration_secs,
                request.timeout,
                Some(progress),
                cancel,
            )
            .await;

        match result {
            Ok(finished) if finished.success() => Ok(()),
            Ok(finished) => Err(ProcessingError::WorkerFailed {
                message: failure_message(&finished),
                exit_code: finished.code(),
                stderr: finished.stderr_tail,
                encoder,
            }),
            Err(RunError::Timeout(secs)) => Err(ProcessingError::Timeout(secs)),
            Err(RunError::Cancelled) => Err(ProcessingError::Cancelled),
            Err(e) => Err(ProcessingError::WorkerFailed {
                message: format!("ffmpeg {}", e),
                stderr: String::new(),
                exit_code: None,
                encoder,
            }),
        }
    }

    async fn concat(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        format: ContainerFormat,
        cancel: &CancellationToken,
    ) -> Result<(), MergeError> {
        if inputs.is_empty() {
            return Err(MergeError::NoInputs);
        }

        let list_file = output.with_extension("concat.txt");
        let listing: String = inputs
            .iter()
            .map(|p| utils::concat_file_directive(p) + "\n")
            .collect();
        tokio::fs::write(&list_file, listing)
            .await
            .map_err(|e| MergeError::Output {
                path: list_file.clone(),
                reason: e.to_string(),
            })?;

        let cmd = concat_command(&list_file, output, format);
        let result = self.run(&cmd, None, None, None, cancel).await;

        if let Err(e) = tokio::fs::remove_file(&list_file).await {
            tracing::debug!(path = %list_file.display(), error = %e, "failed to remove concat list");
        }
        merge_failure(result)
    }

    async fn crossfade(
        &self,
        request: &CrossfadeRequest<'_>,
        progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), MergeError> {
        if request.clips.is_empty() {
            return Err(MergeError::NoInputs);
        }
        let cmd = crossfade_command(request);
        let expected = crossfade_length(request.clips, request.fade_secs);
        let result = self
            .run(&cmd, Some(expected), None, Some(progress), cancel)
            .await;
        merge_failure(result)
    }

    async fn overlay_audio(
        &self,
        request: &OverlayRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), MergeError> {
        let cmd = overlay_command(request);
        let result = self.run(&cmd, None, None, None, cancel).await;
        merge_failure(result)
    }

    fn name(&self) -> &'static str {
        "ffmpeg"
    }
}
