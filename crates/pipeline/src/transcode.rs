//! FFmpeg transcoder adapter: argument construction, progress streaming,
//! exit classification and cooperative cancellation.
//!
//! The child writes key=value progress records to its standard output
//! (`-progress pipe:1`); a pluggable parser turns them into positions, which
//! the adapter publishes as `JobProgress` events at most once per wall
//! second per job. Output is written to a `.tmp` sibling and renamed into
//! place only on success.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use av1_batch_config::{
    container_for_args, extract_quality_flag, select_encoder_args, AppConfig,
};

use crate::bus::EventBus;
use crate::domain::{tmp_output_path, CompressionJob, QualityDecision, Rotation};
use crate::events::Event;

/// Diagnostic written into error markers for capability failures; discovery
/// keys CPU-fallback retries off this exact text.
pub const HW_CAP_MESSAGE: &str = "Hardware is lacking required capabilities";

/// Exit code NVENC returns when the hardware session cannot be created.
const HW_CAP_EXIT_CODE: i32 = 187;

/// Grace period between the cooperative quit request and a hard kill.
pub const CANCEL_GRACE: Duration = Duration::from_secs(10);

/// Minimum spacing of progress events per job.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// How many trailing diagnostic lines are kept for error messages.
const STDERR_TAIL_LINES: usize = 40;

/// Error type for transcoder invocation. Everything after a successful
/// spawn is expressed through [`TranscodeResult`] instead.
#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("Failed to spawn ffmpeg: {0}")]
    Spawn(std::io::Error),

    #[error("ffmpeg I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Classified termination of one transcoder run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscodeResult {
    /// Exit 0 and the output file is in place.
    Completed,
    /// The hardware path cannot service this request.
    HwCapExceeded,
    /// Cancellation fired and the child was terminated; partial output
    /// removed.
    Interrupted,
    /// Any other non-zero exit.
    Failed(String),
}

/// A position report extracted from one progress line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressUpdate {
    pub out_time_secs: f64,
}

/// Boundary for the tool-specific progress format.
pub trait ProgressParser: Send + Sync {
    fn parse_line(&self, line: &str) -> Option<ProgressUpdate>;
}

/// Default parser for ffmpeg `-progress` key=value records.
#[derive(Debug, Default)]
pub struct FfmpegProgressParser;

impl ProgressParser for FfmpegProgressParser {
    fn parse_line(&self, line: &str) -> Option<ProgressUpdate> {
        let value = line.strip_prefix("out_time=")?.trim();
        let secs = parse_clock(value)?;
        Some(ProgressUpdate { out_time_secs: secs })
    }
}

fn parse_clock(text: &str) -> Option<f64> {
    let mut parts = text.split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    let total = hours * 3600.0 + minutes * 60.0 + seconds;
    (total >= 0.0).then_some(total)
}

/// Fixed audio policy: lossless sources are re-encoded to AAC 256k, AAC/MP3
/// are stream-copied, anything else becomes AAC 192k, and a silent source
/// stays silent.
pub fn select_audio_options(audio_codec: Option<&str>) -> (Vec<String>, &'static str) {
    let Some(raw) = audio_codec else {
        return (vec!["-an".into()], "none");
    };
    // Normalize away profile decorations ("aac (LC)" -> "aac").
    let codec = raw
        .split(|c: char| c == ',' || c == '(' || c.is_whitespace())
        .next()
        .unwrap_or("")
        .to_lowercase();

    const LOSSLESS: &[&str] = &["flac", "alac", "truehd", "mlp", "wavpack", "ape", "tta"];

    if codec.is_empty() {
        return (
            vec!["-c:a".into(), "aac".into(), "-b:a".into(), "192k".into()],
            "aac 192k",
        );
    }
    if codec.starts_with("pcm_") || LOSSLESS.contains(&codec.as_str()) {
        return (
            vec!["-c:a".into(), "aac".into(), "-b:a".into(), "256k".into()],
            "aac 256k",
        );
    }
    if codec == "aac" || codec == "mp3" {
        return (vec!["-c:a".into(), "copy".into()], "copy");
    }
    (
        vec!["-c:a".into(), "aac".into(), "-b:a".into(), "192k".into()],
        "aac 192k",
    )
}

fn rotation_filter(rotation: Rotation) -> Option<&'static str> {
    match rotation {
        Rotation::None => None,
        Rotation::R90 => Some("transpose=1"),
        Rotation::R180 => Some("transpose=2,transpose=2"),
        Rotation::R270 => Some("transpose=2"),
    }
}

fn push_split_entry(args: &mut Vec<String>, entry: &str) {
    let trimmed = entry.trim();
    if trimmed.is_empty() {
        return;
    }
    match trimmed.split_once(char::is_whitespace) {
        Some((flag, value)) => {
            args.push(flag.to_string());
            args.push(value.trim().to_string());
        }
        None => args.push(trimmed.to_string()),
    }
}

/// Build the complete ffmpeg argument vector for one job.
pub fn build_transcode_args(
    job: &CompressionJob,
    config: &AppConfig,
    use_gpu: bool,
    quality: &QualityDecision,
    rotation: Rotation,
    input_path: &Path,
) -> Vec<String> {
    let encoder_args = select_encoder_args(config, use_gpu);
    let quality_flag = extract_quality_flag(encoder_args);
    let container = container_for_args(encoder_args);

    let mut args: Vec<String> = vec!["-y".into()];
    if use_gpu {
        args.push("-vsync".into());
        args.push("0".into());
    }
    args.push("-fflags".into());
    args.push("+genpts+igndts".into());
    args.push("-avoid_negative_ts".into());
    args.push("make_zero".into());
    args.push("-i".into());
    args.push(input_path.to_string_lossy().into_owned());

    for entry in encoder_args {
        let flag = entry.trim().split_whitespace().next().unwrap_or("");
        // The container flag moves to the end; quality/bitrate entries are
        // replaced according to the decision below.
        if flag == "-f" {
            continue;
        }
        match quality {
            QualityDecision::Cq(value) => {
                if Some(flag) == quality_flag {
                    args.push(flag.to_string());
                    args.push(value.to_string());
                    continue;
                }
            }
            QualityDecision::Rate(_) => {
                if Some(flag) == quality_flag || flag == "-b:v" {
                    continue;
                }
            }
        }
        push_split_entry(&mut args, entry);
    }

    if let QualityDecision::Rate(rate) = quality {
        args.push("-b:v".into());
        args.push(rate.target_bps.to_string());
        if let Some(minrate) = rate.minrate_bps {
            args.push("-minrate".into());
            args.push(minrate.to_string());
        }
        if let Some(maxrate) = rate.maxrate_bps {
            args.push("-maxrate".into());
            args.push(maxrate.to_string());
        }
    }

    if !use_gpu {
        if let Some(threads) = config.general.ffmpeg_cpu_threads {
            args.push("-threads".into());
            args.push(threads.to_string());
        }
    }

    let audio_codec = job
        .source
        .metadata
        .as_ref()
        .and_then(|m| m.audio_codec.as_deref());
    let (audio_args, _) = select_audio_options(audio_codec);
    args.extend(audio_args);

    if config.general.copy_metadata {
        args.push("-map_metadata".into());
        args.push("0".into());
        args.push("-movflags".into());
        args.push("use_metadata_tags".into());
    } else {
        args.push("-map_metadata".into());
        args.push("-1".into());
    }

    if let Some(filter) = rotation_filter(rotation) {
        args.push("-vf".into());
        args.push(filter.to_string());
    }

    args.push("-progress".into());
    args.push("pipe:1".into());
    args.push("-nostats".into());
    args.push("-hide_banner".into());
    args.push("-loglevel".into());
    args.push("error".into());

    args.push("-f".into());
    args.push(container);
    args.push(tmp_output_path(&job.output_path).to_string_lossy().into_owned());

    args
}

/// Spawns the transcoder and supervises it to completion.
pub struct TranscoderAdapter {
    ffmpeg_bin: PathBuf,
    bus: Arc<EventBus>,
    parser: Arc<dyn ProgressParser>,
}

impl TranscoderAdapter {
    pub fn new(ffmpeg_bin: PathBuf, bus: Arc<EventBus>) -> Self {
        Self {
            ffmpeg_bin,
            bus,
            parser: Arc::new(FfmpegProgressParser),
        }
    }

    /// Replace the progress parser (tests, alternative tools).
    pub fn with_parser(mut self, parser: Arc<dyn ProgressParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Run one transcode. Always waits for the child to exit before
    /// returning; on cancellation a cooperative quit is attempted first,
    /// then a kill after the grace period, and the `.tmp` partial output is
    /// removed.
    pub async fn transcode(
        &self,
        job: &CompressionJob,
        config: &AppConfig,
        use_gpu: bool,
        quality: &QualityDecision,
        rotation: Rotation,
        input_path: &Path,
        cancellation: &CancellationToken,
    ) -> Result<TranscodeResult, TranscodeError> {
        let args = build_transcode_args(job, config, use_gpu, quality, rotation, input_path);
        let tmp_path = tmp_output_path(&job.output_path);
        let filename = job.file_name();

        debug!("ffmpeg args for {filename}: {}", args.join(" "));

        let mut child = Command::new(&self.ffmpeg_bin)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(TranscodeError::Spawn)?;

        let stdout = child.stdout.take().expect("ffmpeg stdout is piped");
        let stderr = child.stderr.take().expect("ffmpeg stderr is piped");
        let mut stdin = child.stdin.take().expect("ffmpeg stdin is piped");

        // Progress reader: parse positions, publish at a bounded rate.
        let bus = self.bus.clone();
        let parser = self.parser.clone();
        let progress_job = job.clone();
        let total_duration = job
            .source
            .metadata
            .as_ref()
            .map(|m| m.duration_secs)
            .unwrap_or(0.0);
        let stdout_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut last_emit: Option<Instant> = None;
            while let Ok(Some(line)) = lines.next_line().await {
                let Some(update) = parser.parse_line(&line) else {
                    continue;
                };
                if total_duration <= 0.0 {
                    continue;
                }
                let due = last_emit
                    .map(|at| at.elapsed() >= PROGRESS_INTERVAL)
                    .unwrap_or(true);
                if !due {
                    continue;
                }
                last_emit = Some(Instant::now());
                let percent = (update.out_time_secs / total_duration * 100.0).min(100.0);
                bus.publish(Event::JobProgress {
                    job: progress_job.clone(),
                    percent,
                });
            }
        });

        // Diagnostics reader: keep a bounded tail and watch for capability
        // failures.
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut tail: Vec<String> = Vec::new();
            let mut hw_cap = false;
            while let Ok(Some(line)) = lines.next_line().await {
                if line.contains(HW_CAP_MESSAGE)
                    || line.contains("No capable devices found")
                    || (line.to_lowercase().contains("nvenc") && line.contains("not supported"))
                {
                    hw_cap = true;
                }
                if tail.len() >= STDERR_TAIL_LINES {
                    tail.remove(0);
                }
                tail.push(line);
            }
            (hw_cap, tail)
        });

        let mut interrupted = false;
        let finished = tokio::select! {
            status = child.wait() => Some(status?),
            _ = cancellation.cancelled() => None,
        };
        let status = match finished {
            Some(status) => status,
            None => {
                interrupted = true;
                info!("Interrupting transcode of {filename}");
                // Cooperative quit first; ffmpeg finalizes and exits on 'q'.
                let _ = stdin.write_all(b"q").await;
                let _ = stdin.flush().await;
                match tokio::time::timeout(CANCEL_GRACE, child.wait()).await {
                    Ok(status) => status?,
                    Err(_) => {
                        warn!("Transcoder ignored quit for {filename}; killing");
                        child.start_kill()?;
                        child.wait().await?
                    }
                }
            }
        };
        drop(stdin);

        stdout_task.abort();
        let (hw_cap, stderr_tail) = stderr_task.await.unwrap_or((false, Vec::new()));

        if interrupted {
            remove_partial(&tmp_path);
            return Ok(TranscodeResult::Interrupted);
        }

        if hw_cap || status.code() == Some(HW_CAP_EXIT_CODE) {
            remove_partial(&tmp_path);
            return Ok(TranscodeResult::HwCapExceeded);
        }

        if !status.success() {
            remove_partial(&tmp_path);
            let code = status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            let tail = stderr_tail.join("\n");
            let message = if tail.trim().is_empty() {
                format!("ffmpeg exited with code {code}")
            } else {
                format!("ffmpeg exited with code {code}: {}", tail.trim())
            };
            return Ok(TranscodeResult::Failed(message));
        }

        if !tmp_path.exists() {
            return Ok(TranscodeResult::Failed(
                "ffmpeg exited cleanly but produced no output".to_string(),
            ));
        }
        std::fs::rename(&tmp_path, &job.output_path)?;
        Ok(TranscodeResult::Completed)
    }
}

fn remove_partial(tmp_path: &Path) {
    if tmp_path.exists() {
        if let Err(e) = std::fs::remove_file(tmp_path) {
            warn!("Failed to remove partial output {}: {e}", tmp_path.display());
        }
    }
}
