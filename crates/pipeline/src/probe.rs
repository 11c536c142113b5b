//! ffprobe adapter: one short-lived process per probe, JSON output parsed
//! into [`VideoMetadata`].
//!
//! The subprocess timeout scales with file size (10 MiB/s, 30 s floor) so a
//! probe against a stalled network mount cannot wedge a worker forever.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

use crate::domain::VideoMetadata;

/// Tag key (lowercased, spaces ignored) marking outputs produced by this
/// system. Sources carrying it are treated as already done.
pub const ENCODER_TAG_KEY: &str = "abencoder";

const PROBE_RATE_BYTES_PER_SEC: u64 = 10 * 1024 * 1024;
const PROBE_TIMEOUT_FLOOR_SECS: u64 = 30;
const MAX_REASONABLE_FPS: f64 = 240.0;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The probe binary could not be spawned.
    #[error("Failed to execute ffprobe for {path}: {source}")]
    Spawn {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The probe process exited non-zero.
    #[error("ffprobe failed for {path}: {detail}")]
    Failed { path: PathBuf, detail: String },

    /// The probe process exceeded its size-scaled deadline.
    #[error("ffprobe timed out after {timeout_secs}s for {path}")]
    Timeout { path: PathBuf, timeout_secs: u64 },

    /// The probe output was not valid JSON of the expected shape.
    #[error("Failed to parse ffprobe output for {path}: {detail}")]
    Parse { path: PathBuf, detail: String },

    /// The file has no video stream at all.
    #[error("No video stream found in {path}")]
    NoVideoStream { path: PathBuf },
}

#[derive(Debug, Clone, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    #[serde(default)]
    format: Option<ProbeFormat>,
}

#[derive(Debug, Clone, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    duration: Option<String>,
    duration_ts: Option<i64>,
    time_base: Option<String>,
    color_space: Option<String>,
    pix_fmt: Option<String>,
    #[serde(default)]
    tags: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
    bit_rate: Option<String>,
    size: Option<String>,
    #[serde(default)]
    tags: Option<HashMap<String, String>>,
}

/// Spawns `ffprobe` and translates its JSON output.
#[derive(Debug, Clone)]
pub struct ProbeAdapter {
    ffprobe_bin: PathBuf,
}

impl Default for ProbeAdapter {
    fn default() -> Self {
        Self::new(PathBuf::from("ffprobe"))
    }
}

impl ProbeAdapter {
    pub fn new(ffprobe_bin: PathBuf) -> Self {
        Self { ffprobe_bin }
    }

    /// Probe one file. Camera fields of the returned metadata are left
    /// empty; the metadata adapter fills them in.
    pub async fn stream_info(&self, path: &Path) -> Result<VideoMetadata, ProbeError> {
        let timeout_secs = estimate_timeout_secs(path);

        let mut cmd = Command::new(&self.ffprobe_bin);
        cmd.arg("-v")
            .arg("error")
            .arg("-print_format")
            .arg("json")
            .arg("-show_streams")
            .arg("-show_format")
            .arg(path);

        let output = tokio::time::timeout(Duration::from_secs(timeout_secs), cmd.output())
            .await
            .map_err(|_| ProbeError::Timeout {
                path: path.to_path_buf(),
                timeout_secs,
            })?
            .map_err(|source| ProbeError::Spawn {
                path: path.to_path_buf(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = if stderr.trim().is_empty() {
                "unknown error (no stderr)".to_string()
            } else {
                stderr.trim().to_string()
            };
            return Err(ProbeError::Failed {
                path: path.to_path_buf(),
                detail,
            });
        }

        let data: ProbeOutput =
            serde_json::from_slice(&output.stdout).map_err(|e| ProbeError::Parse {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;

        parse_probe_output(path, data)
    }
}

fn estimate_timeout_secs(path: &Path) -> u64 {
    match std::fs::metadata(path) {
        Ok(metadata) => {
            let size = metadata.len();
            let scaled = size.div_ceil(PROBE_RATE_BYTES_PER_SEC).max(1);
            scaled.max(PROBE_TIMEOUT_FLOOR_SECS)
        }
        Err(_) => PROBE_TIMEOUT_FLOOR_SECS,
    }
}

fn parse_probe_output(path: &Path, data: ProbeOutput) -> Result<VideoMetadata, ProbeError> {
    let video = data
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| ProbeError::NoVideoStream {
            path: path.to_path_buf(),
        })?;
    let audio = data
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"));

    let fps = video
        .avg_frame_rate
        .as_deref()
        .map(parse_frame_rate)
        .unwrap_or(0.0);

    let format = data.format.as_ref();
    let duration_secs = resolve_duration(video, format);

    let bitrate_kbps = format
        .and_then(|f| f.bit_rate.as_deref())
        .and_then(|raw| raw.parse::<f64>().ok())
        .filter(|bps| *bps > 0.0)
        .map(|bps| bps / 1000.0);

    let previously_encoded = has_encoder_tag(format.and_then(|f| f.tags.as_ref()))
        || has_encoder_tag(video.tags.as_ref());

    Ok(VideoMetadata {
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
        codec: video
            .codec_name
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
        audio_codec: audio.and_then(|s| s.codec_name.clone()),
        fps,
        camera_model: None,
        camera_raw: None,
        quality_override: None,
        bitrate_kbps,
        color_space: video.color_space.clone(),
        pix_fmt: video.pix_fmt.clone(),
        duration_secs,
        previously_encoded,
    })
}

/// Parse `avg_frame_rate` (`num/den` or plain number), rounding and
/// discarding values that are clearly timebases rather than frame rates.
fn parse_frame_rate(raw: &str) -> f64 {
    let candidate = if let Some((num, den)) = raw.split_once('/') {
        let num: f64 = num.parse().unwrap_or(0.0);
        let den: f64 = den.parse().unwrap_or(0.0);
        if den == 0.0 {
            return 0.0;
        }
        num / den
    } else {
        raw.parse().unwrap_or(0.0)
    };
    if candidate > 0.0 && candidate <= MAX_REASONABLE_FPS {
        candidate.round()
    } else {
        0.0
    }
}

/// Duration fallback chain: format duration, format tags, stream duration,
/// stream tags, duration_ts x time_base, then size x 8 / bitrate.
fn resolve_duration(video: &ProbeStream, format: Option<&ProbeFormat>) -> f64 {
    let mut duration = format
        .and_then(|f| f.duration.as_deref())
        .map(parse_duration_text)
        .unwrap_or(0.0);

    if duration <= 0.0 {
        duration = tag_duration(format.and_then(|f| f.tags.as_ref()));
    }
    if duration <= 0.0 {
        duration = video
            .duration
            .as_deref()
            .map(parse_duration_text)
            .unwrap_or(0.0);
    }
    if duration <= 0.0 {
        duration = tag_duration(video.tags.as_ref());
    }
    if duration <= 0.0 {
        duration = timebase_duration(video.duration_ts, video.time_base.as_deref());
    }
    if duration <= 0.0 {
        let bit_rate = format
            .and_then(|f| f.bit_rate.as_deref())
            .and_then(|raw| raw.parse::<f64>().ok())
            .unwrap_or(0.0);
        let size = format
            .and_then(|f| f.size.as_deref())
            .and_then(|raw| raw.parse::<f64>().ok())
            .unwrap_or(0.0);
        if bit_rate > 0.0 && size > 0.0 {
            duration = size * 8.0 / bit_rate;
        }
    }
    duration.max(0.0)
}

fn tag_duration(tags: Option<&HashMap<String, String>>) -> f64 {
    let Some(tags) = tags else { return 0.0 };
    tags.iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("duration"))
        .map(|(_, value)| parse_duration_text(value))
        .unwrap_or(0.0)
}

/// Accepts plain seconds or `HH:MM:SS.ss` / `MM:SS.ss` clock text.
fn parse_duration_text(raw: &str) -> f64 {
    let text = raw.trim();
    if text.is_empty() {
        return 0.0;
    }
    if let Ok(seconds) = text.parse::<f64>() {
        return seconds;
    }
    let parts: Vec<&str> = text.split(':').collect();
    let parsed: Option<Vec<f64>> = parts.iter().map(|p| p.parse::<f64>().ok()).collect();
    match parsed.as_deref() {
        Some([minutes, seconds]) => minutes * 60.0 + seconds,
        Some([hours, minutes, seconds]) => hours * 3600.0 + minutes * 60.0 + seconds,
        _ => 0.0,
    }
}

fn timebase_duration(duration_ts: Option<i64>, time_base: Option<&str>) -> f64 {
    let (Some(ticks), Some(base)) = (duration_ts, time_base) else {
        return 0.0;
    };
    let Some((num, den)) = base.split_once('/') else {
        return 0.0;
    };
    let num: f64 = num.parse().unwrap_or(0.0);
    let den: f64 = den.parse().unwrap_or(0.0);
    if den == 0.0 || ticks <= 0 {
        return 0.0;
    }
    ticks as f64 * (num / den)
}

fn has_encoder_tag(tags: Option<&HashMap<String, String>>) -> bool {
    let Some(tags) = tags else { return false };
    tags.keys().any(|key| {
        let normalized: String = key
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_lowercase();
        normalized == ENCODER_TAG_KEY
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<VideoMetadata, ProbeError> {
        let data: ProbeOutput = serde_json::from_str(json).expect("test JSON is valid");
        parse_probe_output(Path::new("/media/clip.mp4"), data)
    }

    #[test]
    fn parses_core_stream_fields() {
        let metadata = parse(
            r#"{
                "streams": [
                    {"codec_type": "video", "codec_name": "hevc", "width": 3840,
                     "height": 2160, "avg_frame_rate": "30000/1001",
                     "color_space": "bt709", "pix_fmt": "yuv420p10le"},
                    {"codec_type": "audio", "codec_name": "aac"}
                ],
                "format": {"duration": "12.5", "bit_rate": "42000000"}
            }"#,
        )
        .unwrap();

        assert_eq!(metadata.width, 3840);
        assert_eq!(metadata.height, 2160);
        assert_eq!(metadata.codec, "hevc");
        assert_eq!(metadata.audio_codec.as_deref(), Some("aac"));
        assert_eq!(metadata.fps, 30.0);
        assert_eq!(metadata.duration_secs, 12.5);
        assert_eq!(metadata.bitrate_kbps, Some(42_000.0));
        assert_eq!(metadata.color_space.as_deref(), Some("bt709"));
        assert!(!metadata.previously_encoded);
    }

    #[test]
    fn missing_video_stream_is_an_error() {
        let err = parse(r#"{"streams": [{"codec_type": "audio", "codec_name": "aac"}]}"#)
            .unwrap_err();
        assert!(matches!(err, ProbeError::NoVideoStream { .. }));
    }

    #[test]
    fn no_audio_stream_maps_to_none() {
        let metadata = parse(
            r#"{"streams": [{"codec_type": "video", "codec_name": "h264"}],
                "format": {"duration": "1.0"}}"#,
        )
        .unwrap();
        assert_eq!(metadata.audio_codec, None);
    }

    #[test]
    fn frame_rate_rejects_timebase_values() {
        assert_eq!(parse_frame_rate("30000/1001"), 30.0);
        assert_eq!(parse_frame_rate("25"), 25.0);
        assert_eq!(parse_frame_rate("90000/1"), 0.0, "timebase, not a frame rate");
        assert_eq!(parse_frame_rate("0/0"), 0.0);
        assert_eq!(parse_frame_rate("garbage"), 0.0);
    }

    #[test]
    fn duration_fallback_chain() {
        // Format tags (clock format).
        let metadata = parse(
            r#"{"streams": [{"codec_type": "video", "codec_name": "h264"}],
                "format": {"tags": {"DURATION": "00:01:30.5"}}}"#,
        )
        .unwrap();
        assert_eq!(metadata.duration_secs, 90.5);

        // duration_ts x time_base.
        let metadata = parse(
            r#"{"streams": [{"codec_type": "video", "codec_name": "h264",
                             "duration_ts": 900000, "time_base": "1/90000"}]}"#,
        )
        .unwrap();
        assert_eq!(metadata.duration_secs, 10.0);

        // size x 8 / bit_rate.
        let metadata = parse(
            r#"{"streams": [{"codec_type": "video", "codec_name": "h264"}],
                "format": {"bit_rate": "8000000", "size": "10000000"}}"#,
        )
        .unwrap();
        assert_eq!(metadata.duration_secs, 10.0);
    }

    #[test]
    fn encoder_tag_detected_in_format_or_stream() {
        let metadata = parse(
            r#"{"streams": [{"codec_type": "video", "codec_name": "av1"}],
                "format": {"duration": "1.0", "tags": {"ABEncoder": "av1_nvenc"}}}"#,
        )
        .unwrap();
        assert!(metadata.previously_encoded);

        let metadata = parse(
            r#"{"streams": [{"codec_type": "video", "codec_name": "av1",
                             "tags": {"AB Encoder": "x"}}]}"#,
        )
        .unwrap();
        assert!(metadata.previously_encoded);
    }

    #[test]
    fn duration_text_accepts_clock_formats() {
        assert_eq!(parse_duration_text("90"), 90.0);
        assert_eq!(parse_duration_text("01:30"), 90.0);
        assert_eq!(parse_duration_text("1:01:30.5"), 3690.5);
        assert_eq!(parse_duration_text("bogus"), 0.0);
    }
}
