//! Metadata adapter over a long-lived `exiftool -stay_open` process.
//!
//! The external tool is single-threaded per process, so every command goes
//! through one async mutex. A dead or timed-out child is killed and
//! respawned on the next call. Copy failures never fail a job; callers
//! surface them as warnings.

use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use av1_batch_config::CameraQualityRule;

/// Custom tag names written onto every produced output. The presence of the
/// encoder tag is what marks a file as previously encoded by this system.
pub const TAG_ORIGINAL_NAME: &str = "XMP:ABOriginalName";
pub const TAG_ORIGINAL_SIZE: &str = "XMP:ABOriginalSize";
pub const TAG_QUALITY: &str = "XMP:ABQuality";
pub const TAG_ENCODER: &str = "XMP:ABEncoder";
pub const TAG_FINISHED_AT: &str = "XMP:ABFinishedAt";

const COPY_RATE_BYTES_PER_SEC: u64 = 10 * 1024 * 1024;
const COPY_TIMEOUT_FLOOR_SECS: u64 = 30;
const READY_MARKER: &str = "{ready}";

/// Error type for metadata operations.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Failed to start exiftool: {0}")]
    Spawn(std::io::Error),

    #[error("exiftool I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("exiftool timed out after {0}s")]
    Timeout(u64),

    #[error("Failed to parse exiftool output: {0}")]
    Parse(String),

    #[error("exiftool reported failure: {0}")]
    Failed(String),
}

/// Camera and tagging information resolved from the EXIF/XMP fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExifInfo {
    /// Matched per-camera pattern, or the raw camera string when nothing
    /// matched.
    pub camera_model: Option<String>,
    /// Raw camera string before pattern matching.
    pub camera_raw: Option<String>,
    /// Override carried from the first matching pattern.
    pub quality_override: Option<CameraQualityRule>,
    pub matched_pattern: Option<String>,
    pub bitrate_kbps: Option<f64>,
    /// The file carries this system's encoder tag.
    pub previously_encoded: bool,
}

/// Values stamped onto a completed output.
#[derive(Debug, Clone)]
pub struct EncodeTags {
    pub original_name: String,
    pub original_size: u64,
    pub quality: String,
    pub encoder: String,
    pub finished_at: String,
}

impl EncodeTags {
    fn tag_args(&self) -> Vec<String> {
        vec![
            format!("-{TAG_ORIGINAL_NAME}={}", self.original_name),
            format!("-{TAG_ORIGINAL_SIZE}={}", self.original_size),
            format!("-{TAG_QUALITY}={}", self.quality),
            format!("-{TAG_ENCODER}={}", self.encoder),
            format!("-{TAG_FINISHED_AT}={}", self.finished_at),
        ]
    }
}

struct ExifProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// Long-lived metadata adapter. All commands are serialized.
pub struct MetadataAdapter {
    exiftool_bin: PathBuf,
    /// Extra `-config` file forwarded to the tool (custom XMP namespace).
    config_path: Option<PathBuf>,
    process: Mutex<Option<ExifProcess>>,
}

impl MetadataAdapter {
    pub fn new(exiftool_bin: PathBuf, config_path: Option<PathBuf>) -> Self {
        Self {
            exiftool_bin,
            config_path,
            process: Mutex::new(None),
        }
    }

    /// Read the EXIF/XMP fields of a file and resolve camera information
    /// against the ordered per-camera override table.
    pub async fn extract(
        &self,
        path: &Path,
        camera_rules: &[(String, CameraQualityRule)],
    ) -> Result<ExifInfo, MetadataError> {
        let args = vec!["-j".to_string(), path.to_string_lossy().into_owned()];
        let output = self.run_command(args, COPY_TIMEOUT_FLOOR_SECS).await?;

        let parsed: Vec<Value> = serde_json::from_str(&output)
            .map_err(|e| MetadataError::Parse(format!("{e}: {output}")))?;
        let tags = parsed
            .into_iter()
            .next()
            .and_then(|v| match v {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .ok_or_else(|| MetadataError::Parse("empty exiftool result".to_string()))?;

        Ok(resolve_exif_info(&tags, camera_rules))
    }

    /// All-or-nothing metadata transfer from source onto target, plus the
    /// custom encode tags. The target is rewritten in place.
    pub async fn copy_preserved(
        &self,
        source: &Path,
        target: &Path,
        tags: &EncodeTags,
    ) -> Result<(), MetadataError> {
        let mut args = vec![
            "-m".to_string(),
            "-tagsFromFile".to_string(),
            source.to_string_lossy().into_owned(),
            "-XMP:all".to_string(),
            "-QuickTime:all".to_string(),
            "-Keys:all".to_string(),
            "-UserData:all".to_string(),
            "-EXIF:all".to_string(),
            "-GPS:all".to_string(),
            // MTS/AVCHD sources lose their container dates in MP4.
            "-QuickTime:CreateDate<DateTimeOriginal".to_string(),
            "-QuickTime:ModifyDate<DateTimeOriginal".to_string(),
            "-QuickTime:Make<Make".to_string(),
            "-QuickTime:Model<Model".to_string(),
        ];
        args.extend(tags.tag_args());
        args.push("-unsafe".to_string());
        args.push("-overwrite_original".to_string());
        args.push(target.to_string_lossy().into_owned());

        let timeout = copy_timeout_secs(target, source);
        let output = self.run_command(args, timeout).await?;
        check_update_output(&output)
    }

    /// Write only the custom encode tags onto the target (used when full
    /// metadata copy is disabled; verification still needs the tags).
    pub async fn write_tags(&self, target: &Path, tags: &EncodeTags) -> Result<(), MetadataError> {
        let mut args = tags.tag_args();
        args.push("-overwrite_original".to_string());
        args.push(target.to_string_lossy().into_owned());

        let timeout = copy_timeout_secs(target, target);
        let output = self.run_command(args, timeout).await?;
        check_update_output(&output)
    }

    /// Ask the child to exit. Safe to call multiple times.
    pub async fn shutdown(&self) {
        let mut guard = self.process.lock().await;
        if let Some(mut process) = guard.take() {
            let farewell = process.stdin.write_all(b"-stay_open\nFalse\n").await;
            if farewell.is_err() {
                let _ = process.child.start_kill();
            }
            let _ = tokio::time::timeout(Duration::from_secs(2), process.child.wait()).await;
            debug!("exiftool terminated");
        }
    }

    async fn run_command(&self, args: Vec<String>, timeout_secs: u64) -> Result<String, MetadataError> {
        let mut guard = self.process.lock().await;
        self.ensure_process(&mut guard).await?;
        let process = guard.as_mut().expect("process ensured above");

        let mut payload = String::new();
        for arg in &args {
            payload.push_str(arg);
            payload.push('\n');
        }
        payload.push_str("-execute\n");

        let result = tokio::time::timeout(Duration::from_secs(timeout_secs), async {
            process.stdin.write_all(payload.as_bytes()).await?;
            process.stdin.flush().await?;

            let mut output = String::new();
            let mut line = String::new();
            loop {
                line.clear();
                let read = process.stdout.read_line(&mut line).await?;
                if read == 0 {
                    return Err(MetadataError::Failed(
                        "exiftool exited mid-command".to_string(),
                    ));
                }
                if line.trim_end() == READY_MARKER {
                    return Ok(output);
                }
                output.push_str(&line);
            }
        })
        .await;

        match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => {
                // The session is unusable after a protocol error.
                kill_process(guard.take()).await;
                Err(e)
            }
            Err(_) => {
                kill_process(guard.take()).await;
                Err(MetadataError::Timeout(timeout_secs))
            }
        }
    }

    async fn ensure_process(
        &self,
        guard: &mut tokio::sync::MutexGuard<'_, Option<ExifProcess>>,
    ) -> Result<(), MetadataError> {
        if let Some(process) = guard.as_mut() {
            match process.child.try_wait() {
                Ok(None) => return Ok(()),
                Ok(Some(status)) => {
                    warn!("exiftool exited ({status}); respawning");
                    guard.take();
                }
                Err(e) => {
                    warn!("exiftool state unknown ({e}); respawning");
                    kill_process(guard.take()).await;
                }
            }
        }

        let mut cmd = Command::new(&self.exiftool_bin);
        if let Some(config) = &self.config_path {
            cmd.arg("-config").arg(config);
        }
        cmd.arg("-stay_open")
            .arg("True")
            .arg("-@")
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = cmd.spawn().map_err(MetadataError::Spawn)?;
        let stdin = child.stdin.take().expect("exiftool stdin is piped");
        let stdout = BufReader::new(child.stdout.take().expect("exiftool stdout is piped"));

        debug!("exiftool started");
        **guard = Some(ExifProcess {
            child,
            stdin,
            stdout,
        });
        Ok(())
    }
}

async fn kill_process(process: Option<ExifProcess>) {
    if let Some(mut process) = process {
        let _ = process.child.start_kill();
        let _ = tokio::time::timeout(Duration::from_secs(2), process.child.wait()).await;
    }
}

fn copy_timeout_secs(primary: &Path, fallback: &Path) -> u64 {
    let size = std::fs::metadata(primary)
        .or_else(|_| std::fs::metadata(fallback))
        .map(|m| m.len())
        .unwrap_or(0);
    if size == 0 {
        return COPY_TIMEOUT_FLOOR_SECS;
    }
    size.div_ceil(COPY_RATE_BYTES_PER_SEC)
        .max(COPY_TIMEOUT_FLOOR_SECS)
}

fn check_update_output(output: &str) -> Result<(), MetadataError> {
    let trimmed = output.trim();
    if trimmed.contains("files updated") && !trimmed.contains("0 image files updated") {
        Ok(())
    } else {
        Err(MetadataError::Failed(if trimmed.is_empty() {
            "no confirmation from exiftool".to_string()
        } else {
            trimmed.to_string()
        }))
    }
}

/// Tag keys tried, in order, for the raw camera string.
const CAMERA_TAG_GROUPS: &[&[&str]] = &[
    &["Model", "CameraModelName", "DeviceModelName"],
    &["Make"],
    &["HandlerVendorID"],
    &["Platform"],
];

fn lookup_tag<'a>(tags: &'a serde_json::Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    for name in names {
        if let Some((_, value)) = tags
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
        {
            return Some(value);
        }
    }
    None
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Resolve camera info from a flat tag map.
///
/// Pattern matching is a case-insensitive substring test over every string
/// field, in table order; the first hit wins and carries its override.
pub fn resolve_exif_info(
    tags: &serde_json::Map<String, Value>,
    camera_rules: &[(String, CameraQualityRule)],
) -> ExifInfo {
    let camera_raw = CAMERA_TAG_GROUPS
        .iter()
        .find_map(|group| lookup_tag(tags, group).and_then(value_to_string));

    let haystack: String = tags
        .iter()
        .filter_map(|(key, value)| value_to_string(value).map(|v| format!("{key}:{v}\n")))
        .collect::<String>()
        .to_lowercase();

    let mut camera_model = None;
    let mut quality_override = None;
    let mut matched_pattern = None;
    for (pattern, rule) in camera_rules {
        if haystack.contains(&pattern.to_lowercase()) {
            camera_model = Some(pattern.clone());
            quality_override = Some(rule.clone());
            matched_pattern = Some(pattern.clone());
            break;
        }
    }
    if camera_model.is_none() {
        camera_model = camera_raw.clone();
    }

    let bitrate_kbps = lookup_tag(tags, &["AvgBitrate"])
        .and_then(|v| match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        })
        .filter(|b| *b > 0.0)
        .map(|bps| bps / 1000.0);

    let encoder_tag_name = TAG_ENCODER.rsplit(':').next().unwrap_or(TAG_ENCODER);
    let previously_encoded = tags
        .keys()
        .any(|key| key.eq_ignore_ascii_case(encoder_tag_name));

    ExifInfo {
        camera_model,
        camera_raw,
        quality_override,
        matched_pattern,
        bitrate_kbps,
        previously_encoded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tags(value: Value) -> serde_json::Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn rules() -> Vec<(String, CameraQualityRule)> {
        vec![
            (
                "ILCE-7RM5".to_string(),
                CameraQualityRule { cq: 38, rate: None },
            ),
            ("DJI".to_string(), CameraQualityRule { cq: 41, rate: None }),
        ]
    }

    #[test]
    fn first_matching_pattern_wins() {
        let tags = tags(json!({
            "Model": "DJI Pocket 3",
            "Description": "shot on ILCE-7RM5 rig"
        }));
        let info = resolve_exif_info(&tags, &rules());
        // Table order decides, not tag order: ILCE-7RM5 is configured first.
        assert_eq!(info.matched_pattern.as_deref(), Some("ILCE-7RM5"));
        assert_eq!(info.quality_override.as_ref().unwrap().cq, 38);
        assert_eq!(info.camera_raw.as_deref(), Some("DJI Pocket 3"));
    }

    #[test]
    fn match_is_case_insensitive_substring() {
        let tags = tags(json!({"Make": "dji technology co."}));
        let info = resolve_exif_info(&tags, &rules());
        assert_eq!(info.matched_pattern.as_deref(), Some("DJI"));
    }

    #[test]
    fn unmatched_camera_falls_back_to_raw() {
        let tags = tags(json!({"Model": "GoPro HERO11"}));
        let info = resolve_exif_info(&tags, &rules());
        assert_eq!(info.matched_pattern, None);
        assert_eq!(info.quality_override, None);
        assert_eq!(info.camera_model.as_deref(), Some("GoPro HERO11"));
    }

    #[test]
    fn camera_tag_priority_prefers_model_over_make() {
        let tags = tags(json!({"Make": "Sony", "Model": "ILCE-7RM5"}));
        let info = resolve_exif_info(&tags, &[]);
        assert_eq!(info.camera_raw.as_deref(), Some("ILCE-7RM5"));
    }

    #[test]
    fn bitrate_and_encoder_tag_extraction() {
        let tags = tags(json!({
            "AvgBitrate": 42000000,
            "ABEncoder": "av1_nvenc"
        }));
        let info = resolve_exif_info(&tags, &[]);
        assert_eq!(info.bitrate_kbps, Some(42_000.0));
        assert!(info.previously_encoded);
    }

    #[test]
    fn update_confirmation_parsing() {
        assert!(check_update_output("    1 image files updated\n").is_ok());
        assert!(check_update_output("    2 image files updated\n").is_ok());
        assert!(check_update_output("    0 image files updated\n").is_err());
        assert!(check_update_output("").is_err());
    }

    #[test]
    fn encode_tags_render_custom_namespace() {
        let tags = EncodeTags {
            original_name: "clip.mov".into(),
            original_size: 1234,
            quality: "CQ45".into(),
            encoder: "av1_nvenc".into(),
            finished_at: "2026-08-02T10:00:00+02:00".into(),
        };
        let args = tags.tag_args();
        assert_eq!(args.len(), 5);
        assert!(args[0].starts_with("-XMP:ABOriginalName="));
        assert!(args.iter().any(|a| a == "-XMP:ABOriginalSize=1234"));
        assert!(args.iter().any(|a| a == "-XMP:ABEncoder=av1_nvenc"));
    }
}
