//! Color-space remux pre-step.
//!
//! Some sources carry the reserved color-space sentinel, which newer FFmpeg
//! releases refuse to encode from. For the known-problematic codecs the fix
//! is a zero-re-encode remux that stamps standard primaries, transfer and
//! matrix values; the remuxed intermediate then feeds the real transcode.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

use crate::domain::VideoMetadata;

/// Upper bound on the remux; it is a stream copy, so this is generous.
const REMUX_TIMEOUT: Duration = Duration::from_secs(300);

/// Scoped intermediate file, removed on every exit path.
#[derive(Debug)]
pub struct TempFileGuard {
    path: PathBuf,
}

impl TempFileGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!("Failed to clean up intermediate {}: {e}", self.path.display());
            }
        }
    }
}

fn bitstream_filter_for(codec: &str) -> Option<&'static str> {
    match codec {
        "hevc" => Some(
            "hevc_metadata=colour_primaries=1:transfer_characteristics=1:matrix_coefficients=1",
        ),
        "h264" => Some(
            "h264_metadata=colour_primaries=1:transfer_characteristics=1:matrix_coefficients=1",
        ),
        _ => None,
    }
}

/// Whether the pre-step applies to this source at all.
pub fn needs_color_fix(metadata: &VideoMetadata) -> bool {
    metadata.has_reserved_color_space() && bitstream_filter_for(&metadata.codec).is_some()
}

/// Produce the remuxed intermediate next to the output path.
///
/// Returns the guard owning the intermediate; use [`TempFileGuard::path`]
/// as the transcoder input. A failed remux is an error, which the caller
/// treats as a failed job.
pub async fn apply_color_fix(
    ffmpeg_bin: &Path,
    input: &Path,
    output_path: &Path,
    metadata: &VideoMetadata,
) -> Result<TempFileGuard, String> {
    let filter = bitstream_filter_for(&metadata.codec)
        .ok_or_else(|| format!("no color-space fix for codec {}", metadata.codec))?;

    let stem = output_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("input");
    let intermediate = output_path.with_file_name(format!("{stem}_colorfix.mp4"));
    if let Some(parent) = intermediate.parent() {
        std::fs::create_dir_all(parent).map_err(|e| format!("cannot create {}: {e}", parent.display()))?;
    }
    let guard = TempFileGuard {
        path: intermediate.clone(),
    };

    let mut cmd = Command::new(ffmpeg_bin);
    cmd.arg("-y")
        .arg("-i")
        .arg(input)
        .arg("-c")
        .arg("copy")
        .arg("-bsf:v")
        .arg(filter)
        .arg("-hide_banner")
        .arg("-loglevel")
        .arg("error")
        .arg(&intermediate)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    let output = tokio::time::timeout(REMUX_TIMEOUT, cmd.output())
        .await
        .map_err(|_| format!("color-space remux timed out for {}", input.display()))?
        .map_err(|e| format!("failed to run color-space remux: {e}"))?;

    if !output.status.success() || !intermediate.exists() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "color-space remux failed for {}: {}",
            input.display(),
            stderr.trim()
        ));
    }

    info!("Fixed reserved color space for {}", input.display());
    Ok(guard)
}
