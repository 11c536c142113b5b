//! Domain model: discovered files, their metadata, and transcoding jobs.

use std::path::PathBuf;
use std::sync::Arc;

use av1_batch_config::{CameraQualityRule, ConfigSource, ResolvedRateControl};
use serde::{Deserialize, Serialize};

/// Color-space sentinel that triggers the remux pre-step.
pub const COLOR_SPACE_RESERVED: &str = "reserved";

/// Stream and camera information resolved for a source file.
///
/// Immutable once attached to a [`VideoFile`]; shared through the metadata
/// cache.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub width: u32,
    pub height: u32,
    /// Primary video codec name (h264, hevc, av1, ...).
    pub codec: String,
    /// Primary audio codec name; None when the file has no audio stream.
    pub audio_codec: Option<String>,
    pub fps: f64,
    /// Camera pattern that matched a per-camera override, if any.
    pub camera_model: Option<String>,
    /// Raw camera string from the metadata fields, before pattern matching.
    pub camera_raw: Option<String>,
    /// Per-camera quality override carried from the matched pattern.
    pub quality_override: Option<CameraQualityRule>,
    pub bitrate_kbps: Option<f64>,
    pub color_space: Option<String>,
    pub pix_fmt: Option<String>,
    pub duration_secs: f64,
    /// Set when the file carries the custom tag written by this system.
    pub previously_encoded: bool,
}

impl VideoMetadata {
    /// True when the probed color space is the sentinel value that FFmpeg
    /// rejects and the remux pre-step rewrites.
    pub fn has_reserved_color_space(&self) -> bool {
        self.color_space.as_deref() == Some(COLOR_SPACE_RESERVED)
    }

    /// Source bitrate in bits per second, when known and positive.
    pub fn source_bps(&self) -> Option<f64> {
        self.bitrate_kbps.filter(|kbps| *kbps > 0.0).map(|kbps| kbps * 1000.0)
    }
}

/// A discovered video file to process.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFile {
    pub path: PathBuf,
    /// Size snapshot taken at discovery time.
    pub size_bytes: u64,
    pub metadata: Option<Arc<VideoMetadata>>,
}

impl VideoFile {
    pub fn new(path: PathBuf, size_bytes: u64) -> Self {
        Self {
            path,
            size_bytes,
            metadata: None,
        }
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// Lifecycle state of a transcoding job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    /// Completed, but savings were below the threshold; output is a copy of
    /// the original.
    KeptOriginal,
    Failed,
    /// The transcoder reported the hardware path cannot service the request.
    HwCapExceeded,
    /// Dropped by a filter before any transcoding work.
    Skipped,
    /// Cancelled by an immediate interrupt.
    Interrupted,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::KeptOriginal => "kept_original",
            JobStatus::Failed => "failed",
            JobStatus::HwCapExceeded => "hw_cap_exceeded",
            JobStatus::Skipped => "skipped",
            JobStatus::Interrupted => "interrupted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Processing)
    }
}

/// Resolved quality target for one job.
#[derive(Debug, Clone, PartialEq)]
pub enum QualityDecision {
    /// Constant-quality index.
    Cq(u8),
    /// Bitrate targets in bits per second.
    Rate(ResolvedRateControl),
}

/// Rotation applied through the transcoder filter chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
    #[default]
    None,
    R90,
    R180,
    R270,
}

impl Rotation {
    pub fn from_degrees(degrees: u16) -> Option<Self> {
        match degrees {
            0 => Some(Rotation::None),
            90 => Some(Rotation::R90),
            180 => Some(Rotation::R180),
            270 => Some(Rotation::R270),
            _ => None,
        }
    }

    pub fn degrees(&self) -> u16 {
        match self {
            Rotation::None => 0,
            Rotation::R90 => 90,
            Rotation::R180 => 180,
            Rotation::R270 => 270,
        }
    }
}

/// A transcoding job from admission to its terminal state.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressionJob {
    pub source: VideoFile,
    pub status: JobStatus,
    pub output_path: PathBuf,
    pub error_path: PathBuf,
    pub output_size_bytes: Option<u64>,
    pub error_message: Option<String>,
    /// Wall-clock seconds spent inside the transcoder.
    pub duration_seconds: Option<f64>,
    pub rotation: Rotation,
    pub quality: Option<QualityDecision>,
    /// Short quality string for the dashboard (e.g. `CQ45`, `24 Mbps`).
    pub quality_display: String,
    pub progress_percent: f64,
    pub config_source: ConfigSource,
}

impl CompressionJob {
    pub fn new(source: VideoFile, output_path: PathBuf) -> Self {
        let error_path = error_marker_path(&output_path);
        Self {
            source,
            status: JobStatus::Pending,
            output_path,
            error_path,
            output_size_bytes: None,
            error_message: None,
            duration_seconds: None,
            rotation: Rotation::None,
            quality: None,
            quality_display: String::new(),
            progress_percent: 0.0,
            config_source: ConfigSource::Global,
        }
    }

    pub fn file_name(&self) -> String {
        self.source.file_name()
    }
}

/// Error-marker path for an output: same stem, `.err` extension.
pub fn error_marker_path(output_path: &std::path::Path) -> PathBuf {
    output_path.with_extension("err")
}

/// Temporary output written while the transcoder runs.
pub fn tmp_output_path(output_path: &std::path::Path) -> PathBuf {
    output_path.with_extension("tmp")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn rotation_round_trips_degrees() {
        for degrees in [0u16, 90, 180, 270] {
            let rotation = Rotation::from_degrees(degrees).unwrap();
            assert_eq!(rotation.degrees(), degrees);
        }
        assert_eq!(Rotation::from_degrees(45), None);
    }

    #[test]
    fn status_terminality() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        for status in [
            JobStatus::Completed,
            JobStatus::KeptOriginal,
            JobStatus::Failed,
            JobStatus::HwCapExceeded,
            JobStatus::Skipped,
            JobStatus::Interrupted,
        ] {
            assert!(status.is_terminal(), "{status:?} should be terminal");
        }
    }

    #[test]
    fn marker_and_tmp_paths_are_siblings() {
        let output = Path::new("/out/trip/clip.mp4");
        assert_eq!(error_marker_path(output), Path::new("/out/trip/clip.err"));
        assert_eq!(tmp_output_path(output), Path::new("/out/trip/clip.tmp"));
    }

    #[test]
    fn reserved_color_space_detection() {
        let mut metadata = VideoMetadata {
            codec: "hevc".into(),
            ..Default::default()
        };
        assert!(!metadata.has_reserved_color_space());
        metadata.color_space = Some("bt709".into());
        assert!(!metadata.has_reserved_color_space());
        metadata.color_space = Some(COLOR_SPACE_RESERVED.into());
        assert!(metadata.has_reserved_color_space());
    }

    #[test]
    fn source_bps_needs_positive_bitrate() {
        let mut metadata = VideoMetadata::default();
        assert_eq!(metadata.source_bps(), None);
        metadata.bitrate_kbps = Some(0.0);
        assert_eq!(metadata.source_bps(), None);
        metadata.bitrate_kbps = Some(42_000.0);
        assert_eq!(metadata.source_bps(), Some(42_000_000.0));
    }
}
